//! The distributed 3D real-to-complex transform and its inverse.
//!
//! Each 1D stage runs along the locally contiguous axis, and the data is transposed between
//! stages with all-to-all exchanges inside a sub-group:
//!
//! - z: each owned (x, y) column, real to half-complex. Layout A: [x][y][kz].
//! - Minor-group exchange (roles sharing an x slab). Layout B: [x][kz][y], with kz split.
//! - y, along full lines.
//! - Major-group exchange (roles sharing a kz range). Layout C: [ky][kz][x], with ky split.
//! - x, along full lines.
//!
//! The solver works on layout C. The inverse runs these steps backwards. Neither direction
//! normalizes, so a round trip multiplies by nx·ny·nz.

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::{
    PmeError,
    comm::{RoleGroup, Tag},
    grid::{Decomposition, PmeGrid},
    wire::{pack_complex, unpack_complex},
};

// Transpose stages, for tags.
const STAGE_MINOR_FWD: u8 = 0;
const STAGE_MAJOR_FWD: u8 = 1;
const STAGE_MAJOR_INV: u8 = 2;
const STAGE_MINOR_INV: u8 = 3;

/// Run an FFT on each contiguous line of `buf`, in parallel.
fn fft_lines(fft: &Arc<dyn Fft<f64>>, buf: &mut [Complex<f64>]) {
    let n = fft.len();
    if n == 0 {
        return;
    }
    // Chunks of several lines, so per-call scratch allocation doesn't dominate.
    let chunk = n * 16;
    buf.par_chunks_mut(chunk).for_each(|c| fft.process(c));
}

pub struct DistributedFft {
    decomp: Decomposition,
    major: usize,
    minor: usize,
    /// Roles sharing our x slab, indexed by minor index.
    minor_group: RoleGroup,
    /// Roles sharing our kz range, indexed by major index.
    major_group: RoleGroup,
    fwd: [Arc<dyn Fft<f64>>; 3],
    inv: [Arc<dyn Fft<f64>>; 3],
}

impl DistributedFft {
    /// `group` is the whole PME group, in decomposition rank order.
    pub fn new(decomp: &Decomposition, group: &RoleGroup) -> Result<Self, PmeError> {
        if group.size() != decomp.size() {
            return Err(PmeError::Config(format!(
                "PME group has {} roles; the decomposition needs {}",
                group.size(),
                decomp.size()
            )));
        }

        let (major, minor) = decomp.coords(group.rank());

        let minor_ranks: Vec<usize> = (0..decomp.nnodes_minor)
            .map(|m| decomp.rank_of(major, m))
            .collect();
        let major_ranks: Vec<usize> = (0..decomp.nnodes_major)
            .map(|m| decomp.rank_of(m, minor))
            .collect();

        let mut planner = FftPlanner::new();
        let [nx, ny, nz] = decomp.dims;

        Ok(Self {
            decomp: decomp.clone(),
            major,
            minor,
            minor_group: group.subgroup(&minor_ranks)?,
            major_group: group.subgroup(&major_ranks)?,
            fwd: [
                planner.plan_fft_forward(nx),
                planner.plan_fft_forward(ny),
                planner.plan_fft_forward(nz),
            ],
            inv: [
                planner.plan_fft_inverse(nx),
                planner.plan_fft_inverse(ny),
                planner.plan_fft_inverse(nz),
            ],
        })
    }

    /// The (ky, kz) ranges of our part of the transformed grid. kx is always complete.
    pub fn recip_ranges(&self) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        (
            self.decomp.ky_range(self.major),
            self.decomp.kz_range(self.minor),
        )
    }

    /// 1D transforms run by one forward or inverse pass, on this role.
    pub fn lines_per_transform(&self) -> u64 {
        let xr = self.decomp.x_range(self.major);
        let yr = self.decomp.y_range(self.minor);
        let (kyr, kzr) = self.recip_ranges();
        (xr.len() * yr.len() + xr.len() * kzr.len() + kyr.len() * kzr.len()) as u64
    }

    /// Forward transform of the owned cells of `grid`. Returns our part of the transformed grid,
    /// in layout [ky][kz][kx].
    pub fn forward(&self, grid: &PmeGrid) -> Result<Vec<Complex<f64>>, PmeError> {
        let [nx, ny, nz] = self.decomp.dims;
        let nzc = self.decomp.nzc();
        let h = self.decomp.halo();
        let lx = grid.lx;
        let ly = grid.ly;
        let (kyr, kzr) = self.recip_ranges();
        let (lky, lkz) = (kyr.len(), kzr.len());

        // z, real to complex. Keep the non-redundant half.
        let mut full = Vec::with_capacity(lx * ly * nz);
        for ix in 0..lx {
            for iy in 0..ly {
                full.extend(
                    grid.column(ix + h, iy + h)
                        .iter()
                        .map(|&v| Complex::new(v, 0.)),
                );
            }
        }
        fft_lines(&self.fwd[2], &mut full);

        let a: Vec<Complex<f64>> = full
            .chunks_exact(nz)
            .flat_map(|line| line[..nzc].iter().copied())
            .collect();

        // A [x][y][kz] -> B [x][kz][y]
        let send = (0..self.decomp.nnodes_minor)
            .map(|q| {
                let kz_q = self.decomp.kz_range(q);
                let mut buf = Vec::new();
                for ix in 0..lx {
                    for iy in 0..ly {
                        let i = (ix * ly + iy) * nzc;
                        pack_complex(&a[i + kz_q.start..i + kz_q.end], &mut buf);
                    }
                }
                buf
            })
            .collect();
        let recv = self
            .minor_group
            .all_to_allv(Tag::Transpose(grid.index, STAGE_MINOR_FWD), send)?;

        let mut b = vec![Complex::new(0., 0.); lx * lkz * ny];
        for (q, buf) in recv.iter().enumerate() {
            let y_q = self.decomp.y_range(q);
            let vals = expect_len(unpack_complex(buf)?, lx * y_q.len() * lkz)?;
            for ix in 0..lx {
                for (iy, gy) in y_q.clone().enumerate() {
                    for kz in 0..lkz {
                        b[(ix * lkz + kz) * ny + gy] = vals[(ix * y_q.len() + iy) * lkz + kz];
                    }
                }
            }
        }

        fft_lines(&self.fwd[1], &mut b);

        // B [x][kz][ky] -> C [ky][kz][x]
        let send = (0..self.decomp.nnodes_major)
            .map(|p| {
                let ky_p = self.decomp.ky_range(p);
                let mut buf = Vec::new();
                for ix in 0..lx {
                    for kz in 0..lkz {
                        let i = (ix * lkz + kz) * ny;
                        pack_complex(&b[i + ky_p.start..i + ky_p.end], &mut buf);
                    }
                }
                buf
            })
            .collect();
        let recv = self
            .major_group
            .all_to_allv(Tag::Transpose(grid.index, STAGE_MAJOR_FWD), send)?;

        let mut c = vec![Complex::new(0., 0.); lky * lkz * nx];
        for (p, buf) in recv.iter().enumerate() {
            let x_p = self.decomp.x_range(p);
            let vals = expect_len(unpack_complex(buf)?, x_p.len() * lkz * lky)?;
            for (ix, gx) in x_p.clone().enumerate() {
                for kz in 0..lkz {
                    for ky in 0..lky {
                        c[(ky * lkz + kz) * nx + gx] = vals[(ix * lkz + kz) * lky + ky];
                    }
                }
            }
        }

        fft_lines(&self.fwd[0], &mut c);

        Ok(c)
    }

    /// Inverse transform of `c` (layout [ky][kz][kx]), written to the owned cells of `grid`.
    /// Halo cells are left alone.
    pub fn inverse(&self, mut c: Vec<Complex<f64>>, grid: &mut PmeGrid) -> Result<(), PmeError> {
        let [nx, ny, nz] = self.decomp.dims;
        let nzc = self.decomp.nzc();
        let h = self.decomp.halo();
        let lx = grid.lx;
        let ly = grid.ly;
        let (kyr, kzr) = self.recip_ranges();
        let (lky, lkz) = (kyr.len(), kzr.len());

        if c.len() != lky * lkz * nx {
            return Err(PmeError::Protocol(format!(
                "Transformed grid has {} values; expected {}",
                c.len(),
                lky * lkz * nx
            )));
        }

        fft_lines(&self.inv[0], &mut c);

        // C [ky][kz][x] -> B [x][kz][ky]
        let send = (0..self.decomp.nnodes_major)
            .map(|p| {
                let x_p = self.decomp.x_range(p);
                let mut buf = Vec::new();
                for ky in 0..lky {
                    for kz in 0..lkz {
                        let i = (ky * lkz + kz) * nx;
                        pack_complex(&c[i + x_p.start..i + x_p.end], &mut buf);
                    }
                }
                buf
            })
            .collect();
        let recv = self
            .major_group
            .all_to_allv(Tag::Transpose(grid.index, STAGE_MAJOR_INV), send)?;

        let mut b = vec![Complex::new(0., 0.); lx * lkz * ny];
        for (p, buf) in recv.iter().enumerate() {
            let ky_p = self.decomp.ky_range(p);
            let vals = expect_len(unpack_complex(buf)?, ky_p.len() * lkz * lx)?;
            for (iky, gky) in ky_p.clone().enumerate() {
                for kz in 0..lkz {
                    for ix in 0..lx {
                        b[(ix * lkz + kz) * ny + gky] = vals[(iky * lkz + kz) * lx + ix];
                    }
                }
            }
        }

        fft_lines(&self.inv[1], &mut b);

        // B [x][kz][y] -> A [x][y][kz]
        let send = (0..self.decomp.nnodes_minor)
            .map(|q| {
                let y_q = self.decomp.y_range(q);
                let mut buf = Vec::new();
                for ix in 0..lx {
                    for kz in 0..lkz {
                        let i = (ix * lkz + kz) * ny;
                        pack_complex(&b[i + y_q.start..i + y_q.end], &mut buf);
                    }
                }
                buf
            })
            .collect();
        let recv = self
            .minor_group
            .all_to_allv(Tag::Transpose(grid.index, STAGE_MINOR_INV), send)?;

        let mut a = vec![Complex::new(0., 0.); lx * ly * nzc];
        for (q, buf) in recv.iter().enumerate() {
            let kz_q = self.decomp.kz_range(q);
            let vals = expect_len(unpack_complex(buf)?, lx * kz_q.len() * ly)?;
            for ix in 0..lx {
                for (ikz, gkz) in kz_q.clone().enumerate() {
                    for iy in 0..ly {
                        a[(ix * ly + iy) * nzc + gkz] = vals[(ix * kz_q.len() + ikz) * ly + iy];
                    }
                }
            }
        }

        // z, complex to real: rebuild the Hermitian upper half, then keep real parts.
        let mut full = vec![Complex::new(0., 0.); lx * ly * nz];
        for (half, line) in a.chunks_exact(nzc).zip(full.chunks_exact_mut(nz)) {
            line[..nzc].copy_from_slice(half);
            for k in nzc..nz {
                line[k] = half[nz - k].conj();
            }
        }
        fft_lines(&self.inv[2], &mut full);

        for ix in 0..lx {
            for iy in 0..ly {
                let src = &full[(ix * ly + iy) * nz..(ix * ly + iy + 1) * nz];
                for (v, s) in grid.column_mut(ix + h, iy + h).iter_mut().zip(src) {
                    *v = s.re;
                }
            }
        }

        Ok(())
    }
}

fn expect_len(v: Vec<Complex<f64>>, len: usize) -> Result<Vec<Complex<f64>>, PmeError> {
    if v.len() != len {
        return Err(PmeError::Transport(format!(
            "Transpose block has {} values; expected {len}",
            v.len()
        )));
    }
    Ok(v)
}
