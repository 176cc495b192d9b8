//! The real-space charge grid, and how it's split across the roles of a PME group.
//!
//! The group is arranged as `nnodes_major` x `nnodes_minor`. Group rank r has major index
//! r / nnodes_minor, and minor index r % nnodes_minor. In real space, x is split over the major
//! index and y over the minor index; z is never split. Each role stores the cells it owns, plus
//! `order - 1` halo planes on the low side in x and in y; these catch the spline support of atoms
//! near the low edge of the slab. After the transform, kz is split over the minor index and ky
//! over the major index, with kx local.

use std::ops::Range;

use crate::PmeError;

/// Lower bound of part `i` when `n` items are split into `parts`. Part i is
/// split_bound(i) .. split_bound(i + 1).
pub(crate) fn split_bound(i: usize, n: usize, parts: usize) -> usize {
    i * n / parts
}

fn split_range(i: usize, n: usize, parts: usize) -> Range<usize> {
    split_bound(i, n, parts)..split_bound(i + 1, n, parts)
}

/// The part of `0..n` split `parts` ways that contains `g`.
fn split_owner(g: usize, n: usize, parts: usize) -> usize {
    (0..parts)
        .rev()
        .find(|&p| split_bound(p, n, parts) <= g)
        .unwrap_or(0)
}

/// Cyclic distance between slab indices a and b, out of n.
pub(crate) fn cyclic_dist(a: usize, b: usize, n: usize) -> usize {
    let d = a.abs_diff(b);
    d.min(n - d)
}

/// Advise whether `nnodes` PME roles split a `nkx` x `nky` grid evenly enough. 0: balanced.
/// 1: some imbalance, which is acceptable. 2: using fewer PME roles is expected to be faster.
pub fn pme_inconvenient_nnodes(nkx: usize, nky: usize, nnodes: usize) -> u8 {
    if nnodes == 0 || (nnodes > nkx && nnodes > nky) {
        return 2;
    }

    let nnx = nkx.div_ceil(nnodes);
    let nny = nky.div_ceil(nnodes);

    // Ratio of the busiest role's grid lines to the average, along each split dimension.
    let imbal = ((nnx * nnodes) as f64 / nkx as f64 + (nny * nnodes) as f64 / nky as f64) / 2.;

    if imbal >= 1.2 {
        2
    } else if imbal >= 1.1 {
        1
    } else {
        0
    }
}

/// The process geometry of a PME group, and the resulting ownership of grid cells.
#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    pub dims: [usize; 3],
    pub order: usize,
    pub nnodes_major: usize,
    pub nnodes_minor: usize,
}

impl Decomposition {
    pub fn new(
        dims: [usize; 3],
        order: usize,
        nnodes_major: usize,
        nnodes_minor: usize,
    ) -> Result<Self, PmeError> {
        let [nx, ny, nz] = dims;

        if nnodes_major == 0 || nnodes_minor == 0 {
            return Err(PmeError::Config(
                "Process counts must be at least 1 in each direction".to_owned(),
            ));
        }
        if nx < nnodes_major {
            return Err(PmeError::Decomposition(format!(
                "nkx = {nx} is smaller than the {nnodes_major} major roles"
            )));
        }
        if ny < nnodes_minor {
            return Err(PmeError::Decomposition(format!(
                "nky = {ny} is smaller than the {nnodes_minor} minor roles"
            )));
        }
        // The transformed grid has ky split over the major roles.
        if ny < nnodes_major {
            return Err(PmeError::Decomposition(format!(
                "nky = {ny} is smaller than the {nnodes_major} major roles"
            )));
        }
        if nz / 2 + 1 < nnodes_minor {
            return Err(PmeError::Decomposition(format!(
                "The {} complex z planes can't be split over {nnodes_minor} minor roles",
                nz / 2 + 1
            )));
        }

        Ok(Self {
            dims,
            order,
            nnodes_major,
            nnodes_minor,
        })
    }

    pub fn size(&self) -> usize {
        self.nnodes_major * self.nnodes_minor
    }

    /// (major, minor) of a group rank.
    pub fn coords(&self, rank: usize) -> (usize, usize) {
        (rank / self.nnodes_minor, rank % self.nnodes_minor)
    }

    pub fn rank_of(&self, major: usize, minor: usize) -> usize {
        major * self.nnodes_minor + minor
    }

    pub fn halo(&self) -> usize {
        self.order - 1
    }

    /// Complex points along z after the real-to-complex transform.
    pub fn nzc(&self) -> usize {
        self.dims[2] / 2 + 1
    }

    pub fn x_range(&self, major: usize) -> Range<usize> {
        split_range(major, self.dims[0], self.nnodes_major)
    }

    pub fn y_range(&self, minor: usize) -> Range<usize> {
        split_range(minor, self.dims[1], self.nnodes_minor)
    }

    pub fn ky_range(&self, major: usize) -> Range<usize> {
        split_range(major, self.dims[1], self.nnodes_major)
    }

    pub fn kz_range(&self, minor: usize) -> Range<usize> {
        split_range(minor, self.nzc(), self.nnodes_minor)
    }

    pub fn x_owner(&self, gx: usize) -> usize {
        split_owner(gx, self.dims[0], self.nnodes_major)
    }

    pub fn y_owner(&self, gy: usize) -> usize {
        split_owner(gy, self.dims[1], self.nnodes_minor)
    }

    /// Group rank owning the real-space column (gx, gy).
    pub fn column_owner(&self, gx: usize, gy: usize) -> usize {
        self.rank_of(self.x_owner(gx), self.y_owner(gy))
    }
}

/// For each peer, the columns (local x, local y) exchanged with it during a halo sum.
#[derive(Clone, Debug, Default)]
pub(crate) struct HaloMap {
    /// Our halo columns owned by each peer, in our local order.
    pub send: Vec<Vec<(usize, usize)>>,
    /// Our owned columns in each peer's halo, in that peer's local order.
    pub recv: Vec<Vec<(usize, usize)>>,
}

impl HaloMap {
    fn new(decomp: &Decomposition, rank: usize) -> Self {
        let size = decomp.size();
        let mut send = vec![Vec::new(); size];
        let mut recv = vec![Vec::new(); size];

        for peer in 0..size {
            for (gx, gy, lx_i, ly_i) in halo_columns(decomp, peer) {
                if decomp.column_owner(gx, gy) != rank {
                    continue;
                }
                let owned = owned_local(decomp, rank, gx, gy);
                recv[peer].push(owned);

                if peer == rank {
                    send[rank].push((lx_i, ly_i));
                }
            }
        }

        for (gx, gy, lx_i, ly_i) in halo_columns(decomp, rank) {
            let owner = decomp.column_owner(gx, gy);
            if owner != rank {
                send[owner].push((lx_i, ly_i));
            }
        }

        Self { send, recv }
    }
}

/// The halo columns of `rank`, in its local order: (global x, global y, local x, local y).
fn halo_columns(
    decomp: &Decomposition,
    rank: usize,
) -> impl Iterator<Item = (usize, usize, usize, usize)> + '_ {
    let (major, minor) = decomp.coords(rank);
    let xr = decomp.x_range(major);
    let yr = decomp.y_range(minor);
    let h = decomp.halo();
    let [nx, ny, _] = decomp.dims;

    let lx_tot = xr.len() + h;
    let ly_tot = yr.len() + h;

    (0..lx_tot).flat_map(move |ix| {
        let xr = xr.clone();
        let yr = yr.clone();
        (0..ly_tot).filter_map(move |iy| {
            if ix >= h && iy >= h {
                return None;
            }
            let gx = (xr.start + nx - h + ix) % nx;
            let gy = (yr.start + ny - h + iy) % ny;
            Some((gx, gy, ix, iy))
        })
    })
}

/// Local indices of a column `rank` owns.
fn owned_local(decomp: &Decomposition, rank: usize, gx: usize, gy: usize) -> (usize, usize) {
    let (major, minor) = decomp.coords(rank);
    let h = decomp.halo();
    (
        gx - decomp.x_range(major).start + h,
        gy - decomp.y_range(minor).start + h,
    )
}

/// One role's part of a real-space grid: its owned cells, plus the low-side halo. Stored
/// x-major, with z contiguous. `index` tells the A and B grids of a free-energy run apart in
/// messages.
#[derive(Clone, Debug)]
pub struct PmeGrid {
    pub(crate) decomp: Decomposition,
    pub(crate) rank: usize,
    pub(crate) index: u8,
    pub(crate) x0: usize,
    pub(crate) y0: usize,
    /// Owned extent.
    pub(crate) lx: usize,
    pub(crate) ly: usize,
    pub(crate) halo_map: HaloMap,
    pub(crate) data: Vec<f64>,
}

impl PmeGrid {
    pub fn new(decomp: &Decomposition, rank: usize, index: u8) -> Result<Self, PmeError> {
        if rank >= decomp.size() {
            return Err(PmeError::Config(format!(
                "Rank {rank} is outside a PME group of {}",
                decomp.size()
            )));
        }

        let (major, minor) = decomp.coords(rank);
        let xr = decomp.x_range(major);
        let yr = decomp.y_range(minor);
        let h = decomp.halo();

        let len = (xr.len() + h) * (yr.len() + h) * decomp.dims[2];
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            PmeError::Allocation(format!("Grid of {len} values for rank {rank}: {e}"))
        })?;
        data.resize(len, 0.);

        Ok(Self {
            decomp: decomp.clone(),
            rank,
            index,
            x0: xr.start,
            y0: yr.start,
            lx: xr.len(),
            ly: yr.len(),
            halo_map: HaloMap::new(decomp, rank),
            data,
        })
    }

    /// (x, y, z) extent of local storage, including halos.
    pub fn local_shape(&self) -> [usize; 3] {
        let h = self.decomp.halo();
        [self.lx + h, self.ly + h, self.decomp.dims[2]]
    }

    pub fn owned_x(&self) -> Range<usize> {
        self.x0..self.x0 + self.lx
    }

    pub fn owned_y(&self) -> Range<usize> {
        self.y0..self.y0 + self.ly
    }

    /// Global x of a local x index.
    pub fn global_x(&self, ix: usize) -> usize {
        let nx = self.decomp.dims[0];
        (self.x0 + nx - self.decomp.halo() + ix) % nx
    }

    pub fn global_y(&self, iy: usize) -> usize {
        let ny = self.decomp.dims[1];
        (self.y0 + ny - self.decomp.halo() + iy) % ny
    }

    pub fn is_owned(&self, ix: usize, iy: usize) -> bool {
        let h = self.decomp.halo();
        ix >= h && iy >= h
    }

    #[inline]
    pub(crate) fn idx(&self, ix: usize, iy: usize, iz: usize) -> usize {
        let [_, ly_tot, nz] = self.local_shape();
        (ix * ly_tot + iy) * nz + iz
    }

    /// The z line at local column (ix, iy).
    pub(crate) fn column(&self, ix: usize, iy: usize) -> &[f64] {
        let i = self.idx(ix, iy, 0);
        &self.data[i..i + self.decomp.dims[2]]
    }

    pub(crate) fn column_mut(&mut self, ix: usize, iy: usize) -> &mut [f64] {
        let i = self.idx(ix, iy, 0);
        let nz = self.decomp.dims[2];
        &mut self.data[i..i + nz]
    }

    /// Value at local indices.
    pub fn get(&self, ix: usize, iy: usize, iz: usize) -> f64 {
        self.data[self.idx(ix, iy, iz)]
    }

    pub fn add(&mut self, ix: usize, iy: usize, iz: usize, v: f64) {
        let i = self.idx(ix, iy, iz);
        self.data[i] += v;
    }

    pub fn zero(&mut self) {
        self.data.fill(0.);
    }

    /// Sum over the cells this role owns.
    pub fn owned_sum(&self) -> f64 {
        let h = self.decomp.halo();
        let [lx_tot, ly_tot, _] = self.local_shape();
        let mut sum = 0.;
        for ix in h..lx_tot {
            for iy in h..ly_tot {
                sum += self.column(ix, iy).iter().sum::<f64>();
            }
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconvenient_nnodes() {
        assert_eq!(pme_inconvenient_nnodes(32, 32, 4), 0);
        assert_eq!(pme_inconvenient_nnodes(48, 36, 12), 0);
        assert_eq!(pme_inconvenient_nnodes(32, 32, 12), 1);
        assert_eq!(pme_inconvenient_nnodes(32, 32, 20), 2);
        assert_eq!(pme_inconvenient_nnodes(10, 10, 11), 2);
    }

    #[test]
    fn split_covers_exactly_once() {
        for (n, parts) in [(10, 3), (32, 4), (7, 7), (50, 6)] {
            let mut covered = vec![0; n];
            for p in 0..parts {
                for g in split_range(p, n, parts) {
                    covered[g] += 1;
                    assert_eq!(split_owner(g, n, parts), p);
                }
            }
            assert!(covered.iter().all(|&c| c == 1));
        }
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(
            Decomposition::new([4, 32, 32], 4, 6, 1),
            Err(PmeError::Decomposition(_))
        ));
        assert!(matches!(
            Decomposition::new([32, 32, 4], 4, 1, 4),
            Err(PmeError::Decomposition(_))
        ));
        assert!(Decomposition::new([32, 32, 32], 4, 2, 2).is_ok());
    }

    #[test]
    fn halo_map_is_consistent() {
        let decomp = Decomposition::new([12, 10, 8], 4, 3, 2).unwrap();
        let maps: Vec<_> = (0..decomp.size())
            .map(|r| HaloMap::new(&decomp, r))
            .collect();

        for a in 0..decomp.size() {
            for b in 0..decomp.size() {
                assert_eq!(maps[a].send[b].len(), maps[b].recv[a].len(), "{a} -> {b}");
            }
            // Every halo column has exactly one owner.
            let grid = PmeGrid::new(&decomp, a, 0).unwrap();
            let [lx_tot, ly_tot, _] = grid.local_shape();
            let n_halo = lx_tot * ly_tot - grid.lx * grid.ly;
            let n_send: usize = maps[a].send.iter().map(Vec::len).sum();
            assert_eq!(n_send, n_halo);
        }
    }
}
