//! The reciprocal-space solve: multiply the transformed charge grid by the Ewald influence
//! function, accumulating energy and virial as we go.
//!
//! For signed reciprocal indices (mx, my, mz), with m the Cartesian reciprocal vector (no 2π):
//! eterm = exp(-π²m²/β²) / (π V m² B(m) ε_r), where B(m) is the product of the spline moduli.
//! The grid is multiplied by eterm in place; after the inverse transform it holds the potential.
//! We store only kz ≥ 0, so interior kz planes stand in for their Hermitian partners too.

use std::{f64::consts::PI, ops::Range};

use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::{
    ewald::gaussian_screening,
    sim_box::{Matrix3, RecipBox, ZERO_MATRIX},
};

/// What the solver needs besides the grid itself.
pub(crate) struct SolveParams<'a> {
    pub dims: [usize; 3],
    pub ky_range: Range<usize>,
    pub kz_range: Range<usize>,
    pub recip: &'a RecipBox,
    pub volume: f64,
    pub beta: f64,
    pub epsilon_r: f64,
    pub bsp_mod: &'a [Vec<f64>; 3],
}

/// Energy and virial contributions from our part of k-space.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SolveResult {
    pub energy: f64,
    pub virial: Matrix3,
    pub kpoints: u64,
}

/// Signed index of k along a dimension of size n.
#[inline]
fn signed_index(k: usize, n: usize) -> f64 {
    if k < n.div_ceil(2) {
        k as f64
    } else {
        k as f64 - n as f64
    }
}

/// Solve in place. `grid` is in layout [ky][kz][kx], over the ranges in `p`. Partial sums are
/// accumulated per line, then added in line order, so the result doesn't depend on the number
/// of threads.
pub(crate) fn solve_pme(grid: &mut [Complex<f64>], p: &SolveParams) -> SolveResult {
    let [nx, ny, nz] = p.dims;
    let lkz = p.kz_range.len();
    let elfac = 1. / p.epsilon_r;
    let factor = PI * PI / (p.beta * p.beta);
    let pi_v = PI * p.volume;

    // (energy sum, xx, yy, zz, xy, xz, yz)
    let partials: Vec<[f64; 7]> = grid
        .par_chunks_mut(nx)
        .enumerate()
        .map(|(line, vals)| {
            let ky = p.ky_range.start + line / lkz;
            let kz = p.kz_range.start + line % lkz;

            let my = signed_index(ky, ny);
            let mz = kz as f64;
            let bz_by = p.bsp_mod[2][kz] * p.bsp_mod[1][ky];

            // The kz = 0 plane, and the Nyquist plane for even nz, have no partner in the
            // stored half.
            let corner_fac = if kz == 0 || 2 * kz == nz { 0.5 } else { 1. };

            let mut acc = [0.; 7];

            for (kx, v) in vals.iter_mut().enumerate() {
                if kx == 0 && ky == 0 && kz == 0 {
                    *v = Complex::new(0., 0.);
                    continue;
                }

                let mx = signed_index(kx, nx);
                let mh = p.recip.lattice_vec(mx, my, mz);
                let m2 = mh[0] * mh[0] + mh[1] * mh[1] + mh[2] * mh[2];

                let denom = m2 * bz_by * p.bsp_mod[0][kx] * pi_v;
                let eterm = elfac * gaussian_screening(m2, p.beta) / denom;

                let struct2 = 2. * v.norm_sqr();
                *v *= eterm;

                let ets2 = corner_fac * eterm * struct2;
                let vfactor = (factor * m2 + 1.) * 2. / m2;
                let ets2vf = ets2 * vfactor;

                acc[0] += ets2;
                acc[1] += ets2vf * mh[0] * mh[0] - ets2;
                acc[2] += ets2vf * mh[1] * mh[1] - ets2;
                acc[3] += ets2vf * mh[2] * mh[2] - ets2;
                acc[4] += ets2vf * mh[0] * mh[1];
                acc[5] += ets2vf * mh[0] * mh[2];
                acc[6] += ets2vf * mh[1] * mh[2];
            }
            acc
        })
        .collect();

    let mut sum = [0.; 7];
    for acc in &partials {
        for (s, a) in sum.iter_mut().zip(acc) {
            *s += a;
        }
    }

    let mut virial = ZERO_MATRIX;
    virial[0][0] = 0.25 * sum[1];
    virial[1][1] = 0.25 * sum[2];
    virial[2][2] = 0.25 * sum[3];
    virial[0][1] = 0.25 * sum[4];
    virial[0][2] = 0.25 * sum[5];
    virial[1][2] = 0.25 * sum[6];
    virial[1][0] = virial[0][1];
    virial[2][0] = virial[0][2];
    virial[2][1] = virial[1][2];

    SolveResult {
        energy: 0.5 * sum[0],
        virial,
        kpoints: grid.len() as u64,
    }
}
