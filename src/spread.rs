//! Spreading charges onto the grid, and gathering forces and potential back from it. These are
//! exact transposes: both walk the same `order`³ points per atom, with the same spline weights.
//!
//! Atoms must belong to this role: the floor of their x and y grid coordinates must be in our
//! owned slab. The low-side halo then holds the rest of their support.

use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::{grid::PmeGrid, sim_box::RecipBox, spline::AtomSpline};

/// Local (x, y) index of an atom's first support point, and its first z point (unwrapped).
#[inline]
fn support_start(grid: &PmeGrid, sp: &AtomSpline) -> (usize, usize, usize) {
    let nz = grid.decomp.dims[2];
    (
        sp.fidx[0] - grid.x0,
        sp.fidx[1] - grid.y0,
        sp.fidx[2] + nz - grid.decomp.halo(),
    )
}

/// Deposit q·θx·θy·θz onto each support point. Adds to what's already on the grid. Returns the
/// number of grid points written.
pub(crate) fn spread_charges(grid: &mut PmeGrid, splines: &[AtomSpline], q: &[f64]) -> u64 {
    let order = grid.decomp.order;
    let nz = grid.decomp.dims[2];
    let mut points = 0;

    for (sp, &qi) in splines.iter().zip(q) {
        if qi == 0. {
            continue;
        }

        let (i0, j0, k0) = support_start(grid, sp);

        for ithx in 0..order {
            let vx = qi * sp.theta[0][ithx];

            for ithy in 0..order {
                let vxy = vx * sp.theta[1][ithy];
                let base = grid.idx(i0 + ithx, j0 + ithy, 0);

                for ithz in 0..order {
                    let iz = (k0 + ithz) % nz;
                    grid.data[base + iz] += vxy * sp.theta[2][ithz];
                }
            }
        }
        points += (order * order * order) as u64;
    }

    points
}

/// Forces from the potential grid: F = -q ∇φ, via the spline derivatives. Each force is
/// multiplied by `scale`, for blending free-energy states.
pub(crate) fn gather_forces(
    grid: &PmeGrid,
    splines: &[AtomSpline],
    q: &[f64],
    recip: &RecipBox,
    scale: f64,
) -> Vec<Vec3> {
    let order = grid.decomp.order;
    let [nx, ny, nz] = grid.decomp.dims;
    let (nx, ny, nz_f) = (nx as f64, ny as f64, nz as f64);

    splines
        .par_iter()
        .zip(q.par_iter())
        .map(|(sp, &qi)| {
            if qi == 0. {
                return Vec3::new_zero();
            }

            let (i0, j0, k0) = support_start(grid, sp);

            let mut fx = 0.;
            let mut fy = 0.;
            let mut fz = 0.;

            for ithx in 0..order {
                let tx = sp.theta[0][ithx];
                let dx = sp.dtheta[0][ithx];

                for ithy in 0..order {
                    let ty = sp.theta[1][ithy];
                    let dy = sp.dtheta[1][ithy];
                    let base = grid.idx(i0 + ithx, j0 + ithy, 0);

                    let mut fxy1 = 0.;
                    let mut fz1 = 0.;
                    for ithz in 0..order {
                        let gval = grid.data[base + (k0 + ithz) % nz];
                        fxy1 += sp.theta[2][ithz] * gval;
                        fz1 += sp.dtheta[2][ithz] * gval;
                    }

                    fx += dx * ty * fxy1;
                    fy += tx * dy * fxy1;
                    fz += tx * ty * fz1;
                }
            }

            // Chain rule through u = n (r · recip).
            let gx = fx * nx;
            let gy = fy * ny;
            let gz = fz * nz_f;

            Vec3::new(
                scale * (-qi * (gx * recip.rxx)),
                scale * (-qi * (gx * recip.ryx + gy * recip.ryy)),
                scale * (-qi * (gx * recip.rzx + gy * recip.rzy + gz * recip.rzz)),
            )
        })
        .collect()
}

/// Σ q φ(r) over the atoms, interpolating the potential grid.
pub(crate) fn gather_energy(grid: &PmeGrid, splines: &[AtomSpline], q: &[f64]) -> f64 {
    let order = grid.decomp.order;
    let nz = grid.decomp.dims[2];
    let mut energy = 0.;

    for (sp, &qi) in splines.iter().zip(q) {
        let (i0, j0, k0) = support_start(grid, sp);
        let mut pot = 0.;

        for ithx in 0..order {
            for ithy in 0..order {
                let txy = sp.theta[0][ithx] * sp.theta[1][ithy];
                let base = grid.idx(i0 + ithx, j0 + ithy, 0);

                for ithz in 0..order {
                    pot += txy * sp.theta[2][ithz] * grid.data[base + (k0 + ithz) % nz];
                }
            }
        }
        energy += qi * pot;
    }

    energy
}
