//! Ewald helpers that sit around the reciprocal-space engine: choosing the splitting
//! coefficient, sizing the grid, and the self-interaction term.

use std::f64::consts::PI;

use statrs::function::erf::erfc;

use crate::{PmeError, SimBox, spline::PME_ORDER_MIN};

// Multiply by this to convert partial charges from elementary charge to the self-consistent
// Amber units used throughout; the Coulomb constant is then 1 in kcal/mol and Å.
pub const CHARGE_UNIT_SCALER: f64 = 18.2223;

const SQRT_PI: f64 = 1.7724538509055159;

/// Find β such that erfc(β r_c) = rtol, by doubling then bisecting. A bigger β means more
/// damping, and a smaller real-space contribution (cheaper real), but a larger reciprocal load.
pub fn ewald_coeff(cutoff: f64, rtol: f64) -> Result<f64, PmeError> {
    check_ewald_params(cutoff, rtol)?;

    let mut beta = 5.;
    let mut i = 0;

    loop {
        i += 1;
        beta *= 2.;
        if erfc(beta * cutoff) <= rtol {
            break;
        }
    }

    // Bisect; 60 extra iterations is past f64 resolution.
    let n = i + 60;
    let mut low = 0.;
    let mut high = beta;

    for _ in 0..n {
        beta = (low + high) / 2.;
        if erfc(beta * cutoff) > rtol {
            low = beta;
        } else {
            high = beta;
        }
    }

    Ok(beta)
}

/// The doubling search above only terminates for these.
pub(crate) fn check_ewald_params(cutoff: f64, rtol: f64) -> Result<(), PmeError> {
    if !(cutoff.is_finite() && cutoff > 0.) {
        return Err(PmeError::Config(format!(
            "Cutoff must be positive and finite; got {cutoff}"
        )));
    }
    if !(rtol > 0. && rtol < 1.) {
        return Err(PmeError::Config(format!(
            "Ewald tolerance must be in (0, 1); got {rtol}"
        )));
    }
    Ok(())
}

/// The Ewald self-interaction term, -β/√π Σ q². Add this to the reciprocal energy to get the
/// long-range energy of the set of point charges.
pub fn ewald_self_energy(q: &[f64], beta: f64, epsilon_r: f64) -> f64 {
    -(beta / SQRT_PI) / epsilon_r * q.iter().map(|&qi| qi * qi).sum::<f64>()
}

/// Smallest n' ≥ n whose only prime factors are 2, 3, 5 and 7. These FFT quickly.
fn next_planner_n(mut n: usize) -> usize {
    fn good(mut x: usize) -> bool {
        for p in [2, 3, 5, 7] {
            while x.is_multiple_of(p) {
                x /= p;
            }
        }
        x == 1
    }
    if n < 2 {
        n = 2;
    }
    while !good(n) {
        n += 1;
    }
    n
}

/// A utility function to get the (nx, ny, nz) grid dimensions based on box vector lengths
/// and mesh spacing. A mesh spacing of 1Å is a good starting point.
pub fn grid_dims_for_box(cell: &SimBox, fourier_spacing: f64) -> [usize; 3] {
    cell.lengths().map(|l| {
        let n0 = (l / fourier_spacing)
            .ceil()
            .max((2 * PME_ORDER_MIN) as f64) as usize;
        next_planner_n(n0)
    })
}

/// Rough number of reciprocal-space interpolation points per unit volume; used only for
/// logging, to compare grid resolution between runs.
pub(crate) fn grid_density(dims: [usize; 3], cell: &SimBox) -> f64 {
    (dims[0] * dims[1] * dims[2]) as f64 / cell.volume()
}

/// exp(-π² m² / β²); the Gaussian screening of the reciprocal-space sum for |m|² = `m2`.
pub(crate) fn gaussian_screening(m2: f64, beta: f64) -> f64 {
    (-PI * PI * m2 / (beta * beta)).exp()
}
