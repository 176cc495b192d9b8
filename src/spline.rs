//! Cardinal B-spline interpolation weights, their derivatives, and the Euler exponential spline
//! moduli |b(m)|⁻² used by the reciprocal solver.
//!
//! An atom at grid coordinate u (fractional coordinate times grid size) touches the `order`
//! points floor(u) - (order - 1) ..= floor(u). The weight of point floor(u) - (order - 1) + k is
//! `theta[k]`; `dtheta[k]` is its derivative with respect to u.

use std::f64::consts::TAU;

use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::RecipBox;

pub const PME_ORDER_MIN: usize = 3;
pub const PME_ORDER_MAX: usize = 12;

/// Replacement threshold for moduli that vanish, e.g. at the Nyquist point with odd orders.
const MODULUS_MIN: f64 = 1e-7;

/// Spline data for one atom. Computed once per step, and shared by the spreader and the
/// gatherer so they are exact transposes of each other.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AtomSpline {
    /// floor(u) per dimension, wrapped into [0, n).
    pub fidx: [usize; 3],
    pub theta: [[f64; PME_ORDER_MAX]; 3],
    pub dtheta: [[f64; PME_ORDER_MAX]; 3],
}

/// Grid coordinate of a fractional coordinate: (floor index in [0, n), remainder in [0, 1)).
/// Tolerates the rounding cases where s * n lands on n, or s is a hair below 0.
pub(crate) fn floor_index(s: f64, n: usize) -> (usize, f64) {
    let u = s * n as f64;
    let fl = u.floor();
    let dr = u - fl;
    let i = (fl as i64).rem_euclid(n as i64) as usize;
    (i, dr)
}

/// The recursion for order-`order` weights at remainder `dr`. Writes `order` entries of each slice.
fn fill_bspline(dr: f64, order: usize, theta: &mut [f64], dtheta: &mut [f64]) {
    theta[order - 1] = 0.;
    theta[1] = dr;
    theta[0] = 1. - dr;

    for k in 3..order {
        let div = 1. / (k - 1) as f64;
        theta[k - 1] = div * dr * theta[k - 2];
        for l in 1..(k - 1) {
            theta[k - l - 1] = div
                * ((dr + l as f64) * theta[k - l - 2] + ((k - l) as f64 - dr) * theta[k - l - 1]);
        }
        theta[0] *= div * (1. - dr);
    }

    // Differentiate using the order - 1 weights.
    dtheta[0] = -theta[0];
    for k in 1..order {
        dtheta[k] = theta[k - 1] - theta[k];
    }

    let div = 1. / (order - 1) as f64;
    theta[order - 1] = div * dr * theta[order - 2];
    for l in 1..(order - 1) {
        theta[order - l - 1] = div
            * ((dr + l as f64) * theta[order - l - 2]
                + ((order - l) as f64 - dr) * theta[order - l - 1]);
    }
    theta[0] *= div * (1. - dr);
}

/// Spline weights and their derivatives for a point with fractional remainder `dr` in [0, 1).
pub fn bspline_weights(dr: f64, order: usize) -> (Vec<f64>, Vec<f64>) {
    let mut theta = vec![0.; order];
    let mut dtheta = vec![0.; order];
    fill_bspline(dr, order, &mut theta, &mut dtheta);
    (theta, dtheta)
}

/// |DFT of the spline weights at the grid points|², for each index 0..n. The solver divides by
/// these.
pub fn bspline_moduli(n: usize, order: usize) -> Vec<f64> {
    let (theta, _) = bspline_weights(0., order);

    let mut modulus: Vec<f64> = (0..n)
        .map(|i| {
            let mut sc = 0.;
            let mut ss = 0.;
            for (j, t) in theta.iter().enumerate() {
                let arg = TAU * ((i * j) % n) as f64 / n as f64;
                sc += t * arg.cos();
                ss += t * arg.sin();
            }
            sc * sc + ss * ss
        })
        .collect();

    for i in 0..n {
        if modulus[i] < MODULUS_MIN {
            modulus[i] = 0.5 * (modulus[(i + n - 1) % n] + modulus[(i + 1) % n]);
        }
    }

    modulus
}

fn atom_spline(frac: [f64; 3], dims: [usize; 3], order: usize) -> AtomSpline {
    let mut result = AtomSpline {
        fidx: [0; 3],
        theta: [[0.; PME_ORDER_MAX]; 3],
        dtheta: [[0.; PME_ORDER_MAX]; 3],
    };

    for d in 0..3 {
        let (i, dr) = floor_index(frac[d], dims[d]);
        result.fidx[d] = i;
        fill_bspline(dr, order, &mut result.theta[d], &mut result.dtheta[d]);
    }

    result
}

/// Spline data for each position. Positions must be in the primary unit cell.
pub(crate) fn make_splines(
    posits: &[Vec3],
    recip: &RecipBox,
    dims: [usize; 3],
    order: usize,
) -> Vec<AtomSpline> {
    posits
        .par_iter()
        .map(|&r| atom_spline(recip.fractional(r), dims, order))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_of_unity() {
        for order in PME_ORDER_MIN..=PME_ORDER_MAX {
            for dr in [0., 0.1, 0.37, 0.5, 0.999] {
                let (theta, dtheta) = bspline_weights(dr, order);
                let sum: f64 = theta.iter().sum();
                let dsum: f64 = dtheta.iter().sum();

                assert!((sum - 1.).abs() < 1e-13, "order {order} dr {dr}: {sum}");
                assert!(dsum.abs() < 1e-13, "order {order} dr {dr}: {dsum}");
                assert!(theta.iter().all(|&t| t >= 0.));
            }
        }
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let h = 1e-6;
        for order in [4, 5, 8] {
            let dr = 0.43;
            let (_, dtheta) = bspline_weights(dr, order);
            let (tp, _) = bspline_weights(dr + h, order);
            let (tm, _) = bspline_weights(dr - h, order);

            for k in 0..order {
                let fd = (tp[k] - tm[k]) / (2. * h);
                assert!((fd - dtheta[k]).abs() < 1e-8, "order {order} k {k}");
            }
        }
    }

    #[test]
    fn order_4_weights() {
        // The cubic B-spline at dr = 0: 1/6, 2/3, 1/6, 0.
        let (theta, _) = bspline_weights(0., 4);
        let expected = [1. / 6., 2. / 3., 1. / 6., 0.];
        for (t, e) in theta.iter().zip(expected) {
            assert!((t - e).abs() < 1e-15);
        }
    }

    #[test]
    fn moduli_positive_and_symmetric() {
        for order in [3, 4, 5] {
            let n = 16;
            let m = bspline_moduli(n, order);
            assert!((m[0] - 1.).abs() < 1e-12);
            for i in 1..n {
                assert!(m[i] > 0.);
                assert!((m[i] - m[n - i]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn floor_index_wraps_edges() {
        assert_eq!(floor_index(0.5, 10), (5, 0.));
        let (i, dr) = floor_index(1., 10);
        assert_eq!(i, 0);
        assert_eq!(dr, 0.);
        let (i, dr) = floor_index(-1e-17, 10);
        assert_eq!(i, 9);
        assert!(dr > 0.99);
    }
}
