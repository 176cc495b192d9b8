//! Parrinello-Rahman pressure coupling. This consumes the virial the PME engine (and the
//! short-range code) produce: the box matrix gets an equation of motion driven by the difference
//! between the pressure tensor and the reference pressure.
//!
//! The element runs on a coupling period of `nstpcouple` steps. On one step it integrates the box
//! velocity, producing the velocity-scaling tensor for the propagator and the coordinate scaling
//! matrix; on the next, it moves the box and scales coordinates.
//!
//! Note: Pressure and compressibility always appear as a product, so the pressure unit drops out
//! of the box equations. We use bar for both.

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};
use itertools::iproduct;
use lin_alg::f64::Vec3;
use log::warn;

use crate::{
    PmeError,
    sim_box::{
        Matrix3, SimBox, ZERO_MATRIX, mat_inv_lower, mat_mul, mat_mult, mat_scale, mat_tmul,
    },
};

pub(crate) const BAR_PER_KCAL_MOL_PER_A3: f64 = 69476.95457055373;

/// A relative box change per coupling step above this is worth a warning.
const MAX_REL_CHANGE: f64 = 0.01;

#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CouplingType {
    /// All box vectors scale together.
    #[default]
    Isotropic,
    /// x and y scale together; z independently. For membranes.
    SemiIsotropic,
    /// Every lower-triangular box component has its own equation of motion.
    Anisotropic,
}

impl CouplingType {
    /// Whether box vector ratios are held fixed.
    fn preserves_shape(self) -> bool {
        matches!(self, Self::Isotropic | Self::SemiIsotropic)
    }
}

#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, PartialEq)]
pub struct PrBarostatConfig {
    pub coupling: CouplingType,
    /// Coupling time constant, in ps.
    pub tau_p: f64,
    /// Isothermal compressibility, in bar⁻¹.
    pub compress: Matrix3,
    /// Reference pressure, in bar.
    pub ref_p: Matrix3,
    /// Couple every this many steps.
    pub nstpcouple: i64,
    /// MD time step, in ps.
    pub dt: f64,
}

impl Default for PrBarostatConfig {
    fn default() -> Self {
        // Water at 300 K, 1 bar.
        let compress = 4.5e-5;
        Self {
            coupling: CouplingType::Isotropic,
            tau_p: 2.,
            compress: [[compress, 0., 0.], [0., compress, 0.], [0., 0., compress]],
            ref_p: [[1., 0., 0.], [0., 1., 0.], [0., 0., 1.]],
            nstpcouple: 10,
            dt: 0.002,
        }
    }
}

impl PrBarostatConfig {
    pub fn coupling_time_step(&self) -> f64 {
        self.dt * self.nstpcouple as f64
    }
}

/// Barostat state that must survive a restart.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BarostatCheckpoint {
    pub box_velocity: Matrix3,
    pub box_rel: Matrix3,
}

/// What the barostat needs to do on a given step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BarostatTasks {
    /// Move the box by its velocity, and scale coordinates.
    pub scale_box_and_positions: bool,
    /// Integrate the box velocity from this step's pressure. The propagator then applies the
    /// new scaling tensor on the next step.
    pub integrate_box_velocity: bool,
}

fn do_per_step(step: i64, nst: i64) -> bool {
    nst > 0 && step.rem_euclid(nst) == 0
}

/// P = 2/V (Ekin - Ξ), in bar. `ekin` and `virial` are in kcal/mol.
pub fn pressure_tensor(ekin: &Matrix3, virial: &Matrix3, cell: &SimBox) -> Matrix3 {
    let fac = BAR_PER_KCAL_MOL_PER_A3 * 2. / cell.volume();
    let mut result = ZERO_MATRIX;
    for (i, j) in iproduct!(0..3, 0..3) {
        result[i][j] = (ekin[i][j] - virial[i][j]) * fac;
    }
    result
}

/// Box components tied to a_x by the shape constraint: b and c relative to a's length, over the
/// first `ndim` dimensions. With `init`, record the current ratios; otherwise impose them.
fn do_box_rel(ndim: usize, box_rel: &mut Matrix3, b: &mut Matrix3, init: bool) {
    for d in 1..3 {
        for d2 in 0..ndim {
            if init {
                box_rel[d][d2] = b[d][d2] / b[0][0];
            } else {
                b[d][d2] = b[0][0] * box_rel[d][d2];
            }
        }
    }
}

pub struct ParrinelloRahmanBarostat {
    pub cfg: PrBarostatConfig,
    offset: i64,
    box_velocity: Matrix3,
    box_rel: Matrix3,
    /// Coordinate scaling for the next box move: x' = x · mu.
    mu: Matrix3,
    /// Velocity scaling for the propagator, premultiplied by the coupling time step.
    scaling_tensor: Matrix3,
}

impl ParrinelloRahmanBarostat {
    /// `offset` shifts the coupling steps relative to multiples of `nstpcouple`. Pass a
    /// checkpoint to resume a run.
    pub fn new(
        cfg: PrBarostatConfig,
        offset: i64,
        init_step: i64,
        cell: &SimBox,
        checkpoint: Option<&BarostatCheckpoint>,
    ) -> Self {
        let mut result = Self {
            cfg,
            offset,
            box_velocity: ZERO_MATRIX,
            box_rel: ZERO_MATRIX,
            mu: ZERO_MATRIX,
            scaling_tensor: ZERO_MATRIX,
        };

        if let Some(cp) = checkpoint {
            result.box_velocity = cp.box_velocity;
            result.box_rel = cp.box_rel;
        }

        if result.cfg.coupling.preserves_shape() {
            let mut b = cell.m;
            do_box_rel(result.ndim(), &mut result.box_rel, &mut b, true);
        }

        // If we scale on the first step, set up the scaling from the current box velocity
        // without integrating it.
        let nst = result.cfg.nstpcouple;
        if do_per_step(init_step + nst + offset, nst) {
            result.pcoupl(init_step, None, cell);
        }

        result
    }

    fn ndim(&self) -> usize {
        if self.cfg.coupling == CouplingType::SemiIsotropic {
            2
        } else {
            3
        }
    }

    fn preserve_box_shape(&self, b: &mut Matrix3) {
        if self.cfg.coupling.preserves_shape() {
            let mut box_rel = self.box_rel;
            do_box_rel(self.ndim(), &mut box_rel, b, false);
        }
    }

    pub fn schedule(&self, step: i64) -> BarostatTasks {
        let nst = self.cfg.nstpcouple;
        BarostatTasks {
            scale_box_and_positions: do_per_step(step + nst + self.offset, nst),
            integrate_box_velocity: do_per_step(step + nst + self.offset + 1, nst),
        }
    }

    /// Integrate the box equations of motion over one coupling step. `pressure` is in bar; see
    /// `pressure_tensor`.
    pub fn integrate_box_velocity(&mut self, step: i64, pressure: &Matrix3, cell: &SimBox) {
        self.pcoupl(step, Some(pressure), cell);
    }

    /// With no pressure, only the scaling matrices are set up.
    fn pcoupl(&mut self, step: i64, pressure: Option<&Matrix3>, cell: &SimBox) {
        let b = &cell.m;
        let dt = self.cfg.coupling_time_step();
        let vol = cell.volume();
        let invbox = mat_inv_lower(b);

        if let Some(pres) = pressure {
            let max_l = b[0][0].max(b[1][1]).max(b[2][2]);

            let mut winv = ZERO_MATRIX;
            let mut pdiff = ZERO_MATRIX;
            for (d, n) in iproduct!(0..3, 0..3) {
                winv[d][n] = (4. * std::f64::consts::PI.powi(2) * self.cfg.compress[d][n])
                    / (3. * self.cfg.tau_p * self.cfg.tau_p * max_l);
                pdiff[d][n] = pres[d][n] - self.cfg.ref_p[d][n];
            }

            let mut t1 = mat_tmul(&invbox, &pdiff);
            // Fold the off-diagonal 'force' into the lower triangle, to keep the box
            // lower-triangular.
            for d in 0..3 {
                for n in 0..d {
                    t1[d][n] += t1[n][d];
                    t1[n][d] = 0.;
                }
            }

            match self.cfg.coupling {
                CouplingType::Anisotropic => {
                    for d in 0..3 {
                        for n in 0..=d {
                            t1[d][n] *= winv[d][n] * vol;
                        }
                    }
                }
                CouplingType::Isotropic => {
                    // Total volume acceleration, shared out equally in relative terms.
                    let atot = b[0][0] * b[1][1] * t1[2][2]
                        + b[0][0] * t1[1][1] * b[2][2]
                        + t1[0][0] * b[1][1] * b[2][2];
                    let arel = atot / (3. * vol);
                    for d in 0..3 {
                        for n in 0..=d {
                            t1[d][n] = winv[0][0] * vol * arel * b[d][n];
                        }
                    }
                }
                CouplingType::SemiIsotropic => {
                    let atot = b[0][0] * t1[1][1] + t1[0][0] * b[1][1];
                    let arel = atot / (2. * b[0][0] * b[1][1]);
                    for d in 0..2 {
                        for n in 0..=d {
                            t1[d][n] = winv[d][n] * vol * arel * b[d][n];
                        }
                    }
                    for n in 0..3 {
                        t1[2][n] *= winv[2][n] * vol;
                    }
                }
            }

            let mut max_change: f64 = 0.;
            for d in 0..3 {
                for n in 0..=d {
                    self.box_velocity[d][n] += dt * t1[d][n];
                    // Relative to the diagonal; off-diagonals may well be zero.
                    max_change = max_change.max((dt * self.box_velocity[d][n] / b[d][d]).abs());
                }
            }

            if max_change > MAX_REL_CHANGE {
                warn!(
                    "Step {step}: Pressure scaling more than 1%. mu: {} {} {}",
                    1. + self.box_velocity[0][0],
                    1. + self.box_velocity[1][1],
                    1. + self.box_velocity[2][2]
                );
            }
        }

        let mut boxv = self.box_velocity;
        self.preserve_box_shape(&mut boxv);
        self.box_velocity = boxv;

        // M = invbox · (boxv · boxᵀ) · invboxᵀ
        let t1 = mat_mult(&self.box_velocity, b);
        let t2 = mat_mul(&invbox, &t1);
        let m = mat_mult(&t2, &invbox);

        // The box at t + dt, and mu as the relative change.
        let mut next = ZERO_MATRIX;
        for d in 0..3 {
            for n in 0..=d {
                next[d][n] = b[d][n] + dt * self.box_velocity[d][n];
            }
        }
        self.preserve_box_shape(&mut next);
        self.mu = mat_mul(&invbox, &next);

        self.scaling_tensor = mat_scale(&m, dt);
    }

    /// Move the box by its velocity over one coupling step, and scale `posits` with it.
    pub fn scale_box_and_positions(
        &self,
        cell: &mut SimBox,
        posits: &mut [Vec3],
    ) -> Result<(), PmeError> {
        let dt = self.cfg.coupling_time_step();

        let mut b = cell.m;
        for i in 0..3 {
            for m in 0..=i {
                b[i][m] += dt * self.box_velocity[i][m];
            }
        }
        self.preserve_box_shape(&mut b);
        *cell = SimBox::new(b)?;

        // x' = x · mu; mu is lower-triangular.
        let mu = &self.mu;
        for p in posits {
            *p = Vec3::new(
                p.x * mu[0][0] + p.y * mu[1][0] + p.z * mu[2][0],
                p.y * mu[1][1] + p.z * mu[2][1],
                p.z * mu[2][2],
            );
        }

        Ok(())
    }

    /// The propagator's Parrinello-Rahman velocity correction: v -= M' v, with M' the scaling
    /// tensor (already multiplied by the coupling time step).
    pub fn scale_velocities(&self, vels: &mut [Vec3]) {
        let m = &self.scaling_tensor;
        for v in vels {
            *v = Vec3::new(
                v.x - (m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z),
                v.y - (m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z),
                v.z - (m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z),
            );
        }
    }

    pub fn box_velocity(&self) -> &Matrix3 {
        &self.box_velocity
    }

    pub fn scaling_tensor(&self) -> &Matrix3 {
        &self.scaling_tensor
    }

    pub fn mu(&self) -> &Matrix3 {
        &self.mu
    }

    pub fn checkpoint(&self) -> BarostatCheckpoint {
        BarostatCheckpoint {
            box_velocity: self.box_velocity,
            box_rel: self.box_rel,
        }
    }
}
