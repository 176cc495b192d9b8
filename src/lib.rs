#![allow(non_snake_case)]
#![allow(confusable_idents)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

//! Smooth Particle-Mesh Ewald (SPME) long-range electrostatics for molecular dynamics.
//! The textual information here is informal, and aimed at code maintenance; not library use.
//!
//! The reciprocal-space part of the Ewald sum runs as a strict pipeline each step:
//! spread charges onto the mesh with B-splines -> sum overlapping halos -> forward FFT ->
//! multiply by the influence function (energy + virial) -> inverse FFT -> broadcast halos ->
//! gather forces with the spline derivatives.
//!
//! [Essmann et al, 1995: A smooth particle mesh Ewald method](https://doi.org/10.1063/1.470117)
//!
//! Base units: Å, ps, kcal/mol. Partial charges are pre-scaled to Amber units (multiply elementary
//! charge by `CHARGE_UNIT_SCALER`), so the Coulomb prefactor is 1/ε_r.
//!
//! ## Components
//! - Grid decomposition: x over the "major" roles, y over the "minor" roles, z local. Each role
//!   stores its owned cells plus `order - 1` halo planes on the low side in x and y.
//! - Spreader/gatherer: exact transposes of each other, sharing the same spline weights.
//! - A distributed 3D real-to-complex FFT, with all-to-all transposes inside the role sub-groups.
//! - The reciprocal solver, supporting triclinic cells.
//! - Halo reduction, forward (sum into owners) and backward (copy back out to halos).
//! - PP/PME role splitting: particle roles send charges and coordinates, electrostatics-only roles
//!   return forces, energy, and virial.
//! - A Parrinello-Rahman barostat element, which consumes the virial.
//!
//! All role-to-role communication goes through the `Transport` trait, so the numerical code
//! doesn't know or care whether the other roles are threads, processes, or nodes. `LocalTransport`
//! runs everything in-process, and is what the tests use.
//!
//! On f32 vs f64: Long-range electrostatics are numerically sensitive, and we run them in f64
//! throughout.

mod barostat;
pub mod comm;
mod config;
mod ewald;
mod fft;
mod grid;
mod pme_only;
mod pp_pme;
mod redist;
mod session;
mod sim_box;
mod solve;
mod spline;
mod spread;
mod sum_qgrid;
mod util;
mod wire;

#[cfg(test)]
mod tests;

use std::{
    fmt,
    fmt::{Display, Formatter},
};

pub use barostat::{
    BarostatCheckpoint, BarostatTasks, CouplingType, ParrinelloRahmanBarostat, PrBarostatConfig,
    pressure_tensor,
};
pub use comm::{LocalTransport, RoleGroup, Tag, Transport};
pub use config::{CoulombType, PmeConfig};
pub use ewald::{CHARGE_UNIT_SCALER, ewald_coeff, ewald_self_energy, grid_dims_for_box};
pub use fft::DistributedFft;
pub use grid::{Decomposition, PmeGrid, pme_inconvenient_nnodes};
pub use pme_only::{PmeOnlyStats, PmeSignals, run_pme_only};
pub use pp_pme::{
    PmePpComm, PmeReply, PmeRequest, PmeRoleState, PpPmeLink, RoleLayout, StepRequest,
};
pub use redist::MaxShift;
pub use session::{PmeFlags, PmeSession, PmeStepOutput, StepInput};
pub use sim_box::{Matrix3, RecipBox, SimBox, wrap_to_unit_cell};
pub use spline::{PME_ORDER_MAX, PME_ORDER_MIN, bspline_moduli, bspline_weights};
pub use sum_qgrid::{SumDirection, sum_qgrid};
pub use util::{PmeCounters, PmeStageTimes};

/// Represents every problem the PME engine reports. Configuration and decomposition errors are
/// fatal to the caller: no partially-initialized session is returned. Transport errors are fatal
/// to the whole role group.
#[derive(Clone, Debug, PartialEq)]
pub enum PmeError {
    /// Invalid simulation parameters, e.g. an interpolation order out of range.
    Config(String),
    /// The grid can't be split across the requested process geometry.
    Decomposition(String),
    /// Grid or scratch storage couldn't be reserved.
    Allocation(String),
    /// A caller broke the call ordering, e.g. gathering before solving.
    Protocol(String),
    /// A send or receive failed; e.g. the other role hung up.
    Transport(String),
    /// A wire message couldn't be encoded or decoded.
    Codec(String),
}

impl PmeError {
    pub fn config(descrip: &str) -> Self {
        Self::Config(descrip.to_owned())
    }

    pub fn protocol(descrip: &str) -> Self {
        Self::Protocol(descrip.to_owned())
    }

    /// A stable, non-zero code for each category; 0 is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Decomposition(_) => 2,
            Self::Allocation(_) => 3,
            Self::Protocol(_) => 4,
            Self::Transport(_) => 5,
            Self::Codec(_) => 6,
        }
    }
}

impl Display for PmeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(d) => write!(f, "PME configuration error: {d}"),
            Self::Decomposition(d) => write!(f, "PME decomposition error: {d}"),
            Self::Allocation(d) => write!(f, "PME allocation failure: {d}"),
            Self::Protocol(d) => write!(f, "PME protocol violation: {d}"),
            Self::Transport(d) => write!(f, "PME transport failure: {d}"),
            Self::Codec(d) => write!(f, "PME message codec error: {d}"),
        }
    }
}

impl std::error::Error for PmeError {}
