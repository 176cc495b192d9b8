//! Simulation parameters the PME engine needs. These are fixed for the lifetime of a session;
//! the box and Ewald coefficient are passed every step.

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};

use crate::{
    PmeError,
    ewald::check_ewald_params,
    spline::{PME_ORDER_MAX, PME_ORDER_MIN},
};

/// The electrostatics treatment selected for the run. Only the PME flavours use this engine;
/// the others are accepted here so a full run configuration can be validated in one place.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CoulombType {
    #[default]
    Pme,
    /// PME with a switched real-space term.
    PmeSwitch,
    /// PME with a user-tabulated real-space term.
    PmeUser,
    ReactionField,
    Cutoff,
}

impl CoulombType {
    pub fn is_pme(self) -> bool {
        matches!(self, Self::Pme | Self::PmeSwitch | Self::PmeUser)
    }
}

#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, PartialEq)]
pub struct PmeConfig {
    /// Grid points along each box vector. See `grid_dims_for_box` for a way to pick these.
    pub nkx: usize,
    pub nky: usize,
    pub nkz: usize,
    /// B-spline interpolation order. 4 is the safe default; higher is more accurate, and slower.
    pub pme_order: usize,
    /// Relative dielectric constant. The Coulomb prefactor is 1/ε_r, with Amber-scaled charges.
    pub epsilon_r: f64,
    pub coulomb_type: CoulombType,
    /// Real-space cutoff, in Å. Used with `ewald_rtol` to derive the Ewald coefficient.
    pub cutoff: f64,
    /// Relative strength of the Ewald-shifted direct potential at the cutoff.
    pub ewald_rtol: f64,
}

impl Default for PmeConfig {
    fn default() -> Self {
        Self {
            nkx: 32,
            nky: 32,
            nkz: 32,
            pme_order: 4,
            epsilon_r: 1.,
            coulomb_type: CoulombType::Pme,
            cutoff: 10.,
            ewald_rtol: 1e-5,
        }
    }
}

impl PmeConfig {
    pub fn grid_dims(&self) -> [usize; 3] {
        [self.nkx, self.nky, self.nkz]
    }

    /// Checks that don't depend on the process geometry.
    pub fn validate(&self) -> Result<(), PmeError> {
        if !self.coulomb_type.is_pme() {
            return Err(PmeError::Config(format!(
                "Coulomb type {:?} doesn't use PME",
                self.coulomb_type
            )));
        }

        if !(PME_ORDER_MIN..=PME_ORDER_MAX).contains(&self.pme_order) {
            return Err(PmeError::Config(format!(
                "PME order {} is outside the supported range {PME_ORDER_MIN}..={PME_ORDER_MAX}",
                self.pme_order
            )));
        }

        for (name, n) in [("nkx", self.nkx), ("nky", self.nky), ("nkz", self.nkz)] {
            if n < self.pme_order {
                return Err(PmeError::Config(format!(
                    "Grid dimension {name} = {n} is smaller than the interpolation order {}",
                    self.pme_order
                )));
            }
        }

        if !(self.epsilon_r.is_finite() && self.epsilon_r > 0.) {
            return Err(PmeError::config("epsilon_r must be positive and finite."));
        }

        check_ewald_params(self.cutoff, self.ewald_rtol)?;

        Ok(())
    }
}
