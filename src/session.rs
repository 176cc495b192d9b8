//! The PME session: grid storage, FFT plans, and spline moduli for a run, and the per-step
//! pipeline that uses them.
//!
//! Every PME role of a group creates a session over the same `RoleGroup`, and calls `compute`
//! with the same flags each step; most stages are collective over the group.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign, Range},
    time::Instant,
};

use lin_alg::f64::Vec3;
use log::{debug, info, warn};

use crate::{
    PmeConfig, PmeError,
    comm::RoleGroup,
    ewald::grid_density,
    fft::DistributedFft,
    grid::{Decomposition, PmeGrid, pme_inconvenient_nnodes},
    redist::{LocalAtoms, MaxShift, RedistPlan, redistribute, return_forces},
    sim_box::{Matrix3, RecipBox, SimBox, ZERO_MATRIX, mat_add, mat_scale},
    solve::{SolveParams, solve_pme},
    spline::{AtomSpline, bspline_moduli, make_splines},
    spread::{gather_energy, gather_forces, spread_charges},
    sum_qgrid::{SumDirection, sum_qgrid},
    util::PmeCounters,
};

/// Which pipeline stages a `compute` call runs. Any combination is allowed, as long as the
/// stages it skips already ran: e.g. `SOLVE` alone re-solves charges spread by an earlier call.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PmeFlags(u8);

impl PmeFlags {
    pub const NONE: Self = Self(0);
    /// Redistribute atoms, spread charges, and sum halos into owners.
    pub const SPREAD_Q: Self = Self(1);
    /// Forward transform, solve, inverse transform, and copy the potential out to halos.
    pub const SOLVE: Self = Self(1 << 1);
    /// Gather forces from the potential, and return them to their callers.
    pub const CALC_F: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }
}

impl BitOr for PmeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PmeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PmeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::SPREAD_Q, "SPREAD_Q"),
            (Self::SOLVE, "SOLVE"),
            (Self::CALC_F, "CALC_F"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();

        write!(f, "PmeFlags({})", names.join(" | "))
    }
}

/// Inputs to one `compute` call. Charges are in Amber units; positions must be inside the
/// primary unit cell of `cell` (see `wrap_to_unit_cell`).
#[derive(Clone, Debug)]
pub struct StepInput<'a> {
    pub posits: &'a [Vec3],
    pub charges_a: &'a [f64],
    /// State-B charges, for free-energy runs. Requires a session created with free-energy
    /// buffers.
    pub charges_b: Option<&'a [f64]>,
    /// The atoms this role handles: `posits[atom_range]` etc. Forces come back in this order.
    pub atom_range: Range<usize>,
    pub cell: SimBox,
    pub ewald_coeff: f64,
    /// Free-energy coupling parameter, 0 (state A) to 1 (state B).
    pub lambda: f64,
    pub shift_bounds: Option<MaxShift>,
    pub flags: PmeFlags,
}

impl<'a> StepInput<'a> {
    /// All atoms, state A only, all stages.
    pub fn new(posits: &'a [Vec3], charges: &'a [f64], cell: SimBox, ewald_coeff: f64) -> Self {
        Self {
            posits,
            charges_a: charges,
            charges_b: None,
            atom_range: 0..posits.len(),
            cell,
            ewald_coeff,
            lambda: 0.,
            shift_bounds: None,
            flags: PmeFlags::ALL,
        }
    }
}

/// This role's results. Energy and virial are this role's share of k-space; sum them over the
/// PME group for totals. They're zero unless the call included `SOLVE`; forces are empty
/// unless it included `CALC_F`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PmeStepOutput {
    /// Reciprocal-space forces on `posits[atom_range]`, in kcal/(mol·Å).
    pub forces: Vec<Vec3>,
    /// Reciprocal-space energy, in kcal/mol. Doesn't include the self term.
    pub energy: f64,
    /// Ξ = -½ Σ r ⊗ F.
    pub virial: Matrix3,
    /// dE/dλ, accumulated over this call.
    pub dvdl: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GridState {
    Empty,
    /// Charges spread, and halos summed into owners.
    Charges,
    /// Potential, with halos filled in from owners.
    Potential,
}

struct GridSlot {
    grid: PmeGrid,
    state: GridState,
}

/// What one stage leaves for the next. Persists across calls, so split-flag calls work.
#[derive(Default)]
struct StepState {
    atoms: LocalAtoms,
    plan: RedistPlan,
    splines: Vec<AtomSpline>,
    /// The box charges were spread in.
    cell: Option<SimBox>,
    /// Both grids hold data this step.
    dual: bool,
}

pub struct PmeSession {
    cfg: PmeConfig,
    decomp: Decomposition,
    group: RoleGroup,
    fft: DistributedFft,
    bsp_mod: [Vec<f64>; 3],
    /// State A, and state B for free-energy sessions.
    grids: Vec<GridSlot>,
    free_energy: bool,
    reproducible: bool,
    step: StepState,
    counters: PmeCounters,
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

impl PmeSession {
    /// Set up a PME role. `group` is the PME group, in decomposition rank order; its size must
    /// be `nnodes_major * nnodes_minor`. `homenr` is the expected number of local atoms, for
    /// sizing buffers. With `free_energy`, a second grid is allocated for state-B charges. With
    /// `reproducible`, halo sums add contributions in a fixed order.
    ///
    /// Fails without side effects on invalid parameters or geometry, or if grid storage can't be
    /// reserved.
    pub fn new(
        group: RoleGroup,
        nnodes_major: usize,
        nnodes_minor: usize,
        cfg: &PmeConfig,
        homenr: usize,
        free_energy: bool,
        reproducible: bool,
    ) -> Result<Self, PmeError> {
        cfg.validate()?;

        if group.size() != nnodes_major * nnodes_minor {
            return Err(PmeError::Config(format!(
                "A PME group of {} roles can't be arranged as {nnodes_major} x {nnodes_minor}",
                group.size()
            )));
        }

        let decomp = Decomposition::new(cfg.grid_dims(), cfg.pme_order, nnodes_major, nnodes_minor)?;
        let rank = group.rank();

        if pme_inconvenient_nnodes(cfg.nkx, cfg.nky, nnodes_major) > 0 {
            warn!(
                "{nnodes_major} major PME roles split a {} x {} grid unevenly",
                cfg.nkx, cfg.nky
            );
        }

        let n_grids = if free_energy { 2 } else { 1 };
        let mut grids = Vec::with_capacity(n_grids);
        for i in 0..n_grids {
            grids.push(GridSlot {
                grid: PmeGrid::new(&decomp, rank, i as u8)?,
                state: GridState::Empty,
            });
        }

        let fft = DistributedFft::new(&decomp, &group)?;

        let bsp_mod = [
            bspline_moduli(cfg.nkx, cfg.pme_order),
            bspline_moduli(cfg.nky, cfg.pme_order),
            bspline_moduli(cfg.nkz, cfg.pme_order),
        ];

        let mut step = StepState::default();
        step.atoms.posits.reserve(homenr);
        step.atoms.q_a.reserve(homenr);
        step.splines.reserve(homenr);

        if rank == 0 {
            info!(
                "PME: grid {} x {} x {}, order {}, {} x {} roles{}{}",
                cfg.nkx,
                cfg.nky,
                cfg.nkz,
                cfg.pme_order,
                nnodes_major,
                nnodes_minor,
                if free_energy { ", free energy" } else { "" },
                if reproducible { ", reproducible sums" } else { "" },
            );
        }
        debug!(
            "PME rank {rank}: x {:?}, y {:?}, ky {:?}, kz {:?}",
            decomp.x_range(decomp.coords(rank).0),
            decomp.y_range(decomp.coords(rank).1),
            decomp.ky_range(decomp.coords(rank).0),
            decomp.kz_range(decomp.coords(rank).1),
        );

        Ok(Self {
            cfg: cfg.clone(),
            decomp,
            group,
            fft,
            bsp_mod,
            grids,
            free_energy,
            reproducible,
            step,
            counters: PmeCounters::default(),
        })
    }

    pub fn config(&self) -> &PmeConfig {
        &self.cfg
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomp
    }

    pub fn group(&self) -> &RoleGroup {
        &self.group
    }

    pub fn counters(&self) -> &PmeCounters {
        &self.counters
    }

    pub fn free_energy(&self) -> bool {
        self.free_energy
    }

    /// The grid of state A (0) or B (1), e.g. for inspection after spreading.
    pub fn grid(&self, index: usize) -> Option<&PmeGrid> {
        self.grids.get(index).map(|s| &s.grid)
    }

    /// Run the stages selected by `input.flags`, in pipeline order. Collective over the group.
    pub fn compute(&mut self, input: &StepInput) -> Result<PmeStepOutput, PmeError> {
        let mut out = PmeStepOutput::default();

        if !(0. ..=1.).contains(&input.lambda) {
            return Err(PmeError::Config(format!(
                "λ = {} is outside [0, 1]",
                input.lambda
            )));
        }

        if input.flags.contains(PmeFlags::SPREAD_Q) {
            self.spread(input)?;
        }

        if input.flags.contains(PmeFlags::SOLVE) {
            let (energy, virial, dvdl) = self.solve(input.ewald_coeff, input.lambda)?;
            out.energy = energy;
            out.virial = virial;
            out.dvdl = dvdl;
        }

        if input.flags.contains(PmeFlags::CALC_F) {
            out.forces = self.gather(input.lambda)?;
        }

        Ok(out)
    }

    fn spread(&mut self, input: &StepInput) -> Result<(), PmeError> {
        let range = input.atom_range.clone();
        let n_total = input.posits.len();

        if range.end > n_total
            || input.charges_a.len() != n_total
            || input.charges_b.is_some_and(|b| b.len() != n_total)
        {
            return Err(PmeError::Protocol(format!(
                "Atom range {range:?} doesn't fit {n_total} positions and their charges"
            )));
        }

        if input.charges_b.is_some() && !self.free_energy {
            return Err(PmeError::protocol(
                "State-B charges given to a session created without free-energy buffers",
            ));
        }

        let posits = &input.posits[range.clone()];
        let q_a = &input.charges_a[range.clone()];
        let q_b = input.charges_b.map(|b| &b[range.clone()]);
        let recip = input.cell.recip();

        let start = Instant::now();
        let (atoms, plan) = redistribute(
            &self.group,
            &self.decomp,
            &recip,
            posits,
            q_a,
            q_b,
            input.shift_bounds,
        )?;
        self.counters.redist_sum += elapsed_us(start);

        let start = Instant::now();
        let splines = make_splines(
            &atoms.posits,
            &recip,
            self.decomp.dims,
            self.decomp.order,
        );

        let dual = atoms.q_b.is_some();

        for (i, slot) in self.grids.iter_mut().enumerate() {
            slot.grid.zero();
            slot.state = GridState::Empty;

            let q = match (i, &atoms.q_b) {
                (0, _) => &atoms.q_a,
                (_, Some(q_b)) => q_b,
                _ => continue,
            };
            self.counters.spread_points += spread_charges(&mut slot.grid, &splines, q);
        }
        self.counters.spread_sum += elapsed_us(start);

        let start = Instant::now();
        let n_active = if dual { 2 } else { 1 };
        for slot in &mut self.grids[..n_active] {
            sum_qgrid(
                &mut slot.grid,
                &self.group,
                SumDirection::Forward,
                self.reproducible,
            )?;
            slot.state = GridState::Charges;
        }
        self.counters.halo_sum += elapsed_us(start);

        self.step = StepState {
            atoms,
            plan,
            splines,
            cell: Some(input.cell),
            dual,
        };
        self.counters.steps += 1;

        Ok(())
    }

    fn n_active(&self) -> usize {
        if self.step.dual { 2 } else { 1 }
    }

    /// Returns (energy, virial, dvdλ), blended over λ for dual-grid steps.
    fn solve(&mut self, beta: f64, lambda: f64) -> Result<(f64, Matrix3, f64), PmeError> {
        let n_active = self.n_active();

        if self.grids[..n_active]
            .iter()
            .any(|s| s.state != GridState::Charges)
        {
            return Err(PmeError::protocol(
                "SOLVE requested without freshly spread charges",
            ));
        }
        let Some(cell) = self.step.cell else {
            return Err(PmeError::protocol("SOLVE requested before any spread"));
        };
        let recip = cell.recip();
        let (ky_range, kz_range) = self.fft.recip_ranges();

        let params = SolveParams {
            dims: self.decomp.dims,
            ky_range,
            kz_range,
            recip: &recip,
            volume: cell.volume(),
            beta,
            epsilon_r: self.cfg.epsilon_r,
            bsp_mod: &self.bsp_mod,
        };

        let mut energies = [0.; 2];
        let mut virials = [ZERO_MATRIX; 2];

        for (i, slot) in self.grids[..n_active].iter_mut().enumerate() {
            let start = Instant::now();
            let mut c = self.fft.forward(&slot.grid)?;
            self.counters.fft_sum += elapsed_us(start);

            let start = Instant::now();
            let res = solve_pme(&mut c, &params);
            self.counters.solve_sum += elapsed_us(start);
            self.counters.solve_kpoints += res.kpoints;

            let start = Instant::now();
            self.fft.inverse(c, &mut slot.grid)?;
            self.counters.fft_sum += elapsed_us(start);
            self.counters.fft_lines += 2 * self.fft.lines_per_transform();

            let start = Instant::now();
            sum_qgrid(
                &mut slot.grid,
                &self.group,
                SumDirection::Backward,
                self.reproducible,
            )?;
            self.counters.halo_sum += elapsed_us(start);

            slot.state = GridState::Potential;
            energies[i] = res.energy;
            virials[i] = res.virial;
        }

        if n_active == 1 {
            return Ok((energies[0], virials[0], 0.));
        }

        let energy = (1. - lambda) * energies[0] + lambda * energies[1];
        let virial = mat_add(
            &mat_scale(&virials[0], 1. - lambda),
            &mat_scale(&virials[1], lambda),
        );
        Ok((energy, virial, energies[1] - energies[0]))
    }

    fn gather(&mut self, lambda: f64) -> Result<Vec<Vec3>, PmeError> {
        let n_active = self.n_active();

        if self.grids[..n_active]
            .iter()
            .any(|s| s.state != GridState::Potential)
        {
            return Err(PmeError::protocol(
                "CALC_F requested without a solved potential",
            ));
        }
        let Some(cell) = self.step.cell else {
            return Err(PmeError::protocol("CALC_F requested before any spread"));
        };
        let recip: RecipBox = cell.recip();

        let start = Instant::now();
        let atoms = &self.step.atoms;
        let splines = &self.step.splines;

        let mut forces = if n_active == 1 {
            gather_forces(&self.grids[0].grid, splines, &atoms.q_a, &recip, 1.)
        } else {
            gather_forces(&self.grids[0].grid, splines, &atoms.q_a, &recip, 1. - lambda)
        };

        if n_active == 2
            && let Some(q_b) = &atoms.q_b
        {
            let f_b = gather_forces(&self.grids[1].grid, splines, q_b, &recip, lambda);
            for (f, fb) in forces.iter_mut().zip(f_b) {
                *f += fb;
            }
        }

        let order = self.decomp.order as u64;
        self.counters.gather_points += n_active as u64 * splines.len() as u64 * order.pow(3);
        self.counters.gather_sum += elapsed_us(start);

        let start = Instant::now();
        let result = return_forces(&self.group, &self.step.plan, forces)?;
        self.counters.redist_sum += elapsed_us(start);

        Ok(result)
    }

    /// Σ q φ(r) for the given atoms, interpolated from the stored potential; no charges are
    /// spread. Requires an earlier `compute` with `SPREAD_Q | SOLVE`. Only for a single-role
    /// session without free energy; the atoms must be in the box of that call.
    pub fn calc_energy(&self, posits: &[Vec3], charges: &[f64]) -> Result<f64, PmeError> {
        // The stored potential only covers this role's slab, and only state A.
        if self.group.size() != 1 {
            return Err(PmeError::Protocol(format!(
                "calc_energy needs a single-role session; this one has {} roles",
                self.group.size()
            )));
        }
        if self.step.dual {
            return Err(PmeError::protocol(
                "calc_energy doesn't support free-energy runs",
            ));
        }

        if posits.len() != charges.len() {
            return Err(PmeError::Protocol(format!(
                "{} positions and {} charges",
                posits.len(),
                charges.len()
            )));
        }

        let slot = &self.grids[0];
        let Some(cell) = self.step.cell else {
            return Err(PmeError::protocol("calc_energy called before any spread"));
        };
        if slot.state != GridState::Potential {
            return Err(PmeError::protocol(
                "calc_energy called without a solved potential",
            ));
        }

        let splines = make_splines(posits, &cell.recip(), self.decomp.dims, self.decomp.order);
        Ok(gather_energy(&slot.grid, &splines, charges))
    }

    /// Release the session's grids and buffers, and log what it did. Returns its counters.
    pub fn destroy(self) -> PmeCounters {
        if self.counters.steps > 0 {
            info!(
                "PME rank {} teardown. {}",
                self.group.rank(),
                self.counters
            );
        }

        debug!(
            "PME rank {}: {:.3} grid points per Å³ at the last box",
            self.group.rank(),
            self.step
                .cell
                .map(|c| grid_density(self.decomp.dims, &c))
                .unwrap_or(0.)
        );

        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let f = PmeFlags::SPREAD_Q | PmeFlags::SOLVE;
        assert!(f.contains(PmeFlags::SPREAD_Q));
        assert!(!f.contains(PmeFlags::CALC_F));
        assert!(PmeFlags::ALL.contains(f));
        assert_eq!(PmeFlags::from_bits(f.bits()), Some(f));
        assert_eq!(PmeFlags::from_bits(8), None);
        assert_eq!(format!("{f:?}"), "PmeFlags(SPREAD_Q | SOLVE)");
    }
}
