//! The service loop of an electrostatics-only role: wait for coordinates, compute, reply,
//! until the PP roles call `finish`.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use log::info;

use crate::{
    PmeError,
    comm::{RoleGroup, Tag},
    pp_pme::{PmePpComm, PmeRequest},
    redist::MaxShift,
    session::{PmeFlags, PmeSession, StepInput},
};

/// Process-level signals seen by a PME role. Signal handlers (or anything else) set these; the
/// service loop forwards them to the PP peer with each reply. `term` stays set once raised;
/// `usr1` is cleared once forwarded.
#[derive(Debug, Default)]
pub struct PmeSignals {
    pub term: AtomicBool,
    pub usr1: AtomicBool,
}

impl PmeSignals {
    pub fn raise_term(&self) {
        self.term.store(true, Ordering::SeqCst);
    }

    pub fn raise_usr1(&self) {
        self.usr1.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PmeOnlyStats {
    pub steps: u64,
    pub last_step: Option<u64>,
    /// Largest request, in atoms.
    pub max_atoms: usize,
    /// Time spent computing, in μs.
    pub compute_us: u64,
    pub signals_forwarded: u64,
}

/// Redistribution is collective, so every PME role must limit it the same way. Each role
/// contributes (set, x, y) and their squares; all values agree iff n Σa² = (Σa)² for each, and
/// every role reaches the same verdict.
fn check_shift_bounds(group: &RoleGroup, shift: Option<MaxShift>) -> Result<(), PmeError> {
    let mine = match shift {
        Some(s) => [1., s.x as f64, s.y as f64],
        None => [0.; 3],
    };

    let mut sums = [0.; 6];
    for (i, v) in mine.iter().enumerate() {
        sums[i] = *v;
        sums[i + 3] = v * v;
    }
    group.sum(Tag::Reduce, &mut sums)?;

    let n = group.size() as f64;
    if (0..3).any(|i| n * sums[i + 3] != sums[i] * sums[i]) {
        return Err(PmeError::protocol(
            "PME roles received different shift bounds from their PP roles",
        ));
    }
    Ok(())
}

/// Serve the PP roles of `comm` until they finish. Every PME role of the session's group runs
/// this at the same time, since computing is collective over the group.
pub fn run_pme_only(
    comm: &mut PmePpComm,
    session: &mut PmeSession,
    signals: &PmeSignals,
) -> Result<PmeOnlyStats, PmeError> {
    let mut stats = PmeOnlyStats::default();

    info!(
        "PME-only role {} starting; serving PP roles {:?}",
        session.group().rank(),
        comm.served()
    );

    loop {
        let req = match comm.recv_q_x()? {
            PmeRequest::Finished => break,
            PmeRequest::Compute(r) => r,
        };

        let start = Instant::now();

        check_shift_bounds(session.group(), req.shift_bounds)?;

        let input = StepInput {
            posits: &req.posits,
            charges_a: &req.q_a,
            charges_b: req.q_b.as_deref(),
            atom_range: 0..req.natoms(),
            cell: req.cell,
            ewald_coeff: req.ewald_coeff,
            lambda: req.lambda,
            shift_bounds: req.shift_bounds,
            flags: PmeFlags::ALL,
        };
        let out = session.compute(&input)?;

        let cycles = start.elapsed().as_micros() as u64;

        let term = signals.term.load(Ordering::SeqCst);
        let usr1 = signals.usr1.swap(false, Ordering::SeqCst);
        if term || usr1 {
            info!(
                "PME role forwarding signals at step {}: term {term}, usr1 {usr1}",
                req.step
            );
            stats.signals_forwarded += 1;
        }

        comm.send_force_vir_ener(
            &out.forces,
            out.energy,
            &out.virial,
            out.dvdl,
            cycles,
            term,
            usr1,
        )?;

        stats.steps += 1;
        stats.last_step = Some(req.step);
        stats.max_atoms = stats.max_atoms.max(req.natoms());
        stats.compute_us += cycles;
    }

    info!(
        "PME-only role {} finished after {} steps",
        session.group().rank(),
        stats.steps
    );

    Ok(stats)
}
