//! Runs a small rock-salt lattice with particle (PP) roles and PME-only roles on threads, and
//! checks the reciprocal energy against a single-role computation each step.
//!
//! Run with `RUST_LOG=debug` to see the decomposition and per-role counters.

use std::{sync::Arc, thread};

use anyhow::{Context, Result, anyhow};
use dynamics_pme::{
    CHARGE_UNIT_SCALER, LocalTransport, PmeConfig, PmeOnlyStats, PmePpComm, PmeSession,
    PmeSignals, PpPmeLink, RoleGroup, RoleLayout, SimBox, StepInput, Tag, Transport,
    ewald_coeff, ewald_self_energy, grid_dims_for_box, run_pme_only, wrap_to_unit_cell,
};
use lin_alg::f64::Vec3;
use log::info;

const N_PP: usize = 4;
const N_PME: usize = 2;
const N_STEPS: u64 = 5;
/// Sites per box side.
const SITES: usize = 8;
/// Na-Cl distance, in Å.
const SPACING: f64 = 2.82;

fn lattice() -> Result<(SimBox, Vec<Vec3>, Vec<f64>)> {
    let l = SITES as f64 * SPACING;
    let cell = SimBox::orthorhombic(l, l, l)?;

    let mut posits = Vec::with_capacity(SITES.pow(3));
    let mut q = Vec::with_capacity(SITES.pow(3));

    for i in 0..SITES {
        for j in 0..SITES {
            for k in 0..SITES {
                posits.push(Vec3::new(
                    (i as f64 + 0.5) * SPACING,
                    (j as f64 + 0.5) * SPACING,
                    (k as f64 + 0.5) * SPACING,
                ));
                let sign = if (i + j + k) % 2 == 0 { 1. } else { -1. };
                q.push(sign * CHARGE_UNIT_SCALER);
            }
        }
    }

    Ok((cell, posits, q))
}

/// Deterministic thermal-ish displacement for a step.
fn displaced(cell: &SimBox, posits: &[Vec3], step: u64) -> Vec<Vec3> {
    posits
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let ph = step as f64 * 0.7 + i as f64;
            let d = Vec3::new(0.05 * ph.sin(), 0.05 * (1.3 * ph).cos(), 0.05 * (0.4 * ph).sin());
            wrap_to_unit_cell(cell, p + d)
        })
        .collect()
}

/// Returns the total reciprocal energy per step, summed over the PP group.
fn run_pp(
    t: Arc<dyn Transport>,
    layout: &RoleLayout,
    cell: &SimBox,
    posits: &[Vec3],
    q: &[f64],
    beta: f64,
) -> Result<Vec<f64>> {
    let pp_group = RoleGroup::new(t.clone(), layout.pp_ranks.clone())?;
    let me = pp_group.rank();
    let n = q.len();
    let range = me * n / N_PP..(me + 1) * n / N_PP;

    let mut link = PpPmeLink::new(t, layout)?;
    link.send_q(&q[range.clone()], None, None)?;

    let mut energies = Vec::with_capacity(N_STEPS as usize);
    for step in 0..N_STEPS {
        let x = displaced(cell, posits, step);
        link.send_x(step, &x[range.clone()], cell, beta, 0.)?;
        let reply = link.receive_f()?;

        let mut e = [reply.energy];
        pp_group.sum(Tag::User(step as u32), &mut e)?;
        energies.push(e[0]);
    }

    link.finish()?;
    Ok(energies)
}

fn run_pme(
    t: Arc<dyn Transport>,
    layout: &RoleLayout,
    cfg: &PmeConfig,
    homenr: usize,
    signals: &PmeSignals,
) -> Result<PmeOnlyStats> {
    let group = RoleGroup::new(t.clone(), layout.pme_ranks.clone())?;
    let mut session = PmeSession::new(group, N_PME, 1, cfg, homenr, false, false)?;
    let mut comm = PmePpComm::new(t, layout)?;

    let stats = run_pme_only(&mut comm, &mut session, signals)?;
    session.destroy();
    Ok(stats)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (cell, posits, q) = lattice()?;
    let [nkx, nky, nkz] = grid_dims_for_box(&cell, 1.);
    let cfg = PmeConfig {
        nkx,
        nky,
        nkz,
        ..Default::default()
    };
    let beta = ewald_coeff(cfg.cutoff, cfg.ewald_rtol)?;

    info!(
        "{} ions, box {:.2} Å, grid {nkx} x {nky} x {nkz}, β = {beta:.4} Å⁻¹",
        posits.len(),
        cell.m[0][0]
    );
    info!(
        "Self energy: {:.3} kcal/mol",
        ewald_self_energy(&q, beta, cfg.epsilon_r)
    );

    // Reference: one role does everything.
    let group = RoleGroup::world(Arc::new(LocalTransport::create(1).remove(0)));
    let mut reference = PmeSession::new(group, 1, 1, &cfg, posits.len(), false, false)?;
    let mut expected = Vec::new();
    for step in 0..N_STEPS {
        let x = displaced(&cell, &posits, step);
        expected.push(reference.compute(&StepInput::new(&x, &q, cell, beta))?.energy);
    }
    reference.destroy();

    let layout = RoleLayout::contiguous(N_PP, N_PME)?;
    let signals = PmeSignals::default();

    let mut transports: Vec<Arc<dyn Transport>> = LocalTransport::create(N_PP + N_PME)
        .into_iter()
        .map(|t| Arc::new(t) as Arc<dyn Transport>)
        .collect();
    let pme_transports = transports.split_off(N_PP);

    let (layout, cfg, signals) = (&layout, &cfg, &signals);
    let (posits, q) = (&posits[..], &q[..]);

    let (pp_results, pme_results) = thread::scope(|s| {
        let pme: Vec<_> = pme_transports
            .into_iter()
            .map(|t| s.spawn(move || run_pme(t, layout, cfg, posits.len(), signals)))
            .collect();
        let pp: Vec<_> = transports
            .into_iter()
            .map(|t| s.spawn(move || run_pp(t, layout, &cell, posits, q, beta)))
            .collect();

        (
            pp.into_iter()
                .map(|h| h.join().map_err(|_| anyhow!("A PP thread panicked")))
                .collect::<Vec<Result<Result<Vec<f64>>>>>(),
            pme.into_iter()
                .map(|h| h.join().map_err(|_| anyhow!("A PME thread panicked")))
                .collect::<Vec<Result<Result<PmeOnlyStats>>>>(),
        )
    });

    for (i, r) in pme_results.into_iter().enumerate() {
        let stats = r?.with_context(|| format!("PME role {i}"))?;
        info!(
            "PME role {i}: {} steps, up to {} atoms, {} μs computing",
            stats.steps, stats.max_atoms, stats.compute_us
        );
    }

    // Every PP role holds the group total.
    let mut per_role = Vec::with_capacity(N_PP);
    for (i, r) in pp_results.into_iter().enumerate() {
        per_role.push(r?.with_context(|| format!("PP role {i}"))?);
    }
    let energies = per_role.swap_remove(0);

    for (step, (e, e_ref)) in energies.iter().zip(&expected).enumerate() {
        let rel = ((e - e_ref) / e_ref).abs();
        info!("Step {step}: E_recip {e:.6} kcal/mol, single-role {e_ref:.6}, rel. diff {rel:.2e}");
        if rel > 1e-9 {
            return Err(anyhow!("Split run disagrees with the single-role run at step {step}"));
        }
    }

    Ok(())
}
