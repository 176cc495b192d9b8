//! Single-role numerical tests of the PME pipeline. Multi-role and role-split runs are tested
//! under `tests/`.

use std::{f64::consts::PI, sync::Arc};

use itertools::iproduct;
use lin_alg::f64::Vec3;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::*;
use crate::sim_box::ZERO_MATRIX;

const L: f64 = 20.;
const BETA: f64 = 0.35;

fn single_group() -> RoleGroup {
    let transport = LocalTransport::create(1).remove(0);
    RoleGroup::world(Arc::new(transport))
}

fn session(cfg: &PmeConfig, free_energy: bool) -> PmeSession {
    PmeSession::new(single_group(), 1, 1, cfg, 64, free_energy, false).unwrap()
}

fn accurate_cfg() -> PmeConfig {
    PmeConfig {
        pme_order: 6,
        ..Default::default()
    }
}

fn triclinic() -> SimBox {
    SimBox::new([[20., 0., 0.], [4., 19., 0.], [-3., 5., 22.]]).unwrap()
}

/// Random positions in the cell, and charges that sum to zero.
fn random_system(cell: &SimBox, n: usize, seed: u64) -> (Vec<Vec3>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let b = &cell.m;

    let posits = (0..n)
        .map(|_| {
            let s: [f64; 3] = [rng.random(), rng.random(), rng.random()];
            Vec3::new(
                s[0] * b[0][0] + s[1] * b[1][0] + s[2] * b[2][0],
                s[1] * b[1][1] + s[2] * b[2][1],
                s[2] * b[2][2],
            )
        })
        .collect();

    let mut q: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
    let mean = q.iter().sum::<f64>() / n as f64;
    for v in &mut q {
        *v -= mean;
    }

    (posits, q)
}

/// The reciprocal-space Ewald sum, evaluated directly over |indices| ≤ kmax.
fn direct_recip(
    posits: &[Vec3],
    q: &[f64],
    cell: &SimBox,
    beta: f64,
    kmax: i32,
) -> (f64, Vec<Vec3>) {
    let recip = cell.recip();
    let mut energy = 0.;
    let mut forces = vec![Vec3::new_zero(); posits.len()];

    for (mx, my, mz) in iproduct!(-kmax..=kmax, -kmax..=kmax, -kmax..=kmax) {
        if mx == 0 && my == 0 && mz == 0 {
            continue;
        }
        let m = recip.lattice_vec(mx as f64, my as f64, mz as f64);
        let m2 = m[0] * m[0] + m[1] * m[1] + m[2] * m[2];
        let w = (-PI * PI * m2 / (beta * beta)).exp() / m2;

        let phases: Vec<f64> = posits
            .iter()
            .map(|r| 2. * PI * (m[0] * r.x + m[1] * r.y + m[2] * r.z))
            .collect();

        let mut s_re = 0.;
        let mut s_im = 0.;
        for (th, qi) in phases.iter().zip(q) {
            s_re += qi * th.cos();
            s_im += qi * th.sin();
        }

        energy += w * (s_re * s_re + s_im * s_im);

        for (j, th) in phases.iter().enumerate() {
            let f = w * 4. * PI * q[j] * (s_re * th.sin() - s_im * th.cos());
            forces[j] += Vec3::new(m[0] * f, m[1] * f, m[2] * f);
        }
    }

    let c = 1. / (2. * PI * cell.volume());
    for f in &mut forces {
        *f = Vec3::new(f.x * c, f.y * c, f.z * c);
    }

    (energy * c, forces)
}

fn max_force_diff(a: &[Vec3], b: &[Vec3]) -> (f64, f64) {
    let diff = a
        .iter()
        .zip(b)
        .map(|(x, y)| (*x - *y).magnitude())
        .fold(0., f64::max);
    let scale = b.iter().map(|f| f.magnitude()).fold(0., f64::max);
    (diff, scale)
}

fn energy_at(cfg: &PmeConfig, cell: SimBox, posits: &[Vec3], q: &[f64]) -> f64 {
    let mut s = session(cfg, false);
    let input = StepInput {
        flags: PmeFlags::SPREAD_Q | PmeFlags::SOLVE,
        ..StepInput::new(posits, q, cell, BETA)
    };
    s.compute(&input).unwrap().energy
}

/// Apply x' = (I + ε e_a e_bᵀ) x to positions and box rows.
fn strained(cell: &SimBox, posits: &[Vec3], a: usize, b: usize, eps: f64) -> (SimBox, Vec<Vec3>) {
    let apply = |r: [f64; 3]| {
        let mut out = r;
        out[a] += eps * r[b];
        out
    };

    let m = cell.m.map(apply);
    let posits = posits
        .iter()
        .map(|p| {
            let r = apply([p.x, p.y, p.z]);
            Vec3::new(r[0], r[1], r[2])
        })
        .collect();

    (SimBox::new(m).unwrap(), posits)
}

#[test]
fn matches_direct_ewald_cubic() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q) = random_system(&cell, 16, 1);

    let mut s = session(&accurate_cfg(), false);
    let out = s.compute(&StepInput::new(&posits, &q, cell, BETA)).unwrap();

    let (e_ref, f_ref) = direct_recip(&posits, &q, &cell, BETA, 10);

    assert!(
        ((out.energy - e_ref) / e_ref).abs() < 1e-3,
        "PME {} vs direct {e_ref}",
        out.energy
    );

    let (diff, scale) = max_force_diff(&out.forces, &f_ref);
    assert!(diff < 1e-3 * scale, "Force error {diff} of {scale}");
}

#[test]
fn matches_direct_ewald_triclinic() {
    let cell = triclinic();
    let (posits, q) = random_system(&cell, 16, 2);

    let cfg = PmeConfig {
        nkz: 36,
        ..accurate_cfg()
    };
    let mut s = session(&cfg, false);
    let out = s.compute(&StepInput::new(&posits, &q, cell, BETA)).unwrap();

    let (e_ref, f_ref) = direct_recip(&posits, &q, &cell, BETA, 12);

    assert!(
        ((out.energy - e_ref) / e_ref).abs() < 1e-3,
        "PME {} vs direct {e_ref}",
        out.energy
    );

    let (diff, scale) = max_force_diff(&out.forces, &f_ref);
    assert!(diff < 1e-3 * scale, "Force error {diff} of {scale}");
}

#[test]
fn energy_is_positive_and_translation_invariant() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q) = random_system(&cell, 12, 3);
    let cfg = accurate_cfg();

    let e0 = energy_at(&cfg, cell, &posits, &q);
    assert!(e0 > 0.);

    let shift = Vec3::new(3.3, -1.7, 8.9);
    let moved: Vec<Vec3> = posits
        .iter()
        .map(|&p| wrap_to_unit_cell(&cell, p + shift))
        .collect();
    let e1 = energy_at(&cfg, cell, &moved, &q);

    assert!(((e1 - e0) / e0).abs() < 1e-4);
}

#[test]
fn forces_are_minus_energy_gradient() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q) = random_system(&cell, 8, 4);
    let cfg = PmeConfig::default();

    let mut s = session(&cfg, false);
    let out = s.compute(&StepInput::new(&posits, &q, cell, BETA)).unwrap();

    // The spline interpolation is smooth, so the PME forces are the exact gradient of the PME
    // energy, not only an approximation of the Ewald one.
    let h = 1e-5;
    for (i, d) in iproduct!([0, 5], 0..3) {
        let mut plus = posits.clone();
        let mut minus = posits.clone();
        match d {
            0 => {
                plus[i].x += h;
                minus[i].x -= h;
            }
            1 => {
                plus[i].y += h;
                minus[i].y -= h;
            }
            _ => {
                plus[i].z += h;
                minus[i].z -= h;
            }
        }
        let grad = (energy_at(&cfg, cell, &plus, &q) - energy_at(&cfg, cell, &minus, &q)) / (2. * h);

        let f = match d {
            0 => out.forces[i].x,
            1 => out.forces[i].y,
            _ => out.forces[i].z,
        };
        assert!((f + grad).abs() < 1e-5 * (1. + f.abs()), "{f} vs {}", -grad);
    }
}

#[test]
fn virial_matches_strain_derivative() {
    let cell = triclinic();
    let (posits, q) = random_system(&cell, 10, 5);
    let cfg = PmeConfig {
        nkz: 24,
        ..Default::default()
    };

    let mut s = session(&cfg, false);
    let out = s.compute(&StepInput::new(&posits, &q, cell, BETA)).unwrap();

    let eps = 1e-5;
    // Only deformations that keep the box lower-triangular: a ≤ b.
    for (a, b) in [(0, 0), (1, 1), (2, 2), (0, 1), (0, 2), (1, 2)] {
        let (c_plus, p_plus) = strained(&cell, &posits, a, b, eps);
        let (c_minus, p_minus) = strained(&cell, &posits, a, b, -eps);
        let de = (energy_at(&cfg, c_plus, &p_plus, &q) - energy_at(&cfg, c_minus, &p_minus, &q))
            / (2. * eps);

        let vir = out.virial[a][b];
        assert!(
            (vir - 0.5 * de).abs() < 1e-6 * out.energy.abs().max(1.),
            "Virial [{a}][{b}]: {vir} vs {}",
            0.5 * de
        );
        assert_eq!(out.virial[a][b], out.virial[b][a]);
    }
}

#[test]
fn calc_energy_is_twice_pme_energy() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q) = random_system(&cell, 12, 6);

    let mut s = session(&PmeConfig::default(), false);
    let out = s.compute(&StepInput::new(&posits, &q, cell, BETA)).unwrap();

    let sum_q_phi = s.calc_energy(&posits, &q).unwrap();
    assert!((sum_q_phi - 2. * out.energy).abs() < 1e-9 * out.energy.abs());

    // A test charge doesn't change the stored potential.
    let extra = [Vec3::new(1., 2., 3.)];
    let e_extra = s.calc_energy(&extra, &[0.5]).unwrap();
    assert!(e_extra.is_finite());
    assert_eq!(s.calc_energy(&posits, &q).unwrap(), sum_q_phi);

    assert!(matches!(
        s.calc_energy(&extra, &[0.5, 1.]),
        Err(PmeError::Protocol(_))
    ));

    // Not available once both charge states are on grids.
    let mut fe = session(&PmeConfig::default(), true);
    fe.compute(&StepInput {
        charges_b: Some(&q),
        ..StepInput::new(&posits, &q, cell, BETA)
    })
    .unwrap();
    assert!(matches!(
        fe.calc_energy(&posits, &q),
        Err(PmeError::Protocol(_))
    ));
}

#[test]
fn free_energy_endpoints_are_exact() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q_a) = random_system(&cell, 12, 7);
    let (_, q_b) = random_system(&cell, 12, 8);
    let cfg = PmeConfig::default();

    let pure_a = session(&cfg, false)
        .compute(&StepInput::new(&posits, &q_a, cell, BETA))
        .unwrap();
    let pure_b = session(&cfg, false)
        .compute(&StepInput::new(&posits, &q_b, cell, BETA))
        .unwrap();

    let mut fe = session(&cfg, true);
    for (lambda, pure) in [(0., &pure_a), (1., &pure_b)] {
        let out = fe
            .compute(&StepInput {
                charges_b: Some(&q_b),
                lambda,
                ..StepInput::new(&posits, &q_a, cell, BETA)
            })
            .unwrap();

        assert_eq!(out.energy, pure.energy);
        assert_eq!(out.forces, pure.forces);
        assert_eq!(out.virial, pure.virial);
        assert_eq!(out.dvdl, pure_b.energy - pure_a.energy);
    }

    let lambda = 0.3;
    let out = fe
        .compute(&StepInput {
            charges_b: Some(&q_b),
            lambda,
            ..StepInput::new(&posits, &q_a, cell, BETA)
        })
        .unwrap();
    let expected = (1. - lambda) * pure_a.energy + lambda * pure_b.energy;
    assert!((out.energy - expected).abs() < 1e-12 * expected.abs());

    // Without state-B charges, a free-energy session acts like a plain one.
    let out = fe.compute(&StepInput::new(&posits, &q_a, cell, BETA)).unwrap();
    assert_eq!(out.energy, pure_a.energy);
    assert_eq!(out.dvdl, 0.);
}

#[test]
fn split_flags_match_all() {
    let cell = triclinic();
    let (posits, q) = random_system(&cell, 12, 9);
    let cfg = PmeConfig::default();

    let all = session(&cfg, false)
        .compute(&StepInput::new(&posits, &q, cell, BETA))
        .unwrap();

    let mut s = session(&cfg, false);
    let base = StepInput::new(&posits, &q, cell, BETA);
    let mut outs = Vec::new();
    for flags in [PmeFlags::SPREAD_Q, PmeFlags::SOLVE, PmeFlags::CALC_F] {
        outs.push(s.compute(&StepInput { flags, ..base.clone() }).unwrap());
    }

    assert_eq!(outs[0], PmeStepOutput::default());
    assert_eq!(outs[1].energy, all.energy);
    assert_eq!(outs[1].virial, all.virial);
    assert!(outs[1].forces.is_empty());
    assert_eq!(outs[2].forces, all.forces);
    assert_eq!(outs[2].energy, 0.);

    // A gather can be repeated; the potential stays put.
    let again = s
        .compute(&StepInput {
            flags: PmeFlags::CALC_F,
            ..base.clone()
        })
        .unwrap();
    assert_eq!(again.forces, all.forces);

    // Forces come back for the requested range only.
    let ranged = session(&cfg, false)
        .compute(&StepInput {
            atom_range: 4..10,
            ..base
        })
        .unwrap();
    assert_eq!(ranged.forces.len(), 6);
}

#[test]
fn call_ordering_is_enforced() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q) = random_system(&cell, 6, 10);
    let base = StepInput::new(&posits, &q, cell, BETA);

    let mut s = session(&PmeConfig::default(), false);

    for flags in [PmeFlags::SOLVE, PmeFlags::CALC_F] {
        let r = s.compute(&StepInput { flags, ..base.clone() });
        assert!(matches!(r, Err(PmeError::Protocol(_))), "{flags:?}");
    }
    assert!(matches!(
        s.calc_energy(&posits, &q),
        Err(PmeError::Protocol(_))
    ));

    // Spread, then gather without a solve.
    s.compute(&StepInput {
        flags: PmeFlags::SPREAD_Q,
        ..base.clone()
    })
    .unwrap();
    let r = s.compute(&StepInput {
        flags: PmeFlags::CALC_F,
        ..base.clone()
    });
    assert!(matches!(r, Err(PmeError::Protocol(_))));

    // A solve consumes the charges.
    s.compute(&StepInput {
        flags: PmeFlags::SOLVE,
        ..base.clone()
    })
    .unwrap();
    let r = s.compute(&StepInput {
        flags: PmeFlags::SOLVE,
        ..base.clone()
    });
    assert!(matches!(r, Err(PmeError::Protocol(_))));

    let r = s.compute(&StepInput {
        charges_b: Some(&q),
        ..base.clone()
    });
    assert!(matches!(r, Err(PmeError::Protocol(_))));

    let r = s.compute(&StepInput {
        lambda: 1.5,
        ..base.clone()
    });
    assert!(matches!(r, Err(PmeError::Config(_))));

    let r = s.compute(&StepInput {
        atom_range: 0..7,
        ..base
    });
    assert!(matches!(r, Err(PmeError::Protocol(_))));
}

#[test]
fn bad_setup_is_rejected() {
    let bad_order = PmeConfig {
        pme_order: 2,
        ..Default::default()
    };
    let r = PmeSession::new(single_group(), 1, 1, &bad_order, 0, false, false);
    assert!(matches!(r, Err(PmeError::Config(_))));

    let r = PmeSession::new(single_group(), 2, 1, &PmeConfig::default(), 0, false, false);
    assert!(matches!(r, Err(PmeError::Config(_))));

    let not_pme = PmeConfig {
        coulomb_type: CoulombType::ReactionField,
        ..Default::default()
    };
    let r = PmeSession::new(single_group(), 1, 1, &not_pme, 0, false, false);
    assert_eq!(r.err().map(|e| e.code()), Some(1));
}

#[test]
fn fft_round_trip_scales_by_grid_size() {
    let cfg = PmeConfig {
        nkx: 10,
        nky: 12,
        nkz: 9,
        ..Default::default()
    };
    let decomp = Decomposition::new(cfg.grid_dims(), cfg.pme_order, 1, 1).unwrap();
    let group = single_group();
    let fft = DistributedFft::new(&decomp, &group).unwrap();

    let mut grid = PmeGrid::new(&decomp, 0, 0).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let [lx, ly, nz] = grid.local_shape();
    let h = decomp.halo();
    for (ix, iy, iz) in iproduct!(h..lx, h..ly, 0..nz) {
        grid.add(ix, iy, iz, rng.random_range(-1.0..1.0));
    }
    let orig = grid.clone();

    let c = fft.forward(&grid).unwrap();
    assert_eq!(c.len(), 12 * 5 * 10);

    // The k = 0 term is the sum of the grid.
    assert!((c[0].re - orig.owned_sum()).abs() < 1e-10);

    fft.inverse(c, &mut grid).unwrap();

    let n = (10 * 12 * 9) as f64;
    for (ix, iy, iz) in iproduct!(h..lx, h..ly, 0..nz) {
        assert!((grid.get(ix, iy, iz) - n * orig.get(ix, iy, iz)).abs() < 1e-9);
    }
}

#[test]
fn spread_conserves_charge() {
    let cell = triclinic();
    let (posits, _) = random_system(&cell, 20, 12);
    let q: Vec<f64> = (0..20).map(|i| 0.1 * (i + 1) as f64).collect();

    let mut s = session(&PmeConfig::default(), false);
    s.compute(&StepInput {
        flags: PmeFlags::SPREAD_Q,
        ..StepInput::new(&posits, &q, cell, BETA)
    })
    .unwrap();

    let total: f64 = q.iter().sum();
    let grid = s.grid(0).unwrap();
    assert!((grid.owned_sum() - total).abs() < 1e-10);
    assert!(s.grid(1).is_none());

    let counters = s.destroy();
    assert_eq!(counters.steps, 1);
    assert_eq!(counters.spread_points, 20 * 64);
}

#[test]
fn counters_track_stages() {
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let (posits, q) = random_system(&cell, 10, 13);

    let mut s = session(&PmeConfig::default(), false);
    for _ in 0..3 {
        s.compute(&StepInput::new(&posits, &q, cell, BETA)).unwrap();
    }

    let c = s.counters().clone();
    assert_eq!(c.steps, 3);
    assert_eq!(c.gather_points, 3 * 10 * 64);
    assert_eq!(c.solve_kpoints, 3 * 32 * 17 * 32);
    assert!(c.time_per_step().is_ok());
    assert_eq!(s.destroy(), c);
}

#[test]
fn self_energy_and_zero_virial_for_empty_grid() {
    let q = [1., -1.];
    let e_self = ewald_self_energy(&q, BETA, 1.);
    assert!((e_self + 2. * BETA / PI.sqrt()).abs() < 1e-12);

    // No charges: nothing to solve.
    let cell = SimBox::orthorhombic(L, L, L).unwrap();
    let posits = [Vec3::new(1., 1., 1.)];
    let mut s = session(&PmeConfig::default(), false);
    let out = s
        .compute(&StepInput::new(&posits, &[0.], cell, BETA))
        .unwrap();
    assert_eq!(out.energy, 0.);
    assert_eq!(out.virial, ZERO_MATRIX);
    assert_eq!(out.forces, vec![Vec3::new_zero()]);
}
