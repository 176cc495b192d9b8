//! Multi-role PME runs over `LocalTransport`, compared against a single role.

use std::{sync::Arc, thread, time::Duration};

use dynamics_pme::{
    LocalTransport, Matrix3, MaxShift, PmeConfig, PmeError, PmeFlags, PmeSession, PmeStepOutput,
    RoleGroup, SimBox, StepInput, Tag,
};
use lin_alg::f64::Vec3;
use rand::{Rng, SeedableRng, rngs::StdRng};

const BETA: f64 = 0.35;

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

struct Combined {
    energy: f64,
    virial: Matrix3,
    /// In the original atom order.
    forces: Vec<Vec3>,
}

/// Atoms are dealt out round-robin, so most start on a role that doesn't own them.
fn run_roles(
    n_major: usize,
    n_minor: usize,
    cfg: &PmeConfig,
    cell: SimBox,
    posits: &[Vec3],
    q: &[f64],
    reproducible: bool,
) -> Combined {
    let n = n_major * n_minor;
    let parts: Vec<(Vec<Vec3>, Vec<f64>)> = (0..n)
        .map(|r| {
            (
                posits.iter().skip(r).step_by(n).copied().collect(),
                q.iter().skip(r).step_by(n).copied().collect(),
            )
        })
        .collect();

    let outputs: Vec<PmeStepOutput> = thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::create(n)
            .into_iter()
            .zip(&parts)
            .map(|(t, (p, q))| {
                s.spawn(move || {
                    let group = RoleGroup::world(Arc::new(t));
                    let mut session =
                        PmeSession::new(group, n_major, n_minor, cfg, p.len(), false, reproducible)?;
                    session.compute(&StepInput::new(p, q, cell, BETA))
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    let mut energy = 0.;
    let mut virial = [[0.; 3]; 3];
    let mut forces = vec![Vec3::new_zero(); posits.len()];

    for (r, out) in outputs.iter().enumerate() {
        energy += out.energy;
        for i in 0..3 {
            for j in 0..3 {
                virial[i][j] += out.virial[i][j];
            }
        }
        assert_eq!(out.forces.len(), parts[r].0.len());
        for (k, f) in out.forces.iter().enumerate() {
            forces[r + k * n] = *f;
        }
    }

    Combined {
        energy,
        virial,
        forces,
    }
}

fn assert_close(a: &Combined, b: &Combined) {
    assert!(
        ((a.energy - b.energy) / b.energy).abs() < 1e-10,
        "{} vs {}",
        a.energy,
        b.energy
    );

    for i in 0..3 {
        for j in 0..3 {
            assert!((a.virial[i][j] - b.virial[i][j]).abs() < 1e-10 * b.energy.abs());
        }
    }

    let scale = b.forces.iter().map(|f| f.magnitude()).fold(0., f64::max);
    for (fa, fb) in a.forces.iter().zip(&b.forces) {
        assert!((*fa - *fb).magnitude() < 1e-9 * scale);
    }
}

#[test]
fn slab_split_matches_single_role() {
    let cell = SimBox::new([[24., 0., 0.], [3., 22., 0.], [-2., 4., 26.]]).unwrap();
    let (posits, q) = random_system(&cell, 40, 21);
    let cfg = PmeConfig::default();

    let single = run_roles(1, 1, &cfg, cell, &posits, &q, false);
    let split = run_roles(2, 1, &cfg, cell, &posits, &q, false);

    assert_close(&split, &single);
}

#[test]
fn pencil_split_matches_single_role() {
    let cell = SimBox::orthorhombic(25., 25., 25.).unwrap();
    let (posits, q) = random_system(&cell, 50, 22);
    let cfg = PmeConfig {
        nkx: 30,
        nky: 28,
        nkz: 27,
        ..Default::default()
    };

    let single = run_roles(1, 1, &cfg, cell, &posits, &q, false);
    let split = run_roles(2, 2, &cfg, cell, &posits, &q, false);
    assert_close(&split, &single);

    // An uneven split: 28 ky planes over 3 major roles.
    let split = run_roles(3, 2, &cfg, cell, &posits, &q, false);
    assert_close(&split, &single);
}

/// Owned cells of the charge grid after spreading, as ((gx, gy, z), value).
fn spread_cells(
    n_major: usize,
    n_minor: usize,
    cfg: &PmeConfig,
    cell: SimBox,
    posits: &[Vec3],
    q: &[f64],
) -> Vec<((usize, usize, usize), f64)> {
    let n = n_major * n_minor;

    let per_role: Vec<Vec<_>> = thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::create(n)
            .into_iter()
            .enumerate()
            .map(|(r, t)| {
                s.spawn(move || {
                    let group = RoleGroup::world(Arc::new(t));
                    let mut session =
                        PmeSession::new(group, n_major, n_minor, cfg, 0, false, false)?;

                    // Each role starts with a different share of the atoms.
                    let p: Vec<Vec3> = posits.iter().skip(r).step_by(n).copied().collect();
                    let qr: Vec<f64> = q.iter().skip(r).step_by(n).copied().collect();
                    session.compute(&StepInput {
                        flags: PmeFlags::SPREAD_Q,
                        ..StepInput::new(&p, &qr, cell, BETA)
                    })?;

                    let grid = session.grid(0).unwrap();
                    let [lx, ly, nz] = grid.local_shape();
                    let mut cells = Vec::new();
                    for ix in 0..lx {
                        for iy in 0..ly {
                            if !grid.is_owned(ix, iy) {
                                continue;
                            }
                            for iz in 0..nz {
                                cells.push((
                                    (grid.global_x(ix), grid.global_y(iy), iz),
                                    grid.get(ix, iy, iz),
                                ));
                            }
                        }
                    }
                    Ok::<_, PmeError>(cells)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    let mut cells: Vec<_> = per_role.into_iter().flatten().collect();
    cells.sort_by_key(|c| c.0);
    cells
}

#[test]
fn forward_reduction_sums_every_contribution() {
    let cell = SimBox::orthorhombic(18., 18., 18.).unwrap();
    let (posits, q) = random_system(&cell, 60, 24);
    let cfg = PmeConfig {
        nkx: 18,
        nky: 20,
        nkz: 16,
        pme_order: 5,
        ..Default::default()
    };

    let single = spread_cells(1, 1, &cfg, cell, &posits, &q);
    assert_eq!(single.len(), 18 * 20 * 16);

    for (maj, min) in [(2, 1), (3, 1), (2, 2), (3, 2)] {
        let split = spread_cells(maj, min, &cfg, cell, &posits, &q);

        // Every logical cell is owned exactly once.
        assert_eq!(split.len(), single.len());
        for (a, b) in split.iter().zip(&single) {
            assert_eq!(a.0, b.0);
            assert!((a.1 - b.1).abs() < 1e-12, "{maj} x {min} at {:?}", a.0);
        }
    }
}

#[test]
fn reproducible_sums_are_bit_identical() {
    let cell = SimBox::orthorhombic(20., 20., 20.).unwrap();
    let (posits, q) = random_system(&cell, 30, 23);
    let cfg = PmeConfig::default();

    let a = run_roles(2, 2, &cfg, cell, &posits, &q, true);
    let b = run_roles(2, 2, &cfg, cell, &posits, &q, true);

    assert_eq!(a.energy, b.energy);
    assert_eq!(a.virial, b.virial);
    assert_eq!(a.forces, b.forces);
}

#[test]
fn group_sum_gives_every_role_the_total() {
    let n = 4;
    let totals: Vec<Vec<f64>> = thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::create(n)
            .into_iter()
            .map(|t| {
                s.spawn(move || {
                    let group = RoleGroup::world(Arc::new(t));
                    let r = group.rank() as f64;
                    let mut vals = [r, 10. * r, 1.];
                    group.sum(Tag::User(7), &mut vals)?;
                    Ok::<_, PmeError>(vals.to_vec())
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    for t in totals {
        assert_eq!(t, vec![6., 60., 4.]);
    }
}

#[test]
fn atoms_beyond_shift_bounds_are_rejected() {
    let cell = SimBox::orthorhombic(20., 20., 20.).unwrap();
    let cfg = PmeConfig::default();
    let shift = MaxShift { x: 0, y: 0 };

    // Rank 0 owns x < 10, rank 1 x ≥ 10.
    let local = [vec![Vec3::new(2., 5., 5.)], vec![Vec3::new(15., 5., 5.)]];
    let foreign = [vec![Vec3::new(15., 5., 5.)], vec![Vec3::new(12., 5., 5.)]];
    let q = [1.];

    let run = |sets: &[Vec<Vec3>; 2]| -> Vec<Result<PmeStepOutput, PmeError>> {
        thread::scope(|s| {
            let handles: Vec<_> = LocalTransport::create_with_timeout(2, Duration::from_millis(500))
                .into_iter()
                .zip(sets)
                .map(|(t, p)| {
                    let cfg = &cfg;
                    s.spawn(move || {
                        let group = RoleGroup::world(Arc::new(t));
                        let mut session = PmeSession::new(group, 2, 1, cfg, 1, false, false)?;
                        session.compute(&StepInput {
                            shift_bounds: Some(shift),
                            flags: PmeFlags::SPREAD_Q | PmeFlags::SOLVE,
                            ..StepInput::new(p, &q, cell, BETA)
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    };

    let ok = run(&local);
    assert!(ok.iter().all(|r| r.is_ok()));

    let bad = run(&foreign);
    assert!(matches!(bad[0], Err(PmeError::Protocol(_))));
    // Its partner is left waiting for rank 0's halo, and times out.
    assert!(matches!(bad[1], Err(PmeError::Transport(_))));
}

#[test]
fn uneven_geometry_is_rejected() {
    let cfg = PmeConfig {
        nkx: 8,
        nky: 8,
        nkz: 8,
        ..Default::default()
    };

    // More major roles than x planes.
    let results: Vec<Result<(), PmeError>> = thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::create(9)
            .into_iter()
            .map(|t| {
                let cfg = &cfg;
                s.spawn(move || {
                    let group = RoleGroup::world(Arc::new(t));
                    PmeSession::new(group, 9, 1, cfg, 0, false, false).map(|_| ())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for r in results {
        assert!(matches!(r, Err(PmeError::Decomposition(_))));
    }
}

#[test]
fn calc_energy_needs_a_single_role() {
    let cell = SimBox::orthorhombic(20., 20., 20.).unwrap();
    let (posits, q) = random_system(&cell, 20, 25);
    let cfg = PmeConfig::default();

    let results: Vec<Result<f64, PmeError>> = thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::create(2)
            .into_iter()
            .enumerate()
            .map(|(r, t)| {
                let cfg = &cfg;
                let p: Vec<Vec3> = posits.iter().skip(r).step_by(2).copied().collect();
                let qr: Vec<f64> = q.iter().skip(r).step_by(2).copied().collect();
                s.spawn(move || {
                    let group = RoleGroup::world(Arc::new(t));
                    let mut session = PmeSession::new(group, 2, 1, cfg, p.len(), false, false)?;
                    session.compute(&StepInput {
                        flags: PmeFlags::SPREAD_Q | PmeFlags::SOLVE,
                        ..StepInput::new(&p, &qr, cell, BETA)
                    })?;
                    // About half of these lie outside this role's slab.
                    session.calc_energy(&p, &qr)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for r in results {
        assert!(matches!(r, Err(PmeError::Protocol(_))));
    }
}
