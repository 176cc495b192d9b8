//! Moving atoms to the PME role that owns their grid slab, and their forces back again.
//!
//! An atom belongs to the role owning the column of its lower interpolation index,
//! (floor(u_x), floor(u_y)). Its spline support then lies inside that role's owned cells plus
//! low-side halo.

use bincode::{Decode, Encode};
use lin_alg::f64::Vec3;

use crate::{
    PmeError,
    comm::{RoleGroup, Tag},
    grid::{Decomposition, cyclic_dist},
    sim_box::RecipBox,
    spline::floor_index,
};

/// How far, in slabs, an atom may be from the role that hands it over, along the major (x) and
/// minor (y) split. Distances are cyclic. Callers that know their atoms are local (e.g. a
/// domain-decomposed run where PP and PME slabs line up) use this to limit the exchange to
/// nearby roles. Every role of a PME group must use the same bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct MaxShift {
    pub x: usize,
    pub y: usize,
}

/// Atoms this role spreads and gathers, after redistribution.
#[derive(Clone, Debug, Default)]
pub(crate) struct LocalAtoms {
    pub posits: Vec<Vec3>,
    pub q_a: Vec<f64>,
    pub q_b: Option<Vec<f64>>,
}

/// The routing of one redistribution, kept so forces can be returned along it.
#[derive(Clone, Debug, Default)]
pub(crate) struct RedistPlan {
    /// Group ranks we exchange with, ascending. Includes ourselves.
    peers: Vec<usize>,
    /// Per group rank: indices into the caller's atoms that went there, in send order.
    sent: Vec<Vec<usize>>,
    /// Per group rank: atoms received from it. Local atoms are ordered by source rank.
    recv_counts: Vec<usize>,
    n_input: usize,
}

/// Group ranks within `shift` of `rank`, ascending.
fn peers_within(decomp: &Decomposition, rank: usize, shift: Option<MaxShift>) -> Vec<usize> {
    let Some(shift) = shift else {
        return (0..decomp.size()).collect();
    };

    let (maj, min) = decomp.coords(rank);
    (0..decomp.size())
        .filter(|&r| {
            let (m, n) = decomp.coords(r);
            cyclic_dist(m, maj, decomp.nnodes_major) <= shift.x
                && cyclic_dist(n, min, decomp.nnodes_minor) <= shift.y
        })
        .collect()
}

/// Group rank owning the atom at `posit`.
pub(crate) fn owner_of(decomp: &Decomposition, recip: &RecipBox, posit: Vec3) -> usize {
    let s = recip.fractional(posit);
    let (fx, _) = floor_index(s[0], decomp.dims[0]);
    let (fy, _) = floor_index(s[1], decomp.dims[1]);
    decomp.column_owner(fx, fy)
}

/// Send each atom to the role owning it. Collective over the PME group.
pub(crate) fn redistribute(
    group: &RoleGroup,
    decomp: &Decomposition,
    recip: &RecipBox,
    posits: &[Vec3],
    q_a: &[f64],
    q_b: Option<&[f64]>,
    shift: Option<MaxShift>,
) -> Result<(LocalAtoms, RedistPlan), PmeError> {
    let size = group.size();
    let me = group.rank();

    if size == 1 {
        let plan = RedistPlan {
            peers: vec![0],
            sent: vec![(0..posits.len()).collect()],
            recv_counts: vec![posits.len()],
            n_input: posits.len(),
        };
        let atoms = LocalAtoms {
            posits: posits.to_vec(),
            q_a: q_a.to_vec(),
            q_b: q_b.map(<[f64]>::to_vec),
        };
        return Ok((atoms, plan));
    }

    let peers = peers_within(decomp, me, shift);
    let stride = if q_b.is_some() { 5 } else { 4 };

    let mut sent = vec![Vec::new(); size];
    let mut send = vec![Vec::new(); size];

    for (i, &p) in posits.iter().enumerate() {
        let owner = owner_of(decomp, recip, p);
        if !peers.contains(&owner) {
            return Err(PmeError::Protocol(format!(
                "Atom {i} belongs to PME rank {owner}, beyond the shift bounds of rank {me}"
            )));
        }

        let buf: &mut Vec<f64> = &mut send[owner];
        buf.extend_from_slice(&[p.x, p.y, p.z, q_a[i]]);
        if let Some(qb) = q_b {
            buf.push(qb[i]);
        }
        sent[owner].push(i);
    }

    let recv = group.exchange(Tag::Redistribute, &peers, send)?;

    let mut atoms = LocalAtoms {
        q_b: q_b.map(|_| Vec::new()),
        ..Default::default()
    };
    let mut recv_counts = vec![0; size];

    for &p in &peers {
        let buf = &recv[p];
        if !buf.len().is_multiple_of(stride) {
            return Err(PmeError::Codec(format!(
                "Atom buffer from rank {p} has {} values, not a multiple of {stride}",
                buf.len()
            )));
        }

        for a in buf.chunks_exact(stride) {
            atoms.posits.push(Vec3::new(a[0], a[1], a[2]));
            atoms.q_a.push(a[3]);
            if let Some(qb) = &mut atoms.q_b {
                qb.push(a[4]);
            }
        }
        recv_counts[p] = buf.len() / stride;
    }

    let plan = RedistPlan {
        peers,
        sent,
        recv_counts,
        n_input: posits.len(),
    };

    Ok((atoms, plan))
}

/// Route forces on our local atoms back to the roles that sent them, and return the forces on
/// the atoms we sent, in the caller's original order. Collective over the PME group.
pub(crate) fn return_forces(
    group: &RoleGroup,
    plan: &RedistPlan,
    forces: Vec<Vec3>,
) -> Result<Vec<Vec3>, PmeError> {
    if group.size() == 1 {
        return Ok(forces);
    }

    let expected: usize = plan.recv_counts.iter().sum();
    if forces.len() != expected {
        return Err(PmeError::Protocol(format!(
            "{} forces for {expected} local atoms",
            forces.len()
        )));
    }

    let mut send = vec![Vec::new(); group.size()];
    let mut i = 0;
    for &p in &plan.peers {
        let n = plan.recv_counts[p];
        let buf: &mut Vec<f64> = &mut send[p];
        for f in &forces[i..i + n] {
            buf.extend_from_slice(&[f.x, f.y, f.z]);
        }
        i += n;
    }

    let recv = group.exchange(Tag::RedistributeBack, &plan.peers, send)?;

    let mut result = vec![Vec3::new_zero(); plan.n_input];
    for &p in &plan.peers {
        let buf = &recv[p];
        if buf.len() != 3 * plan.sent[p].len() {
            return Err(PmeError::Codec(format!(
                "Force buffer from rank {p} has {} values; expected {}",
                buf.len(),
                3 * plan.sent[p].len()
            )));
        }

        for (&atom, f) in plan.sent[p].iter().zip(buf.chunks_exact(3)) {
            result[atom] = Vec3::new(f[0], f[1], f[2]);
        }
    }

    Ok(result)
}
