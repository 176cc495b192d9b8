//! Messaging between particle (PP) roles and electrostatics-only (PME) roles.
//!
//! Each PP role is served by one PME role. A PP role sends its charges once (and again only if
//! they change), then each step sends coordinates and blocks until forces come back. Strictly
//! one outstanding request at a time. The PME role collects coordinates from every PP role it
//! serves, computes, and replies. The last PP role of each served set is that PME role's *peer*:
//! only it receives energy, virial, dvdλ, timing, and signal flags, so summing those over the PP
//! roles counts each PME role once.

use std::{ops::Range, sync::Arc};

use bincode::{Decode, Encode};
use lin_alg::f64::Vec3;
use log::debug;

use crate::{
    PmeError,
    comm::{Tag, Transport},
    redist::MaxShift,
    sim_box::{Matrix3, SimBox},
    wire::{decode, encode},
};

/// World ranks of the PP roles and of the PME roles.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleLayout {
    pub pp_ranks: Vec<usize>,
    pub pme_ranks: Vec<usize>,
}

impl RoleLayout {
    pub fn new(pp_ranks: Vec<usize>, pme_ranks: Vec<usize>) -> Result<Self, PmeError> {
        if pp_ranks.is_empty() || pme_ranks.is_empty() {
            return Err(PmeError::config(
                "A split run needs at least one PP role and one PME role.",
            ));
        }
        if pme_ranks.len() > pp_ranks.len() {
            return Err(PmeError::Config(format!(
                "{} PME roles for {} PP roles; some PME roles would serve no one",
                pme_ranks.len(),
                pp_ranks.len()
            )));
        }
        if let Some(r) = pp_ranks.iter().find(|r| pme_ranks.contains(r)) {
            return Err(PmeError::Config(format!(
                "Role {r} is listed as both PP and PME"
            )));
        }

        Ok(Self {
            pp_ranks,
            pme_ranks,
        })
    }

    /// The first `n_pp` world ranks are PP roles; the next `n_pme` are PME roles.
    pub fn contiguous(n_pp: usize, n_pme: usize) -> Result<Self, PmeError> {
        Self::new((0..n_pp).collect(), (n_pp..n_pp + n_pme).collect())
    }

    /// Index (into `pme_ranks`) of the PME role serving PP role `pp_index`.
    pub fn pme_for_pp(&self, pp_index: usize) -> usize {
        pp_index * self.pme_ranks.len() / self.pp_ranks.len()
    }

    /// PP indices served by PME role `pme_index`.
    pub fn pp_for_pme(&self, pme_index: usize) -> Range<usize> {
        let served: Vec<usize> = (0..self.pp_ranks.len())
            .filter(|&i| self.pme_for_pp(i) == pme_index)
            .collect();

        match (served.first(), served.last()) {
            (Some(&a), Some(&b)) => a..b + 1,
            _ => 0..0,
        }
    }

    /// PP index of the peer of PME role `pme_index`: the last PP role it serves.
    pub fn peer_of(&self, pme_index: usize) -> Option<usize> {
        self.pp_for_pme(pme_index).last()
    }
}

#[derive(Clone, Debug, Encode, Decode)]
enum PpToPme {
    Charges {
        q_a: Vec<f64>,
        q_b: Option<Vec<f64>>,
        shift_bounds: Option<MaxShift>,
    },
    Coords {
        step: u64,
        posits: Vec<[f64; 3]>,
        cell: [[f64; 3]; 3],
        ewald_coeff: f64,
        lambda: f64,
    },
    Finish,
}

#[derive(Clone, Debug, Encode, Decode)]
struct EnergyTerms {
    energy: f64,
    virial: [[f64; 3]; 3],
    dvdl: f64,
    cycles: u64,
    signal_term: bool,
    signal_usr1: bool,
}

#[derive(Clone, Debug, Encode, Decode)]
struct ForceMsg {
    step: u64,
    forces: Vec<[f64; 3]>,
    /// Only for the peer.
    terms: Option<EnergyTerms>,
}

fn to_arrays(v: &[Vec3]) -> Vec<[f64; 3]> {
    v.iter().map(|p| [p.x, p.y, p.z]).collect()
}

fn to_vecs(v: &[[f64; 3]]) -> Vec<Vec3> {
    v.iter().map(|p| Vec3::new(p[0], p[1], p[2])).collect()
}

/// What a PP role gets back each step. Non-peer roles get zeroed energy terms and flags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PmeReply {
    pub step: u64,
    pub forces: Vec<Vec3>,
    pub energy: f64,
    pub virial: Matrix3,
    pub dvdl: f64,
    /// Time the PME role spent on the step, in μs.
    pub cycles: u64,
    /// The PME process received a termination signal.
    pub signal_term: bool,
    /// The PME process received a user signal; e.g. write a checkpoint.
    pub signal_usr1: bool,
}

/// The PP side of the link to this role's PME role.
pub struct PpPmeLink {
    transport: Arc<dyn Transport>,
    pme_rank: usize,
    is_peer: bool,
    /// Atom count of the last charges sent.
    n_charges: Option<usize>,
    /// Step of the request awaiting its forces.
    pending: Option<u64>,
}

impl PpPmeLink {
    pub fn new(transport: Arc<dyn Transport>, layout: &RoleLayout) -> Result<Self, PmeError> {
        let me = transport.rank();
        let Some(pp_index) = layout.pp_ranks.iter().position(|&r| r == me) else {
            return Err(PmeError::Config(format!("Role {me} isn't a PP role")));
        };

        let pme_index = layout.pme_for_pp(pp_index);

        Ok(Self {
            transport,
            pme_rank: layout.pme_ranks[pme_index],
            is_peer: layout.peer_of(pme_index) == Some(pp_index),
            n_charges: None,
            pending: None,
        })
    }

    /// Whether this role receives the energy terms of its PME role.
    pub fn is_peer(&self) -> bool {
        self.is_peer
    }

    pub fn pme_rank(&self) -> usize {
        self.pme_rank
    }

    /// Send charges for our atoms. Only needed again when they change. `shift_bounds` limits how
    /// far our atoms can be from our PME role's slab (see `MaxShift`); every PP role of the run
    /// must send the same bounds.
    pub fn send_q(
        &mut self,
        q_a: &[f64],
        q_b: Option<&[f64]>,
        shift_bounds: Option<MaxShift>,
    ) -> Result<(), PmeError> {
        if self.pending.is_some() {
            return Err(PmeError::protocol("send_q while forces are outstanding"));
        }
        if let Some(b) = q_b
            && b.len() != q_a.len()
        {
            return Err(PmeError::Protocol(format!(
                "{} state-A charges but {} state-B charges",
                q_a.len(),
                b.len()
            )));
        }

        let msg = PpToPme::Charges {
            q_a: q_a.to_vec(),
            q_b: q_b.map(<[f64]>::to_vec),
            shift_bounds,
        };
        self.transport.send(self.pme_rank, Tag::PpToPme, encode(&msg)?)?;
        self.n_charges = Some(q_a.len());
        Ok(())
    }

    /// Send this step's coordinates, which requests a computation. Positions must be in the
    /// primary unit cell.
    pub fn send_x(
        &mut self,
        step: u64,
        posits: &[Vec3],
        cell: &SimBox,
        ewald_coeff: f64,
        lambda: f64,
    ) -> Result<(), PmeError> {
        if let Some(s) = self.pending {
            return Err(PmeError::Protocol(format!(
                "send_x for step {step} while step {s} is outstanding"
            )));
        }
        match self.n_charges {
            None => return Err(PmeError::protocol("send_x before send_q")),
            Some(n) if n != posits.len() => {
                return Err(PmeError::Protocol(format!(
                    "{} coordinates for {n} charges",
                    posits.len()
                )));
            }
            _ => (),
        }

        let msg = PpToPme::Coords {
            step,
            posits: to_arrays(posits),
            cell: cell.m,
            ewald_coeff,
            lambda,
        };
        self.transport.send(self.pme_rank, Tag::PpToPme, encode(&msg)?)?;
        self.pending = Some(step);
        Ok(())
    }

    /// Block until the forces for the outstanding request arrive.
    pub fn receive_f(&mut self) -> Result<PmeReply, PmeError> {
        let Some(step) = self.pending else {
            return Err(PmeError::protocol("receive_f without a pending request"));
        };

        let msg: ForceMsg = decode(&self.transport.recv(self.pme_rank, Tag::PmeToPp)?)?;
        self.pending = None;

        if msg.step != step {
            return Err(PmeError::Protocol(format!(
                "Forces for step {} arrived for request {step}",
                msg.step
            )));
        }
        if msg.terms.is_some() != self.is_peer {
            return Err(PmeError::protocol(
                "Energy terms sent to a non-peer, or missing for the peer",
            ));
        }

        let mut reply = PmeReply {
            step,
            forces: to_vecs(&msg.forces),
            ..Default::default()
        };
        if let Some(t) = msg.terms {
            reply.energy = t.energy;
            reply.virial = t.virial;
            reply.dvdl = t.dvdl;
            reply.cycles = t.cycles;
            reply.signal_term = t.signal_term;
            reply.signal_usr1 = t.signal_usr1;
        }

        Ok(reply)
    }

    /// Tell our PME role the run is over. No more requests may follow.
    pub fn finish(&mut self) -> Result<(), PmeError> {
        if self.pending.is_some() {
            return Err(PmeError::protocol("finish while forces are outstanding"));
        }
        self.transport
            .send(self.pme_rank, Tag::PpToPme, encode(&PpToPme::Finish)?)
    }
}

/// Where a PME role is in its request cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmeRoleState {
    AwaitingRequest,
    Computing,
    Responding,
    Shutdown,
}

/// One step's work, gathered from every PP role a PME role serves, concatenated in PP order.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRequest {
    pub step: u64,
    pub posits: Vec<Vec3>,
    pub q_a: Vec<f64>,
    pub q_b: Option<Vec<f64>>,
    pub cell: SimBox,
    pub ewald_coeff: f64,
    pub lambda: f64,
    /// Sent with the charges; the same for every PP role served.
    pub shift_bounds: Option<MaxShift>,
}

impl StepRequest {
    pub fn natoms(&self) -> usize {
        self.posits.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PmeRequest {
    Compute(StepRequest),
    /// The PP roles called `finish`.
    Finished,
}

/// Charges last sent by one PP role.
#[derive(Clone, Debug, Default)]
struct PpCharges {
    q_a: Vec<f64>,
    q_b: Option<Vec<f64>>,
    shift_bounds: Option<MaxShift>,
}

/// The PME side of the links to the PP roles this role serves.
pub struct PmePpComm {
    transport: Arc<dyn Transport>,
    /// World ranks of the PP roles we serve, in order; the last is our peer.
    served: Vec<usize>,
    charges: Vec<Option<PpCharges>>,
    /// Atoms per served PP role in the current request, for splitting forces.
    counts: Vec<usize>,
    step: u64,
    state: PmeRoleState,
}

impl PmePpComm {
    pub fn new(transport: Arc<dyn Transport>, layout: &RoleLayout) -> Result<Self, PmeError> {
        let me = transport.rank();
        let Some(pme_index) = layout.pme_ranks.iter().position(|&r| r == me) else {
            return Err(PmeError::Config(format!("Role {me} isn't a PME role")));
        };

        let served: Vec<usize> = layout
            .pp_for_pme(pme_index)
            .map(|i| layout.pp_ranks[i])
            .collect();

        debug!("PME role {me} serves PP roles {served:?}");

        Ok(Self {
            transport,
            charges: vec![None; served.len()],
            counts: vec![0; served.len()],
            served,
            step: 0,
            state: PmeRoleState::AwaitingRequest,
        })
    }

    pub fn state(&self) -> PmeRoleState {
        self.state
    }

    /// World ranks of the PP roles we serve. The last is our peer.
    pub fn served(&self) -> &[usize] {
        &self.served
    }

    /// Block until every served PP role has sent coordinates (taking any new charges on the
    /// way), or until they've all called `finish`.
    pub fn recv_q_x(&mut self) -> Result<PmeRequest, PmeError> {
        if self.state != PmeRoleState::AwaitingRequest {
            return Err(PmeError::Protocol(format!(
                "recv_q_x in state {:?}",
                self.state
            )));
        }

        let mut step = None;
        let mut n_finished = 0;
        let mut posits = Vec::new();
        let mut q_a = Vec::new();
        let mut q_b: Option<Vec<f64>> = None;
        let mut free_energy: Option<bool> = None;
        let mut shift_bounds: Option<Option<MaxShift>> = None;
        let mut cell = None;
        let mut ewald_coeff = 0.;
        let mut lambda = 0.;

        for i in 0..self.served.len() {
            let src = self.served[i];

            // Charges may come first; coordinates or finish end this role's part.
            loop {
                let msg: PpToPme = decode(&self.transport.recv(src, Tag::PpToPme)?)?;

                match msg {
                    PpToPme::Charges {
                        q_a,
                        q_b,
                        shift_bounds,
                    } => {
                        self.charges[i] = Some(PpCharges {
                            q_a,
                            q_b,
                            shift_bounds,
                        });
                    }
                    PpToPme::Finish => {
                        n_finished += 1;
                        break;
                    }
                    PpToPme::Coords {
                        step: s,
                        posits: p,
                        cell: c,
                        ewald_coeff: ec,
                        lambda: l,
                    } => {
                        let Some(ch) = &self.charges[i] else {
                            return Err(PmeError::Protocol(format!(
                                "Coordinates from PP role {src} before any charges"
                            )));
                        };
                        if ch.q_a.len() != p.len() {
                            return Err(PmeError::Protocol(format!(
                                "PP role {src} sent {} coordinates for {} charges",
                                p.len(),
                                ch.q_a.len()
                            )));
                        }
                        if step.is_some_and(|st| st != s) {
                            return Err(PmeError::Protocol(format!(
                                "PP roles disagree on the step: {s} from role {src}"
                            )));
                        }
                        let has_b = ch.q_b.is_some();
                        if *free_energy.get_or_insert(has_b) != has_b {
                            return Err(PmeError::protocol(
                                "Only some PP roles sent state-B charges",
                            ));
                        }
                        if *shift_bounds.get_or_insert(ch.shift_bounds) != ch.shift_bounds {
                            return Err(PmeError::Protocol(format!(
                                "PP role {src} sent shift bounds {:?}, unlike the roles before it",
                                ch.shift_bounds
                            )));
                        }

                        step = Some(s);
                        cell = Some(SimBox::new(c)?);
                        ewald_coeff = ec;
                        lambda = l;

                        posits.extend(to_vecs(&p));
                        q_a.extend_from_slice(&ch.q_a);
                        if let Some(b) = &ch.q_b {
                            q_b.get_or_insert_with(Vec::new).extend_from_slice(b);
                        }
                        self.counts[i] = p.len();
                        break;
                    }
                }
            }
        }

        if n_finished == self.served.len() {
            self.state = PmeRoleState::Shutdown;
            return Ok(PmeRequest::Finished);
        }
        if n_finished > 0 {
            return Err(PmeError::protocol(
                "Some PP roles finished while others requested a step",
            ));
        }

        let (Some(step), Some(cell)) = (step, cell) else {
            return Err(PmeError::protocol("No coordinates received"));
        };

        self.step = step;
        self.state = PmeRoleState::Computing;

        Ok(PmeRequest::Compute(StepRequest {
            step,
            posits,
            q_a,
            q_b,
            cell,
            ewald_coeff,
            lambda,
            shift_bounds: shift_bounds.flatten(),
        }))
    }

    /// Return forces (in the order of the request) to the PP roles, and the energy terms to our
    /// peer.
    pub fn send_force_vir_ener(
        &mut self,
        forces: &[Vec3],
        energy: f64,
        virial: &Matrix3,
        dvdl: f64,
        cycles: u64,
        signal_term: bool,
        signal_usr1: bool,
    ) -> Result<(), PmeError> {
        if self.state != PmeRoleState::Computing {
            return Err(PmeError::Protocol(format!(
                "send_force_vir_ener in state {:?}",
                self.state
            )));
        }

        let expected: usize = self.counts.iter().sum();
        if forces.len() != expected {
            return Err(PmeError::Protocol(format!(
                "{} forces for a request of {expected} atoms",
                forces.len()
            )));
        }

        self.state = PmeRoleState::Responding;

        let n_served = self.served.len();
        let mut start = 0;
        for (i, (&dest, &n)) in self.served.iter().zip(&self.counts).enumerate() {
            let terms = (i + 1 == n_served).then(|| EnergyTerms {
                energy,
                virial: *virial,
                dvdl,
                cycles,
                signal_term,
                signal_usr1,
            });

            let msg = ForceMsg {
                step: self.step,
                forces: to_arrays(&forces[start..start + n]),
                terms,
            };
            self.transport.send(dest, Tag::PmeToPp, encode(&msg)?)?;
            start += n;
        }

        self.state = PmeRoleState::AwaitingRequest;
        Ok(())
    }
}
