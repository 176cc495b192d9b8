//! Role-to-role communication. The numerical code only sees the `Transport` trait, and the
//! collectives `RoleGroup` builds on top of it; this keeps it testable with the in-process
//! `LocalTransport`, where each role is a thread.
//!
//! Sends are buffered and never block. Receives match on (source, tag), and messages from one
//! source with one tag arrive in the order they were sent.

use std::{
    collections::VecDeque,
    mem,
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::Duration,
};

use crate::{
    PmeError,
    wire::{decode_f64s, encode_f64s},
};

/// A blocked receive gives up after this long, and reports a transport failure. This turns a
/// deadlocked role group into an error instead of a hang.
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(120);

/// Identifies the purpose of a message, so concurrent exchanges between the same pair of roles
/// don't get mixed up. The `u8` fields are a grid index (0 for state A, 1 for state B) and,
/// for transposes, the stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Atom positions and charges, sent to the PME role owning their grid slab.
    Redistribute,
    /// Forces returning along the reverse path.
    RedistributeBack,
    HaloForward(u8),
    HaloBackward(u8),
    Transpose(u8, u8),
    Reduce,
    PpToPme,
    PmeToPp,
    /// Free for callers, e.g. their own energy reductions.
    User(u32),
}

pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    /// Buffered; returns once the message is queued.
    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), PmeError>;

    /// Block until a message from `src` with `tag` arrives.
    fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, PmeError>;

    /// Block until a message with `tag` arrives from any of `srcs`. Returns the source too.
    fn recv_any(&self, srcs: &[usize], tag: Tag) -> Result<(usize, Vec<u8>), PmeError>;
}

struct Envelope {
    src: usize,
    tag: Tag,
    payload: Vec<u8>,
}

struct Inbox {
    rx: Receiver<Envelope>,
    /// Arrived, but not yet asked for.
    pending: VecDeque<Envelope>,
}

/// In-process transport over `mpsc` channels. One endpoint per role; create them as a set.
pub struct LocalTransport {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Mutex<Inbox>,
    timeout: Duration,
}

impl LocalTransport {
    /// A fully-connected set of `n` endpoints. Endpoint i has rank i.
    pub fn create(n: usize) -> Vec<Self> {
        Self::create_with_timeout(n, DEFAULT_RECV_TIMEOUT)
    }

    pub fn create_with_timeout(n: usize, timeout: Duration) -> Vec<Self> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..n).map(|_| mpsc::channel()).unzip();

        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| Self {
                rank,
                peers: txs.clone(),
                inbox: Mutex::new(Inbox {
                    rx,
                    pending: VecDeque::new(),
                }),
                timeout,
            })
            .collect()
    }

    fn recv_matching(&self, accept: impl Fn(&Envelope) -> bool) -> Result<Envelope, PmeError> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| PmeError::Transport("Inbox lock poisoned".to_owned()))?;

        if let Some(i) = inbox.pending.iter().position(&accept)
            && let Some(env) = inbox.pending.remove(i)
        {
            return Ok(env);
        }

        loop {
            let env = match inbox.rx.recv_timeout(self.timeout) {
                Ok(e) => e,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(PmeError::Transport(format!(
                        "Role {} timed out waiting for a message",
                        self.rank
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PmeError::Transport(format!(
                        "All senders to role {} hung up",
                        self.rank
                    )));
                }
            };

            if accept(&env) {
                return Ok(env);
            }
            inbox.pending.push_back(env);
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), PmeError> {
        let Some(tx) = self.peers.get(dest) else {
            return Err(PmeError::Transport(format!(
                "No role {dest}; there are {}",
                self.peers.len()
            )));
        };

        tx.send(Envelope {
            src: self.rank,
            tag,
            payload,
        })
        .map_err(|_| PmeError::Transport(format!("Role {dest} hung up")))
    }

    fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, PmeError> {
        self.recv_matching(|e| e.src == src && e.tag == tag)
            .map(|e| e.payload)
    }

    fn recv_any(&self, srcs: &[usize], tag: Tag) -> Result<(usize, Vec<u8>), PmeError> {
        self.recv_matching(|e| e.tag == tag && srcs.contains(&e.src))
            .map(|e| (e.src, e.payload))
    }
}

/// An ordered subset of the world's roles, addressed by group rank 0..size. Collectives are
/// built from point-to-point messages, and reduce in group-rank order so their results don't
/// depend on message timing.
#[derive(Clone)]
pub struct RoleGroup {
    transport: Arc<dyn Transport>,
    /// World ranks, indexed by group rank.
    members: Vec<usize>,
    rank: usize,
}

impl RoleGroup {
    /// `members` are world ranks, and must include this role.
    pub fn new(transport: Arc<dyn Transport>, members: Vec<usize>) -> Result<Self, PmeError> {
        let me = transport.rank();
        let Some(rank) = members.iter().position(|&m| m == me) else {
            return Err(PmeError::Config(format!(
                "Role {me} isn't a member of the group {members:?}"
            )));
        };

        if let Some(&m) = members.iter().find(|&&m| m >= transport.num_ranks()) {
            return Err(PmeError::Config(format!(
                "Group member {m} is out of range for {} roles",
                transport.num_ranks()
            )));
        }

        Ok(Self {
            transport,
            members,
            rank,
        })
    }

    /// Every role the transport knows about.
    pub fn world(transport: Arc<dyn Transport>) -> Self {
        let members = (0..transport.num_ranks()).collect();
        let rank = transport.rank();
        Self {
            transport,
            members,
            rank,
        }
    }

    /// A group of the same transport. `ranks` are ranks in *this* group.
    pub fn subgroup(&self, ranks: &[usize]) -> Result<Self, PmeError> {
        let mut members = Vec::with_capacity(ranks.len());
        for &r in ranks {
            match self.members.get(r) {
                Some(&m) => members.push(m),
                None => {
                    return Err(PmeError::Config(format!(
                        "Subgroup rank {r} is out of range for a group of {}",
                        self.size()
                    )));
                }
            }
        }
        Self::new(self.transport.clone(), members)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn world_rank(&self, group_rank: usize) -> usize {
        self.members[group_rank]
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), PmeError> {
        self.transport.send(self.members[dest], tag, payload)
    }

    pub fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, PmeError> {
        self.transport.recv(self.members[src], tag)
    }

    /// Receive from whichever of `srcs` (group ranks) is first. Returns the group rank.
    pub fn recv_any(&self, srcs: &[usize], tag: Tag) -> Result<(usize, Vec<u8>), PmeError> {
        let world: Vec<usize> = srcs.iter().map(|&s| self.members[s]).collect();
        let (src_world, payload) = self.transport.recv_any(&world, tag)?;

        let src = srcs
            .iter()
            .copied()
            .find(|&s| self.members[s] == src_world)
            .ok_or_else(|| {
                PmeError::Transport(format!("Message from unexpected role {src_world}"))
            })?;
        Ok((src, payload))
    }

    /// Send `send[p]` to each `p` in `peers`, and receive from each of them. The peer set must be
    /// symmetric. The result is indexed by group rank; entries for non-peers are empty. Our own
    /// entry, if present, is moved, not sent.
    pub fn exchange(
        &self,
        tag: Tag,
        peers: &[usize],
        mut send: Vec<Vec<f64>>,
    ) -> Result<Vec<Vec<f64>>, PmeError> {
        if send.len() != self.size() {
            return Err(PmeError::Protocol(format!(
                "Exchange needs {} send buffers; got {}",
                self.size(),
                send.len()
            )));
        }

        let mut recv = vec![Vec::new(); self.size()];

        for &p in peers {
            if p == self.rank {
                recv[p] = mem::take(&mut send[p]);
            } else {
                self.send(p, tag, encode_f64s(&send[p])?)?;
            }
        }

        for &p in peers {
            if p != self.rank {
                recv[p] = decode_f64s(&self.recv(p, tag)?)?;
            }
        }

        Ok(recv)
    }

    /// `exchange` with every member of the group.
    pub fn all_to_allv(&self, tag: Tag, send: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, PmeError> {
        let all: Vec<usize> = (0..self.size()).collect();
        self.exchange(tag, &all, send)
    }

    /// Element-wise sum across the group, in place. Rank 0 adds contributions in rank order,
    /// then sends the result to everyone, so all roles get bit-identical values.
    pub fn sum(&self, tag: Tag, values: &mut [f64]) -> Result<(), PmeError> {
        if self.size() == 1 {
            return Ok(());
        }

        if self.rank == 0 {
            for src in 1..self.size() {
                let part = decode_f64s(&self.recv(src, tag)?)?;
                if part.len() != values.len() {
                    return Err(PmeError::Transport(format!(
                        "Sum length mismatch from rank {src}: {} vs {}",
                        part.len(),
                        values.len()
                    )));
                }
                for (v, p) in values.iter_mut().zip(part) {
                    *v += p;
                }
            }

            let bytes = encode_f64s(values)?;
            for dest in 1..self.size() {
                self.send(dest, tag, bytes.clone())?;
            }
        } else {
            self.send(0, tag, encode_f64s(values)?)?;

            let total = decode_f64s(&self.recv(0, tag)?)?;
            if total.len() != values.len() {
                return Err(PmeError::Transport("Sum result length mismatch".to_owned()));
            }
            values.copy_from_slice(&total);
        }

        Ok(())
    }

    pub fn barrier(&self, tag: Tag) -> Result<(), PmeError> {
        self.sum(tag, &mut [])
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn groups(n: usize) -> Vec<RoleGroup> {
        LocalTransport::create(n)
            .into_iter()
            .map(|t| RoleGroup::world(Arc::new(t)))
            .collect()
    }

    #[test]
    fn out_of_order_tags_are_held() {
        let mut ts = LocalTransport::create(2);
        let b = ts.pop().unwrap();
        let a = ts.pop().unwrap();

        a.send(1, Tag::User(1), vec![1]).unwrap();
        a.send(1, Tag::User(2), vec![2]).unwrap();
        a.send(1, Tag::User(1), vec![3]).unwrap();

        assert_eq!(b.recv(0, Tag::User(2)).unwrap(), vec![2]);
        assert_eq!(b.recv(0, Tag::User(1)).unwrap(), vec![1]);
        assert_eq!(b.recv_any(&[0], Tag::User(1)).unwrap(), (0, vec![3]));
    }

    #[test]
    fn send_to_missing_role_fails() {
        let ts = LocalTransport::create(1);
        assert!(matches!(
            ts[0].send(3, Tag::Reduce, vec![]),
            Err(PmeError::Transport(_))
        ));
    }

    #[test]
    fn recv_times_out() {
        let ts = LocalTransport::create_with_timeout(2, Duration::from_millis(20));
        assert!(matches!(
            ts[0].recv(1, Tag::Reduce),
            Err(PmeError::Transport(_))
        ));
    }

    #[test]
    fn sum_and_all_to_allv() {
        let n = 4;

        thread::scope(|s| {
            for g in groups(n) {
                s.spawn(move || {
                    let r = g.rank() as f64;
                    let mut v = [r, 2. * r, 1.];
                    g.sum(Tag::Reduce, &mut v).unwrap();
                    assert_eq!(v, [6., 12., 4.]);

                    // Send `dest` copies of our rank to each dest.
                    let send = (0..n).map(|dest| vec![r; dest]).collect();
                    let recv = g.all_to_allv(Tag::User(0), send).unwrap();
                    for (src, buf) in recv.iter().enumerate() {
                        assert_eq!(buf, &vec![src as f64; g.rank()]);
                    }

                    g.barrier(Tag::Reduce).unwrap();
                });
            }
        });
    }

    #[test]
    fn subgroup_maps_ranks() {
        let gs = groups(4);
        let sub = gs[3].subgroup(&[1, 3]).unwrap();
        assert_eq!(sub.rank(), 1);
        assert_eq!(sub.size(), 2);
        assert_eq!(sub.world_rank(0), 1);

        assert!(gs[0].subgroup(&[1, 3]).is_err());
    }
}
