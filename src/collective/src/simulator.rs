//! An in-process transport and the event loop that drives collectives over it.
//!
//! Every global rank gets an [`Endpoint`]. Actors post sends and receives on their endpoint; the
//! [`Simulator`] turns posted operations into timed events, matches messages MPI style (posted
//! receives against unexpected messages, keyed by source, destination and tag) and feeds the
//! resulting completions back to the actor that owns them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use fnv::FnvBuildHasher;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::actor::{CollectiveActor, CollectiveDone, Progress};
use crate::bandwidth::{Bandwidth, BandwidthTrait};
use crate::transport::{Completion, Transport, TransportError, Workspace, WorkspaceId};
use crate::{Duration, Error, MessageTag, Rank, Result, Timestamp, ToStdDuration};

type HashMap<K, V> = IndexMap<K, V, FnvBuildHasher>;

/// Fill pattern of fresh and freed workspace memory.
pub const POISON: u8 = 0xa5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorSetting {
    /// one-way network latency
    pub latency_ns: Duration,
    pub bandwidth: Bandwidth,
    /// messages up to this many bytes are sent without waiting for the receiver
    pub eager_threshold: usize,
    /// upper bound of a random delay added to every event
    pub jitter_ns: Duration,
    pub seed: u64,
    /// the n-th send (counting from 1) fails
    pub fail_after: Option<usize>,
    /// bytes of workspace each endpoint may hand out at once
    pub workspace_limit: Option<usize>,
}

impl Default for SimulatorSetting {
    fn default() -> Self {
        SimulatorSetting {
            latency_ns: 1_000,
            bandwidth: 100.gbps(),
            eager_threshold: 16 * 1024,
            jitter_ns: 0,
            seed: 0,
            fail_after: None,
            workspace_limit: None,
        }
    }
}

/// An operation posted on an endpoint and not yet picked up by the event loop.
#[derive(Debug, Clone)]
pub enum Op {
    Send {
        dst: Rank,
        tag: MessageTag,
        payload: Vec<u8>,
    },
    Recv {
        src: Rank,
        tag: MessageTag,
        nbytes: usize,
    },
}

#[derive(Debug)]
pub struct Endpoint {
    rank: Rank,
    nproc: usize,
    ops: Vec<Op>,
    next_workspace: usize,
    live: HashMap<WorkspaceId, usize>,
    free_list: Vec<Vec<u8>>,
    workspace_limit: Option<usize>,
    num_allocs: usize,
    num_frees: usize,
    invalid_frees: usize,
    copied_bytes: usize,
}

impl Endpoint {
    pub fn new(rank: Rank, nproc: usize) -> Self {
        Endpoint {
            rank,
            nproc,
            ops: Vec::new(),
            next_workspace: 0,
            live: HashMap::default(),
            free_list: Vec::new(),
            workspace_limit: None,
            num_allocs: 0,
            num_frees: 0,
            invalid_frees: 0,
            copied_bytes: 0,
        }
    }

    pub fn with_workspace_limit(mut self, limit: Option<usize>) -> Self {
        self.workspace_limit = limit;
        self
    }

    pub fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }

    /// `(allocations, frees)` of workspace memory so far.
    #[inline]
    pub fn workspace_stats(&self) -> (usize, usize) {
        (self.num_allocs, self.num_frees)
    }

    #[inline]
    pub fn live_workspaces(&self) -> usize {
        self.live.len()
    }

    /// Frees of a workspace this endpoint never handed out or already took back.
    #[inline]
    pub fn invalid_frees(&self) -> usize {
        self.invalid_frees
    }

    #[inline]
    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    fn live_bytes(&self) -> usize {
        self.live.values().sum()
    }
}

impl Transport for Endpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn nproc(&self) -> usize {
        self.nproc
    }

    fn send(&mut self, dst: Rank, tag: MessageTag, payload: Vec<u8>) -> std::result::Result<(), TransportError> {
        if dst >= self.nproc {
            return Err(TransportError::NoSuchPeer(dst));
        }
        self.ops.push(Op::Send { dst, tag, payload });
        Ok(())
    }

    fn recv(&mut self, src: Rank, tag: MessageTag, nbytes: usize) -> std::result::Result<(), TransportError> {
        if src >= self.nproc {
            return Err(TransportError::NoSuchPeer(src));
        }
        self.ops.push(Op::Recv { src, tag, nbytes });
        Ok(())
    }

    fn allocate_workspace(&mut self, nbytes: usize) -> std::result::Result<Workspace, TransportError> {
        if let Some(limit) = self.workspace_limit {
            if self.live_bytes() + nbytes > limit {
                return Err(TransportError::OutOfWorkspace(nbytes));
            }
        }
        let mut data = self.free_list.pop().unwrap_or_default();
        data.clear();
        data.resize(nbytes, POISON);

        let id = WorkspaceId(self.next_workspace);
        self.next_workspace += 1;
        self.live.insert(id, nbytes);
        self.num_allocs += 1;
        trace!("endpoint {} allocated {:?} of {} bytes", self.rank, id, nbytes);
        Ok(Workspace::from_vec(id, data))
    }

    fn free_workspace(&mut self, ws: Workspace) {
        let (id, mut data) = ws.into_inner();
        if self.live.swap_remove(&id).is_none() {
            warn!("endpoint {} asked to free unknown {:?}", self.rank, id);
            self.invalid_frees += 1;
            return;
        }
        self.num_frees += 1;
        for b in data.iter_mut() {
            *b = POISON;
        }
        self.free_list.push(data);
    }

    fn memcopy(&mut self, dst: &mut [u8], src: &[u8]) {
        self.copied_bytes += src.len();
        dst.copy_from_slice(src);
    }
}

#[derive(Debug)]
enum Event {
    /// An eager message reaches its receiver.
    Arrive {
        src: Rank,
        dst: Rank,
        tag: MessageTag,
        payload: Vec<u8>,
    },
    /// The request-to-send of a rendezvous message reaches its receiver.
    RequestToSend {
        src: Rank,
        dst: Rank,
        tag: MessageTag,
        payload: Vec<u8>,
    },
    /// A completion for the actor on `rank` that owns the operation.
    Complete { rank: Rank, completion: Completion },
}

#[derive(Debug)]
struct Scheduled {
    ts: Timestamp,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.ts, self.seq) == (other.ts, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ts, self.seq).cmp(&(other.ts, other.seq))
    }
}

#[derive(Debug)]
enum Unexpected {
    Eager(Vec<u8>),
    Rendezvous(Vec<u8>),
}

/// (src, dst, tag)
type MatchKey = (Rank, Rank, MessageTag);

pub struct Simulator {
    setting: SimulatorSetting,
    endpoints: Vec<Endpoint>,
    ts: Timestamp,
    seq: u64,
    events: BinaryHeap<Reverse<Scheduled>>,
    posted: HashMap<MatchKey, usize>,
    unexpected: HashMap<MatchKey, Unexpected>,
    rng: StdRng,
    num_sends: usize,
}

impl Simulator {
    #[inline]
    pub fn nproc(&self) -> usize {
        self.endpoints.len()
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        self.ts
    }

    #[inline]
    pub fn setting(&self) -> &SimulatorSetting {
        &self.setting
    }

    pub fn endpoint(&self, rank: Rank) -> Option<&Endpoint> {
        self.endpoints.get(rank)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Drive `actors` until every one of them finishes. At most one actor per (rank, tag).
    ///
    /// On the first error every unfinished actor is aborted, so all scratch memory is back with
    /// the endpoints when this returns.
    pub fn run(&mut self, mut actors: Vec<CollectiveActor<'_>>) -> Result<Vec<CollectiveDone>> {
        let start = std::time::Instant::now();
        let mut done = Vec::with_capacity(actors.len());
        let res = self.drive(&mut actors, &mut done);

        if let Err(e) = res {
            for a in actors.iter_mut().filter(|a| !a.is_finished()) {
                let rank = a.global_rank();
                if let Some(ep) = self.endpoints.get_mut(rank) {
                    a.abort(ep);
                }
            }
            self.events.clear();
            self.posted.clear();
            self.unexpected.clear();
            return Err(e);
        }

        debug!(
            "sim_time: {:?}, wall time: {:?}, {} collectives",
            self.ts.to_dura(),
            start.elapsed(),
            done.len()
        );
        Ok(done)
    }

    fn drive(
        &mut self,
        actors: &mut [CollectiveActor<'_>],
        done: &mut Vec<CollectiveDone>,
    ) -> Result<()> {
        let mut route: HashMap<(Rank, u32), usize> = HashMap::default();
        for (i, a) in actors.iter().enumerate() {
            let rank = a.global_rank();
            if rank >= self.endpoints.len() {
                return Err(Error::UnknownPartner {
                    rank,
                    nproc: self.endpoints.len(),
                });
            }
            if route.insert((rank, a.tag()), i).is_some() {
                return Err(Error::InvalidTopology(format!(
                    "two collectives with tag {} on rank {}",
                    a.tag(),
                    rank
                )));
            }
        }

        for a in actors.iter_mut() {
            let rank = a.global_rank();
            if a.start(&mut self.endpoints[rank])? == Progress::Finished {
                done.push(a.summary(self.ts));
            }
            self.flush(rank)?;
        }

        while let Some(Reverse(Scheduled { ts, event, .. })) = self.events.pop() {
            self.ts = ts;
            trace!("simulator: ts {:?} on event {:?}", ts.to_dura(), event);
            match event {
                Event::Arrive {
                    src,
                    dst,
                    tag,
                    payload,
                } => self.arrive((src, dst, tag), payload)?,
                Event::RequestToSend {
                    src,
                    dst,
                    tag,
                    payload,
                } => self.request_to_send((src, dst, tag), payload)?,
                Event::Complete { rank, completion } => {
                    let i = match route.get(&(rank, completion.tag().tag)) {
                        Some(&i) => i,
                        None => {
                            return Err(Error::UnexpectedCompletion {
                                peer: rank,
                                what: format!("no collective owns {:?}", completion),
                            })
                        }
                    };
                    let a = &mut actors[i];
                    if a.on_completion(&mut self.endpoints[rank], completion)? == Progress::Finished {
                        done.push(a.summary(self.ts));
                    }
                    self.flush(rank)?;
                }
            }
        }

        let stuck = actors.iter().filter(|a| !a.is_finished()).count();
        if stuck > 0 {
            for a in actors.iter().filter(|a| !a.is_finished()) {
                warn!("{}", a.deadlock_report());
            }
            warn!(
                "{} receives posted and {} messages unmatched at {:?}",
                self.posted.len(),
                self.unexpected.len(),
                self.ts.to_dura()
            );
            return Err(Error::Deadlock(stuck));
        }
        Ok(())
    }

    /// Turn everything posted on `rank` into events.
    fn flush(&mut self, rank: Rank) -> Result<()> {
        for op in self.endpoints[rank].take_ops() {
            match op {
                Op::Send { dst, tag, payload } => self.post_send(rank, dst, tag, payload),
                Op::Recv { src, tag, .. } => self.post_recv((src, rank, tag))?,
            }
        }
        Ok(())
    }

    fn post_send(&mut self, src: Rank, dst: Rank, tag: MessageTag, payload: Vec<u8>) {
        self.num_sends += 1;
        if self.setting.fail_after == Some(self.num_sends) {
            warn!("injecting a failure into send {} from {} to {}", tag, src, dst);
            let after = self.jitter();
            self.schedule(
                after,
                Event::Complete {
                    rank: src,
                    completion: Completion::Failed {
                        peer: dst,
                        tag,
                        reason: "injected failure".to_owned(),
                    },
                },
            );
            return;
        }

        if payload.len() <= self.setting.eager_threshold {
            let after = self.jitter();
            self.schedule(
                after,
                Event::Complete {
                    rank: src,
                    completion: Completion::Sent { dst, tag },
                },
            );
            let after = self.delay(payload.len());
            self.schedule(
                after,
                Event::Arrive {
                    src,
                    dst,
                    tag,
                    payload,
                },
            );
        } else {
            let after = self.setting.latency_ns + self.jitter();
            self.schedule(
                after,
                Event::RequestToSend {
                    src,
                    dst,
                    tag,
                    payload,
                },
            );
        }
    }

    fn post_recv(&mut self, key: MatchKey) -> Result<()> {
        match self.unexpected.swap_remove(&key) {
            Some(Unexpected::Eager(payload)) => self.deliver(key, payload),
            Some(Unexpected::Rendezvous(payload)) => self.start_rendezvous(key, payload),
            None => {
                // the size is checked by the receiving actor
                if self.posted.insert(key, 0).is_some() {
                    return Err(Error::InvalidDag(format!(
                        "rank {} posted a receive from {} ({}) twice",
                        key.1, key.0, key.2
                    )));
                }
            }
        }
        Ok(())
    }

    fn arrive(&mut self, key: MatchKey, payload: Vec<u8>) -> Result<()> {
        if self.posted.swap_remove(&key).is_some() {
            self.deliver(key, payload);
            return Ok(());
        }
        self.stash(key, Unexpected::Eager(payload))
    }

    fn request_to_send(&mut self, key: MatchKey, payload: Vec<u8>) -> Result<()> {
        if self.posted.swap_remove(&key).is_some() {
            self.start_rendezvous(key, payload);
            return Ok(());
        }
        self.stash(key, Unexpected::Rendezvous(payload))
    }

    fn stash(&mut self, key: MatchKey, msg: Unexpected) -> Result<()> {
        if self.unexpected.insert(key, msg).is_some() {
            return Err(Error::InvalidDag(format!(
                "rank {} sent {} to rank {} twice",
                key.0, key.2, key.1
            )));
        }
        Ok(())
    }

    fn deliver(&mut self, (src, dst, tag): MatchKey, payload: Vec<u8>) {
        let after = self.jitter();
        self.schedule(
            after,
            Event::Complete {
                rank: dst,
                completion: Completion::Recvd { src, tag, payload },
            },
        );
    }

    /// Clear-to-send travels back, then the payload moves.
    fn start_rendezvous(&mut self, (src, dst, tag): MatchKey, payload: Vec<u8>) {
        let after = self.setting.latency_ns + self.delay(payload.len());
        self.schedule(
            after,
            Event::Complete {
                rank: src,
                completion: Completion::Sent { dst, tag },
            },
        );
        self.schedule(
            after,
            Event::Complete {
                rank: dst,
                completion: Completion::Recvd { src, tag, payload },
            },
        );
    }

    fn jitter(&mut self) -> Duration {
        if self.setting.jitter_ns == 0 {
            return 0;
        }
        self.rng.gen_range(0..=self.setting.jitter_ns)
    }

    fn delay(&mut self, nbytes: usize) -> Duration {
        self.setting
            .latency_ns
            .saturating_add(self.setting.bandwidth.transfer_time(nbytes))
            .saturating_add(self.jitter())
    }

    fn schedule(&mut self, after: Duration, event: Event) {
        self.seq += 1;
        self.events.push(Reverse(Scheduled {
            ts: self.ts.saturating_add(after),
            seq: self.seq,
            event,
        }));
    }
}

#[derive(Debug, Default)]
pub struct SimulatorBuilder {
    setting: Option<SimulatorSetting>,
    nproc: Option<usize>,
}

impl SimulatorBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_setting(&mut self, setting: SimulatorSetting) -> &mut Self {
        self.setting = Some(setting);
        self
    }

    pub fn nproc(&mut self, nproc: usize) -> &mut Self {
        self.nproc = Some(nproc);
        self
    }

    pub fn build(&mut self) -> Result<Simulator> {
        let setting = self.setting.clone().unwrap_or_default();
        let nproc = self
            .nproc
            .ok_or_else(|| Error::Config("number of ranks is not set".to_owned()))?;
        if nproc == 0 {
            return Err(Error::Config("a simulator needs at least one rank".to_owned()));
        }
        if setting.bandwidth.val() == 0 {
            return Err(Error::Config("link bandwidth must be positive".to_owned()));
        }

        let endpoints = (0..nproc)
            .map(|r| Endpoint::new(r, nproc).with_workspace_limit(setting.workspace_limit))
            .collect();
        let rng = StdRng::seed_from_u64(setting.seed);
        Ok(Simulator {
            setting,
            endpoints,
            ts: 0,
            seq: 0,
            events: BinaryHeap::new(),
            posted: HashMap::default(),
            unexpected: HashMap::default(),
            rng,
            num_sends: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::CollectiveRequest;
    use crate::algorithm::Algorithm;
    use crate::reduce::{decode, encode};
    use crate::Communicator;

    fn tag(round: u32) -> MessageTag {
        MessageTag {
            tag: 0,
            round,
            src_role: 0,
            dst_role: 1,
        }
    }

    #[test]
    fn endpoint_poisons_and_counts() {
        let mut ep = Endpoint::new(0, 2).with_workspace_limit(Some(64));
        let ws = ep.allocate_workspace(32).unwrap();
        assert!(ws.as_slice().iter().all(|&b| b == POISON));
        assert!(matches!(
            ep.allocate_workspace(40),
            Err(TransportError::OutOfWorkspace(40))
        ));
        ep.free_workspace(ws);
        ep.free_workspace(Workspace::new(WorkspaceId(17), 4));
        assert_eq!(ep.workspace_stats(), (1, 1));
        assert_eq!(ep.invalid_frees(), 1);
        assert_eq!(ep.live_workspaces(), 0);

        assert!(ep.send(2, tag(0), vec![]).is_err());
        ep.send(1, tag(0), vec![1]).unwrap();
        ep.recv(1, tag(1), 4).unwrap();
        assert_eq!(ep.take_ops().len(), 2);
        assert!(ep.take_ops().is_empty());
    }

    #[test]
    fn builder_rejects_bad_settings() {
        assert!(SimulatorBuilder::new().build().is_err());
        assert!(SimulatorBuilder::new().nproc(0).build().is_err());
        let setting = SimulatorSetting {
            bandwidth: 0.gbps(),
            ..Default::default()
        };
        assert!(SimulatorBuilder::new().with_setting(setting).nproc(2).build().is_err());
    }

    #[test]
    fn rendezvous_and_eager_give_the_same_answer() {
        for &threshold in &[0usize, 1 << 20] {
            let setting = SimulatorSetting {
                eager_threshold: threshold,
                jitter_ns: 50,
                seed: 7,
                ..Default::default()
            };
            let mut sim = SimulatorBuilder::new()
                .with_setting(setting)
                .nproc(3)
                .build()
                .unwrap();
            let inputs: Vec<Vec<u8>> = (0..3)
                .map(|r| encode(&(0..3).map(|j| (r * 10 + j) as u32).collect::<Vec<_>>()))
                .collect();
            let mut results = vec![vec![0u8; 12]; 3];
            let actors = results
                .iter_mut()
                .enumerate()
                .map(|(r, result)| {
                    let req = CollectiveRequest {
                        comm: Communicator::world(r, 3).unwrap(),
                        tag: 1,
                        nelems: 1,
                        type_size: 4,
                        reduce: None,
                        input: Some(&inputs[r][..]),
                        result,
                    };
                    CollectiveActor::new(req, Algorithm::Bruck.build(0, None)).unwrap()
                })
                .collect();
            let done = sim.run(actors).unwrap();
            assert_eq!(done.len(), 3);
            for (r, result) in results.iter().enumerate() {
                let expect: Vec<u32> = (0..3).map(|s| (s * 10 + r) as u32).collect();
                assert_eq!(decode::<u32>(result), expect);
            }
        }
    }

    #[test]
    fn missing_peer_is_a_deadlock() {
        let mut sim = SimulatorBuilder::new().nproc(2).build().unwrap();
        let input = encode(&[1i64, 2]);
        let mut result = vec![0u8; 16];
        let req = CollectiveRequest {
            comm: Communicator::world(0, 2).unwrap(),
            tag: 0,
            nelems: 2,
            type_size: 8,
            reduce: Some(crate::reduce::sum::<i64>),
            input: Some(&input[..]),
            result: &mut result,
        };
        let actor = CollectiveActor::new(req, Algorithm::RecursiveDoubling.build(0, None)).unwrap();
        assert!(matches!(sim.run(vec![actor]), Err(Error::Deadlock(1))));
        assert_eq!(sim.endpoint(0).unwrap().workspace_stats(), (1, 1));
    }
}
