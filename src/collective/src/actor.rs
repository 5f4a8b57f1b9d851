//! The executor of one collective on one rank.
//!
//! A [`CollectiveActor`] owns the action graph produced by its algorithm and moves every action
//! through `Pending -> Eligible -> InFlight -> Done`. It never blocks: `start` and
//! `on_completion` issue whatever became eligible and return.

use std::collections::VecDeque;

use fnv::FnvBuildHasher;
use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::algorithm::{Collective, Context};
use crate::buffer::BufferManager;
use crate::dag::{Action, ActionGraph, ActionId, ActionKind};
use crate::reduce::ReduceFn;
use crate::transport::{Completion, Transport, TransportError};
use crate::{CollectiveKind, Communicator, Error, MessageTag, Rank, Result, Timestamp};

type HashMap<K, V> = IndexMap<K, V, FnvBuildHasher>;

/// Everything a caller supplies to run one collective on one rank.
#[derive(Debug)]
pub struct CollectiveRequest<'a> {
    pub comm: Communicator,
    /// distinguishes concurrent collectives on the same ranks
    pub tag: u32,
    /// elements per participant
    pub nelems: usize,
    pub type_size: usize,
    pub reduce: Option<ReduceFn>,
    /// `None` runs in place on `result`
    pub input: Option<&'a [u8]>,
    pub result: &'a mut [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Eligible,
    InFlight,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Running,
    Finished,
}

/// Emitted once per actor when its collective is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveDone {
    pub tag: u32,
    pub kind: CollectiveKind,
    pub comm_rank: Rank,
    pub global_rank: Rank,
    pub num_actions: usize,
    pub finished_at: Timestamp,
}

type InFlightKey = (ActionKind, Rank, MessageTag);

pub struct CollectiveActor<'a> {
    comm: Communicator,
    tag: u32,
    ctx: Context,
    algorithm: Box<dyn Collective>,
    bufs: BufferManager<'a>,
    dag: ActionGraph,
    state: Vec<ActionState>,
    join: Vec<usize>,
    ready: VecDeque<ActionId>,
    in_flight: HashMap<InFlightKey, ActionId>,
    num_done: usize,
    started: bool,
    finished: bool,
    aborted: bool,
}

impl<'a> std::fmt::Debug for CollectiveActor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveActor")
            .field("kind", &self.algorithm.kind())
            .field("tag", &self.tag)
            .field("comm_rank", &self.ctx.me)
            .field("global_rank", &self.global_rank())
            .field("num_actions", &self.dag.len())
            .field("num_done", &self.num_done)
            .finish()
    }
}

impl<'a> CollectiveActor<'a> {
    pub fn new(request: CollectiveRequest<'a>, algorithm: Box<dyn Collective>) -> Result<Self> {
        let CollectiveRequest {
            comm,
            tag,
            nelems,
            type_size,
            reduce,
            input,
            result,
        } = request;

        if type_size == 0 {
            return Err(Error::InvalidTopology("zero-sized elements".to_owned()));
        }
        let ctx = Context {
            me: comm.rank(),
            nproc: comm.nproc(),
            nelems,
            type_size,
            reduce,
        };
        algorithm.validate(&ctx)?;

        Ok(CollectiveActor {
            comm,
            tag,
            ctx,
            algorithm,
            bufs: BufferManager::new(input, result, type_size),
            dag: ActionGraph::new(Default::default()),
            state: Vec::new(),
            join: Vec::new(),
            ready: VecDeque::new(),
            in_flight: HashMap::default(),
            num_done: 0,
            started: false,
            finished: false,
            aborted: false,
        })
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub fn kind(&self) -> CollectiveKind {
        self.algorithm.kind()
    }

    #[inline]
    pub fn global_rank(&self) -> Rank {
        self.comm.my_global_rank()
    }

    #[inline]
    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    #[inline]
    pub fn dag(&self) -> &ActionGraph {
        &self.dag
    }

    #[inline]
    pub fn state(&self, id: ActionId) -> ActionState {
        self.state[id.index()]
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn buffers(&self) -> &BufferManager<'a> {
        &self.bufs
    }

    /// Set up buffers, build and check the graph, and issue the initial actions.
    pub fn start(&mut self, tport: &mut dyn Transport) -> Result<Progress> {
        if self.started {
            return Err(Error::InvalidDag(format!(
                "collective {} started twice",
                self.tag
            )));
        }
        self.started = true;
        let res = self.try_start(tport);
        self.or_abort(tport, res)
    }

    fn try_start(&mut self, tport: &mut dyn Transport) -> Result<Progress> {
        self.algorithm.init_buffers(&self.ctx, &mut self.bufs, tport)?;

        let mut dag = ActionGraph::new(self.bufs.extents());
        self.algorithm.init_dag(&self.ctx, &mut dag)?;
        dag.topological_order()?;
        debug!(
            "rank {} {} tag {}: {} actions, {} edges, {} scratch bytes",
            self.global_rank(),
            self.algorithm.kind(),
            self.tag,
            dag.len(),
            dag.num_edges(),
            self.bufs.scratch_bytes()
        );

        self.state = vec![ActionState::Pending; dag.len()];
        self.join = dag.ids().map(|id| dag.num_producers(id)).collect();
        for id in dag.initial() {
            self.state[id.index()] = ActionState::Eligible;
            self.ready.push_back(id);
        }
        self.dag = dag;
        self.pump(tport)
    }

    /// Feed one transport completion addressed to this collective.
    pub fn on_completion(
        &mut self,
        tport: &mut dyn Transport,
        completion: Completion,
    ) -> Result<Progress> {
        if !self.started || self.finished || self.aborted {
            return Err(Error::UnexpectedCompletion {
                peer: peer_of(&completion),
                what: format!("{:?} for an inactive collective {}", completion, self.tag),
            });
        }
        let res = self.handle_completion(tport, completion);
        self.or_abort(tport, res)
    }

    fn handle_completion(
        &mut self,
        tport: &mut dyn Transport,
        completion: Completion,
    ) -> Result<Progress> {
        match completion {
            Completion::Sent { dst, tag } => {
                let id = self.take_in_flight(ActionKind::Send, dst, tag)?;
                self.complete(id);
            }
            Completion::Recvd { src, tag, payload } => {
                let id = self.take_in_flight(ActionKind::Recv, src, tag)?;
                let action = *self.dag.action(id);
                if let Action::Recv { span, policy, .. } = action {
                    let expected = span.nelems * self.ctx.type_size;
                    if payload.len() != expected {
                        return Err(TransportError::SizeMismatch {
                            tag,
                            expected,
                            actual: payload.len(),
                        }
                        .into());
                    }
                    self.bufs.land(tport, policy, span.offset, &payload)?;
                    self.algorithm
                        .buffer_action(&self.ctx, &action, &mut self.bufs, tport)?;
                    trace!(
                        "rank {} landed {} from {}: {:?}",
                        self.global_rank(),
                        action,
                        src,
                        payload
                    );
                }
                self.complete(id);
            }
            Completion::Failed { peer, tag, reason } => {
                let err = if self
                    .in_flight
                    .contains_key(&(ActionKind::Send, peer, tag))
                {
                    TransportError::Send {
                        dst: peer,
                        tag,
                        reason,
                    }
                } else {
                    TransportError::Recv {
                        src: peer,
                        tag,
                        reason,
                    }
                };
                return Err(err.into());
            }
        }
        self.pump(tport)
    }

    /// Issue every eligible action. Shuffles run to completion right here and may release more.
    fn pump(&mut self, tport: &mut dyn Transport) -> Result<Progress> {
        while let Some(id) = self.ready.pop_front() {
            self.issue(tport, id)?;
        }

        if self.num_done < self.dag.len() {
            return Ok(Progress::Running);
        }

        self.algorithm.finalize(&self.ctx, &mut self.bufs, tport)?;
        self.algorithm.finalize_buffers(&mut self.bufs, tport);
        self.finished = true;
        debug!(
            "rank {} {} tag {} finished after {} actions",
            self.global_rank(),
            self.algorithm.kind(),
            self.tag,
            self.num_done
        );
        Ok(Progress::Finished)
    }

    fn issue(&mut self, tport: &mut dyn Transport, id: ActionId) -> Result<()> {
        let action = *self.dag.action(id);
        debug!("rank {} tag {} start {} {}", self.global_rank(), self.tag, id, action);
        match action {
            Action::Send {
                round,
                peer,
                span,
                policy,
            } => {
                let dst = self.comm.global_rank(peer.rank)?;
                let tag = MessageTag {
                    tag: self.tag,
                    round,
                    src_role: peer.role,
                    dst_role: peer.partner,
                };
                let payload = self.bufs.send_payload(policy, span.offset, span.nelems)?;
                self.track(ActionKind::Send, dst, tag, id)?;
                tport.send(dst, tag, payload)?;
            }
            Action::Recv {
                round, peer, span, ..
            } => {
                let src = self.comm.global_rank(peer.rank)?;
                let tag = MessageTag {
                    tag: self.tag,
                    round,
                    src_role: peer.partner,
                    dst_role: peer.role,
                };
                self.track(ActionKind::Recv, src, tag, id)?;
                tport.recv(src, tag, span.nelems * self.ctx.type_size)?;
            }
            Action::Shuffle { selector, .. } => {
                self.algorithm
                    .shuffle(&self.ctx, selector, &mut self.bufs, tport)?;
                self.complete(id);
            }
        }
        Ok(())
    }

    fn track(&mut self, kind: ActionKind, peer: Rank, tag: MessageTag, id: ActionId) -> Result<()> {
        if let Some(other) = self.in_flight.insert((kind, peer, tag), id) {
            return Err(Error::InvalidDag(format!(
                "actions {} and {} are both a {} with rank {} ({})",
                other, id, kind, peer, tag
            )));
        }
        self.state[id.index()] = ActionState::InFlight;
        Ok(())
    }

    fn take_in_flight(&mut self, kind: ActionKind, peer: Rank, tag: MessageTag) -> Result<ActionId> {
        self.in_flight
            .swap_remove(&(kind, peer, tag))
            .ok_or_else(|| Error::UnexpectedCompletion {
                peer,
                what: format!("{} {} matches no action in flight", kind, tag),
            })
    }

    fn complete(&mut self, id: ActionId) {
        self.state[id.index()] = ActionState::Done;
        self.num_done += 1;
        trace!("rank {} tag {} done {}", self.global_rank(), self.tag, id);
        for &c in self.dag.consumers(id) {
            self.join[c.index()] -= 1;
            if self.join[c.index()] == 0 {
                self.state[c.index()] = ActionState::Eligible;
                self.ready.push_back(c);
            }
        }
    }

    fn or_abort(&mut self, tport: &mut dyn Transport, res: Result<Progress>) -> Result<Progress> {
        if let Err(e) = &res {
            warn!(
                "rank {} {} tag {} aborted: {}",
                self.global_rank(),
                self.algorithm.kind(),
                self.tag,
                e
            );
            self.abort(tport);
        }
        res
    }

    /// Stop the collective and hand its scratch back. Later completions are rejected.
    pub fn abort(&mut self, tport: &mut dyn Transport) {
        if self.finished || self.aborted {
            return;
        }
        self.aborted = true;
        self.ready.clear();
        self.in_flight.clear();
        self.algorithm.finalize_buffers(&mut self.bufs, tport);
    }

    pub fn summary(&self, finished_at: Timestamp) -> CollectiveDone {
        CollectiveDone {
            tag: self.tag,
            kind: self.algorithm.kind(),
            comm_rank: self.ctx.me,
            global_rank: self.global_rank(),
            num_actions: self.dag.len(),
            finished_at,
        }
    }

    /// Pending and in-flight actions, for diagnosing a stalled run.
    pub fn deadlock_report(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = writeln!(
            s,
            "rank {} (comm rank {}) {} tag {}: {}/{} actions done",
            self.global_rank(),
            self.ctx.me,
            self.algorithm.kind(),
            self.tag,
            self.num_done,
            self.dag.len()
        );
        for ((kind, peer, tag), id) in &self.in_flight {
            let _ = writeln!(s, "  in flight {} {} with rank {} ({})", id, kind, peer, tag);
        }
        for (id, action) in self.dag.iter() {
            if self.state[id.index()] == ActionState::Pending {
                let _ = writeln!(
                    s,
                    "  pending {} {} waiting on {} producer(s)",
                    id,
                    action,
                    self.join[id.index()]
                );
            }
        }
        s
    }
}

fn peer_of(completion: &Completion) -> Rank {
    match *completion {
        Completion::Sent { dst, .. } => dst,
        Completion::Recvd { src, .. } => src,
        Completion::Failed { peer, .. } => peer,
    }
}
