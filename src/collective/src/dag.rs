//! The action graph: point-to-point sends and receives plus local shuffles, linked by
//! dependency edges.
//!
//! Actions are stored in a `Vec` and addressed by [`ActionId`]; edges are kept as forward
//! adjacency lists only, since execution never walks from a consumer back to its producers.

use smallvec::SmallVec;

use crate::buffer::{BufferKind, BufferManager, Extents, RecvPolicy, SendPolicy};
use crate::{Error, Rank, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(usize);

impl ActionId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who an action talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// the logical rank this action is performed as (a virtual role for recursive doubling)
    pub role: Rank,
    /// the logical rank of the other side
    pub partner: Rank,
    /// the communicator rank of the other side
    pub rank: Rank,
}

impl Peer {
    /// A peer addressed by its communicator rank, with no virtual roles involved.
    #[inline]
    pub fn direct(me: Rank, partner: Rank) -> Self {
        Peer {
            role: me,
            partner,
            rank: partner,
        }
    }
}

/// A range of elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub offset: usize,
    pub nelems: usize,
}

impl Span {
    #[inline]
    pub fn new(offset: usize, nelems: usize) -> Self {
        Span { offset, nelems }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.nelems
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Send,
    Recv,
    Shuffle,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Send => write!(f, "send"),
            ActionKind::Recv => write!(f, "recv"),
            ActionKind::Shuffle => write!(f, "shuffle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send {
        round: u32,
        peer: Peer,
        span: Span,
        policy: SendPolicy,
    },
    Recv {
        round: u32,
        peer: Peer,
        span: Span,
        policy: RecvPolicy,
    },
    /// A local rearrangement of memory. The selector is interpreted by the algorithm.
    Shuffle { round: u32, selector: u32 },
}

impl Action {
    #[inline]
    pub fn round(&self) -> u32 {
        match *self {
            Action::Send { round, .. } | Action::Recv { round, .. } | Action::Shuffle { round, .. } => {
                round
            }
        }
    }

    #[inline]
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Send { .. } => ActionKind::Send,
            Action::Recv { .. } => ActionKind::Recv,
            Action::Shuffle { .. } => ActionKind::Shuffle,
        }
    }

    #[inline]
    pub fn peer(&self) -> Option<Peer> {
        match *self {
            Action::Send { peer, .. } | Action::Recv { peer, .. } => Some(peer),
            Action::Shuffle { .. } => None,
        }
    }

    #[inline]
    pub fn span(&self) -> Option<Span> {
        match *self {
            Action::Send { span, .. } | Action::Recv { span, .. } => Some(span),
            Action::Shuffle { .. } => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Send { round, peer, span, policy } => write!(
                f,
                "send r={},p={},o={},n={} {:?}",
                round, peer.partner, span.offset, span.nelems, policy
            ),
            Action::Recv { round, peer, span, policy } => write!(
                f,
                "recv r={},p={},o={},n={} {:?}",
                round, peer.partner, span.offset, span.nelems, policy
            ),
            Action::Shuffle { round, selector } => write!(f, "shuffle r={},s={}", round, selector),
        }
    }
}

type Consumers = SmallVec<[ActionId; 4]>;

#[derive(Debug, Clone)]
pub struct ActionGraph {
    extents: Extents,
    actions: Vec<Action>,
    consumers: Vec<Consumers>,
    num_producers: Vec<usize>,
    num_edges: usize,
}

impl ActionGraph {
    /// An empty graph whose actions will be checked against `extents`.
    pub fn new(extents: Extents) -> Self {
        ActionGraph {
            extents,
            actions: Vec::new(),
            consumers: Vec::new(),
            num_producers: Vec::new(),
            num_edges: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    #[inline]
    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    #[inline]
    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    pub fn new_send(&mut self, round: u32, peer: Peer, span: Span, policy: SendPolicy) -> Result<ActionId> {
        let target = match policy {
            SendPolicy::InPlace => BufferKind::Result,
            SendPolicy::TempSend => BufferKind::TempSend,
            SendPolicy::PrevRecv => BufferKind::TempRecv,
        };
        self.check_extent(target, span)?;
        Ok(self.push(Action::Send {
            round,
            peer,
            span,
            policy,
        }))
    }

    pub fn new_recv(&mut self, round: u32, peer: Peer, span: Span, policy: RecvPolicy) -> Result<ActionId> {
        self.check_extent(BufferManager::recv_sink(policy), span)?;
        if policy == RecvPolicy::TempRecv {
            // the payload is combined into the result at the same offset
            self.check_extent(BufferKind::Result, span)?;
        }
        Ok(self.push(Action::Recv {
            round,
            peer,
            span,
            policy,
        }))
    }

    pub fn new_shuffle(&mut self, round: u32, selector: u32) -> ActionId {
        self.push(Action::Shuffle { round, selector })
    }

    /// `consumer` may only start once `producer` is done. A `None` producer adds nothing: an
    /// action without producers is eligible immediately.
    pub fn add_dependency(&mut self, producer: Option<ActionId>, consumer: ActionId) -> Result<()> {
        let producer = match producer {
            Some(p) => p,
            None => return self.get(consumer).map(|_| ()),
        };
        let (p, c) = (*self.get(producer)?, *self.get(consumer)?);
        if producer == consumer {
            return Err(Error::InvalidDependency {
                producer: producer.0,
                consumer: consumer.0,
                reason: "self loop",
            });
        }
        if p.round() > c.round() {
            return Err(Error::InvalidDependency {
                producer: producer.0,
                consumer: consumer.0,
                reason: "producer runs in a later round than its consumer",
            });
        }
        if self.consumers[producer.0].contains(&consumer) {
            return Ok(());
        }
        self.consumers[producer.0].push(consumer);
        self.num_producers[consumer.0] += 1;
        self.num_edges += 1;
        Ok(())
    }

    #[inline]
    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    #[inline]
    pub fn consumers(&self, id: ActionId) -> &[ActionId] {
        &self.consumers[id.0]
    }

    #[inline]
    pub fn num_producers(&self, id: ActionId) -> usize {
        self.num_producers[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = ActionId> {
        (0..self.actions.len()).map(ActionId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionId, &Action)> {
        self.actions.iter().enumerate().map(|(i, a)| (ActionId(i), a))
    }

    pub fn edges(&self) -> impl Iterator<Item = (ActionId, ActionId)> + '_ {
        self.consumers
            .iter()
            .enumerate()
            .flat_map(|(p, cs)| cs.iter().map(move |&c| (ActionId(p), c)))
    }

    /// Actions with no producers.
    pub fn initial(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.ids().filter(move |&id| self.num_producers[id.0] == 0)
    }

    /// A topological order of the graph, or the first action found on a cycle.
    pub fn topological_order(&self) -> Result<Vec<ActionId>> {
        let mut join = self.num_producers.clone();
        let mut order: Vec<ActionId> = self.initial().collect();
        let mut i = 0;
        while i < order.len() {
            let id = order[i];
            for &c in &self.consumers[id.0] {
                join[c.0] -= 1;
                if join[c.0] == 0 {
                    order.push(c);
                }
            }
            i += 1;
        }

        if order.len() < self.actions.len() {
            let stuck = join.iter().position(|&j| j > 0).unwrap_or(0);
            return Err(Error::CyclicGraph(stuck));
        }
        Ok(order)
    }

    fn push(&mut self, action: Action) -> ActionId {
        let id = ActionId(self.actions.len());
        self.actions.push(action);
        self.consumers.push(Consumers::new());
        self.num_producers.push(0);
        id
    }

    fn get(&self, id: ActionId) -> Result<&Action> {
        self.actions
            .get(id.0)
            .ok_or_else(|| Error::InvalidDag(format!("no action {}", id)))
    }

    fn check_extent(&self, kind: BufferKind, span: Span) -> Result<()> {
        let extent = self.extents.of(kind);
        if span.end() > extent {
            return Err(Error::BufferOverflow {
                buffer: kind.name(),
                offset: span.offset,
                nelems: span.nelems,
                extent,
            });
        }
        Ok(())
    }
}
