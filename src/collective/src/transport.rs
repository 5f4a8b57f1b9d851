//! The boundary between the engine and the network layer.
//!
//! `send` and `recv` return as soon as the operation is posted. The surrounding event loop
//! later feeds a [`Completion`] for every posted operation back into the actor that posted it.

use thiserror::Error;

use crate::{MessageTag, Rank};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send to rank {dst} failed ({tag}): {reason}")]
    Send {
        dst: Rank,
        tag: MessageTag,
        reason: String,
    },
    #[error("recv from rank {src} failed ({tag}): {reason}")]
    Recv {
        src: Rank,
        tag: MessageTag,
        reason: String,
    },
    #[error("peer rank {0} does not exist")]
    NoSuchPeer(Rank),
    #[error("cannot allocate {0} bytes of workspace")]
    OutOfWorkspace(usize),
    #[error("received {actual} bytes, expected {expected} ({tag})")]
    SizeMismatch {
        tag: MessageTag,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkspaceId(pub usize);

/// Scratch memory lent by the transport for the duration of one collective.
///
/// Freeing a workspace consumes it.
#[derive(Debug)]
pub struct Workspace {
    id: WorkspaceId,
    data: Vec<u8>,
}

impl Workspace {
    #[inline]
    pub fn new(id: WorkspaceId, nbytes: usize) -> Self {
        Workspace {
            id,
            data: vec![0; nbytes],
        }
    }

    /// Wrap memory a transport already holds, contents as given.
    #[inline]
    pub fn from_vec(id: WorkspaceId, data: Vec<u8>) -> Self {
        Workspace { id, data }
    }

    #[inline]
    pub fn id(&self) -> WorkspaceId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Give the memory back, used by transports that recycle or poison it.
    pub fn into_inner(self) -> (WorkspaceId, Vec<u8>) {
        (self.id, self.data)
    }
}

#[derive(Debug, Clone)]
pub enum Completion {
    /// A send has left the local buffer.
    Sent { dst: Rank, tag: MessageTag },
    /// A posted receive has been matched and its payload delivered.
    Recvd {
        src: Rank,
        tag: MessageTag,
        payload: Vec<u8>,
    },
    /// The transport gave up on an operation.
    Failed {
        peer: Rank,
        tag: MessageTag,
        reason: String,
    },
}

impl Completion {
    #[inline]
    pub fn tag(&self) -> &MessageTag {
        match self {
            Completion::Sent { tag, .. }
            | Completion::Recvd { tag, .. }
            | Completion::Failed { tag, .. } => tag,
        }
    }
}

pub trait Transport {
    /// Global rank of this endpoint.
    fn rank(&self) -> Rank;
    fn nproc(&self) -> usize;

    fn send(&mut self, dst: Rank, tag: MessageTag, payload: Vec<u8>) -> Result<(), TransportError>;
    fn recv(&mut self, src: Rank, tag: MessageTag, nbytes: usize) -> Result<(), TransportError>;

    fn allocate_workspace(&mut self, nbytes: usize) -> Result<Workspace, TransportError>;
    fn free_workspace(&mut self, ws: Workspace);

    /// Local memory copy. Transports may override it to account for copy cost.
    fn memcopy(&mut self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }
}
