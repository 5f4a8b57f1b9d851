//! A collective-communication engine.
//!
//! A collective operation (all-reduce, all-to-all, scatter) over a communicator is turned into a
//! DAG of point-to-point actions by an algorithm builder, then driven to completion against an
//! abstract [`Transport`](transport::Transport) by a [`CollectiveActor`](actor::CollectiveActor).
//! The [`simulator`] module provides an in-process transport and event loop.

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Error, Result};

pub mod rank_map;

pub mod buffer;

pub mod dag;

pub mod reduce;

pub mod algorithm;

pub mod communicator;
pub use communicator::Communicator;

pub mod transport;

pub mod actor;

pub mod bandwidth;
pub mod simulator;

pub mod config;
pub mod runner;

/// A rank in a communicator or in the transport's global rank space.
pub type Rank = usize;

// nanoseconds
pub type Timestamp = u64;
pub type Duration = u64;

pub trait ToStdDuration {
    fn to_dura(self) -> std::time::Duration;
}

impl ToStdDuration for u64 {
    #[inline]
    fn to_dura(self) -> std::time::Duration {
        std::time::Duration::new(self / 1_000_000_000, (self % 1_000_000_000) as u32)
    }
}

/// Identifies one message of one collective.
///
/// `src_role` and `dst_role` are the logical (possibly virtual) ranks of the two endpoints, so
/// that two roles played by the same real rank never alias each other's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageTag {
    pub tag: u32,
    pub round: u32,
    pub src_role: usize,
    pub dst_role: usize,
}

impl std::fmt::Display for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tag={} round={} roles={}->{}",
            self.tag, self.round, self.src_role, self.dst_role
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectiveKind {
    AllReduce,
    AllToAll,
    Scatter,
}

impl std::fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectiveKind::AllReduce => write!(f, "allreduce"),
            CollectiveKind::AllToAll => write!(f, "alltoall"),
            CollectiveKind::Scatter => write!(f, "scatter"),
        }
    }
}
