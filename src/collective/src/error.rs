use thiserror::Error;

use crate::transport::TransportError;
use crate::Rank;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    #[error(
        "Buffer overflow: action touches [{offset}, {offset}+{nelems}) but {buffer} holds {extent} elements"
    )]
    BufferOverflow {
        buffer: &'static str,
        offset: usize,
        nelems: usize,
        extent: usize,
    },
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("Unknown partner: rank {rank} is not in [0, {nproc})")]
    UnknownPartner { rank: Rank, nproc: usize },
    #[error("Invalid dependency {producer} -> {consumer}: {reason}")]
    InvalidDependency {
        producer: usize,
        consumer: usize,
        reason: &'static str,
    },
    #[error("The action graph contains a cycle through action {0}")]
    CyclicGraph(usize),
    #[error("Invalid DAG: {0}")]
    InvalidDag(String),
    #[error("Unexpected completion from rank {peer}: {what}")]
    UnexpectedCompletion { peer: Rank, what: String },
    #[error("Deadlock: {0} collective(s) cannot make progress")]
    Deadlock(usize),
    #[error("Config error: {0}")]
    Config(String),
}
