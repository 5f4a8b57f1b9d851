//! Algorithm builders. Each one sizes the buffers a collective needs, emits its action graph,
//! and interprets the local data movement (shuffles, reductions, final copies) of that graph.

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferKind, BufferManager};
use crate::dag::{Action, ActionGraph};
use crate::reduce::ReduceFn;
use crate::transport::Transport;
use crate::{CollectiveKind, Error, Rank, Result};

pub mod allreduce;
pub mod bruck;
pub mod direct;
pub mod scatter;

pub use allreduce::RecursiveDoublingAllReduce;
pub use bruck::BruckAllToAll;
pub use direct::DirectAllToAll;
pub use scatter::BinaryTreeScatter;

/// What every builder knows about the collective it is building.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// communicator rank of this participant
    pub me: Rank,
    pub nproc: usize,
    /// elements per participant
    pub nelems: usize,
    pub type_size: usize,
    pub reduce: Option<ReduceFn>,
}

pub trait Collective: std::fmt::Debug {
    fn kind(&self) -> CollectiveKind;

    /// Reject a request before any buffer or action is created.
    fn validate(&self, ctx: &Context) -> Result<()> {
        if ctx.nproc == 0 {
            return Err(Error::InvalidTopology(format!("{} over zero ranks", self.kind())));
        }
        Ok(())
    }

    fn init_buffers(
        &mut self,
        ctx: &Context,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()>;

    fn init_dag(&mut self, ctx: &Context, dag: &mut ActionGraph) -> Result<()>;

    /// Run the local rearrangement named by a shuffle action.
    fn shuffle(
        &self,
        _ctx: &Context,
        _selector: u32,
        _bufs: &mut BufferManager<'_>,
        _tport: &mut dyn Transport,
    ) -> Result<()> {
        Err(Error::InvalidDag(format!(
            "collective {} does not shuffle data",
            self.kind()
        )))
    }

    /// Called once a Recv has landed its payload.
    fn buffer_action(
        &self,
        _ctx: &Context,
        _action: &Action,
        _bufs: &mut BufferManager<'_>,
        _tport: &mut dyn Transport,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once after every action is done, before the scratch space is released.
    fn finalize(
        &mut self,
        _ctx: &Context,
        _bufs: &mut BufferManager<'_>,
        _tport: &mut dyn Transport,
    ) -> Result<()> {
        Ok(())
    }

    fn finalize_buffers(&mut self, bufs: &mut BufferManager<'_>, tport: &mut dyn Transport) {
        bufs.release(tport);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    RecursiveDoubling,
    Bruck,
    Direct,
    BinaryTree,
}

impl Algorithm {
    pub fn kind(self) -> CollectiveKind {
        match self {
            Algorithm::RecursiveDoubling => CollectiveKind::AllReduce,
            Algorithm::Bruck | Algorithm::Direct => CollectiveKind::AllToAll,
            Algorithm::BinaryTree => CollectiveKind::Scatter,
        }
    }

    /// Build the collective. `root` is used by scatter, `window` by direct all-to-all.
    pub fn build(self, root: Rank, window: Option<usize>) -> Box<dyn Collective> {
        match self {
            Algorithm::RecursiveDoubling => Box::new(RecursiveDoublingAllReduce::new()),
            Algorithm::Bruck => Box::new(BruckAllToAll::new()),
            Algorithm::Direct => Box::new(DirectAllToAll::new(
                window.unwrap_or(direct::DEFAULT_WINDOW),
            )),
            Algorithm::BinaryTree => Box::new(BinaryTreeScatter::new(root)),
        }
    }
}

/// Fail unless `kind` holds at least `nelems` elements.
pub(crate) fn require_extent(bufs: &BufferManager<'_>, kind: BufferKind, nelems: usize) -> Result<()> {
    let extent = bufs.extents().of(kind);
    if extent < nelems {
        return Err(Error::BufferOverflow {
            buffer: kind.name(),
            offset: 0,
            nelems,
            extent,
        });
    }
    Ok(())
}
