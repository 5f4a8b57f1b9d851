//! Binary-tree scatter.
//!
//! The tree is rooted at rank 0. A root other than 0 first hands the lower half of its blocks to
//! rank 0 and the upper half to rank `midpoint`, which then act as roots of two subtrees. At
//! every level a holder `h` forwards the upper half of the blocks it holds to `h + gap`, and the
//! gap halves until it reaches 1. Non-root ranks keep what they received packed at the front of
//! the receive scratch, so a holder finds block `b` at `b - h`.

use log::trace;

use crate::algorithm::{require_extent, Collective, Context};
use crate::buffer::{BufferKind, BufferManager, RecvPolicy, SendPolicy};
use crate::dag::{ActionGraph, ActionId, Peer, Span};
use crate::rank_map::compute_tree;
use crate::transport::Transport;
use crate::{CollectiveKind, Error, Rank, Result};

/// One forwarding step of the tree: `from` passes blocks `[first, first + count)` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub round: u32,
    pub from: Rank,
    pub to: Rank,
    pub first: usize,
    pub count: usize,
}

/// Every transfer of a scatter over `nproc` ranks from `root`, in round order.
pub fn transfers(nproc: usize, root: Rank) -> Result<Vec<Transfer>> {
    let tree = compute_tree(nproc)?;
    let mid = tree.midpoint;
    let mut out = Vec::new();

    let start_gap = if root == 0 {
        mid
    } else {
        out.push(Transfer {
            round: 0,
            from: root,
            to: 0,
            first: 0,
            count: mid,
        });
        if root != mid {
            out.push(Transfer {
                round: 0,
                from: root,
                to: mid,
                first: mid,
                count: nproc - mid,
            });
        }
        mid / 2
    };

    let mut gap = start_gap;
    let mut round = 1;
    while gap > 0 {
        for from in (0..nproc).step_by(2 * gap) {
            let to = from + gap;
            // the root already holds every block
            if to >= nproc || to == root {
                continue;
            }
            out.push(Transfer {
                round,
                from,
                to,
                first: to,
                count: gap.min(nproc - to),
            });
        }
        gap /= 2;
        round += 1;
    }
    Ok(out)
}

#[derive(Debug)]
pub struct BinaryTreeScatter {
    root: Rank,
    root_in_place: bool,
}

impl BinaryTreeScatter {
    pub fn new(root: Rank) -> Self {
        BinaryTreeScatter {
            root,
            root_in_place: false,
        }
    }

    #[inline]
    pub fn root(&self) -> Rank {
        self.root
    }
}

impl Collective for BinaryTreeScatter {
    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Scatter
    }

    fn validate(&self, ctx: &Context) -> Result<()> {
        compute_tree(ctx.nproc)?;
        if self.root >= ctx.nproc {
            return Err(Error::InvalidTopology(format!(
                "scatter root {} outside a communicator of {} ranks",
                self.root, ctx.nproc
            )));
        }
        Ok(())
    }

    fn init_buffers(
        &mut self,
        ctx: &Context,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        if ctx.me == self.root {
            // in place the root's whole send buffer is its result buffer
            self.root_in_place = bufs.is_in_place();
            let kind = if self.root_in_place {
                BufferKind::Result
            } else {
                require_extent(bufs, BufferKind::Result, ctx.nelems)?;
                BufferKind::Input
            };
            return require_extent(bufs, kind, ctx.nproc * ctx.nelems);
        }

        require_extent(bufs, BufferKind::Result, ctx.nelems)?;
        let mid = compute_tree(ctx.nproc)?.midpoint;
        bufs.reserve(tport, 0, mid * ctx.nelems)
    }

    fn init_dag(&mut self, ctx: &Context, dag: &mut ActionGraph) -> Result<()> {
        let me = ctx.me;
        let nelems = ctx.nelems;
        let mut held: Option<ActionId> = None;

        for t in transfers(ctx.nproc, self.root)? {
            if t.to == me {
                let recv = dag.new_recv(
                    t.round,
                    Peer::direct(me, t.from),
                    Span::new(0, t.count * nelems),
                    RecvPolicy::UnpackTempBuf,
                )?;
                held = Some(recv);
            } else if t.from == me {
                let (span, policy) = if me == self.root {
                    let policy = if self.root_in_place {
                        SendPolicy::InPlace
                    } else {
                        SendPolicy::TempSend
                    };
                    (Span::new(t.first * nelems, t.count * nelems), policy)
                } else {
                    (
                        Span::new((t.first - me) * nelems, t.count * nelems),
                        SendPolicy::PrevRecv,
                    )
                };
                let send = dag.new_send(t.round, Peer::direct(me, t.to), span, policy)?;
                dag.add_dependency(held, send)?;
            }
        }
        trace!("rank {} scatter from {}: {} actions", me, self.root, dag.len());
        Ok(())
    }

    fn finalize(
        &mut self,
        ctx: &Context,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        let (off, len) = bufs.byte_range(BufferKind::Result, 0, ctx.nelems)?;
        if ctx.me == self.root {
            if self.root_in_place {
                let src = self.root * len;
                let mut views = bufs.views();
                views.result.copy_within(src..src + len, off);
                return Ok(());
            }
            return bufs.copy_input_to_result(tport, self.root * ctx.nelems, 0, ctx.nelems);
        }
        let mut views = bufs.views();
        tport.memcopy(&mut views.result[off..off + len], &views.temp_recv[..len]);
        Ok(())
    }
}
