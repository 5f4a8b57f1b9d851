//! Bruck's all-to-all.
//!
//! After a local rotation, block `j` of rank `p` holds the data rank `p` sends to `p + j`. In
//! round `k` every rank forwards the blocks whose index has bit `k` set to `p + 2^k`, packing
//! them into the send scratch first and unpacking the received ones into the same positions.
//! `ceil(log2 nproc)` rounds move every block to its destination; a final de-rotation puts the
//! block from rank `i` at position `i`.

use log::trace;

use crate::algorithm::{require_extent, Collective, Context};
use crate::buffer::{BufferKind, BufferManager, RecvPolicy, SendPolicy};
use crate::dag::{ActionGraph, ActionId, Peer, Span};
use crate::transport::Transport;
use crate::{CollectiveKind, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Rotate,
    Pack(u32),
    Unpack(u32),
}

impl Step {
    fn selector(self) -> u32 {
        match self {
            Step::Rotate => 0,
            Step::Pack(k) => 1 + 2 * k,
            Step::Unpack(k) => 2 + 2 * k,
        }
    }

    fn from_selector(s: u32) -> Step {
        match s {
            0 => Step::Rotate,
            s if s % 2 == 1 => Step::Pack((s - 1) / 2),
            s => Step::Unpack((s - 2) / 2),
        }
    }
}

/// Number of exchange rounds, `ceil(log2 nproc)`.
pub fn num_rounds(nproc: usize) -> u32 {
    let mut k = 0;
    while (1usize << k) < nproc {
        k += 1;
    }
    k
}

/// Block indices forwarded in round `k`.
pub fn selected_blocks(nproc: usize, k: u32) -> impl Iterator<Item = usize> {
    let bit = 1usize << k;
    (0..nproc).filter(move |j| j & bit != 0)
}

/// The largest number of blocks in flight in any round. Never more than half the next power of
/// two above `nproc`.
pub fn max_blocks_per_round(nproc: usize) -> usize {
    (0..num_rounds(nproc))
        .map(|k| selected_blocks(nproc, k).count())
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub struct BruckAllToAll {
    num_rounds: u32,
}

impl BruckAllToAll {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Collective for BruckAllToAll {
    fn kind(&self) -> CollectiveKind {
        CollectiveKind::AllToAll
    }

    fn init_buffers(
        &mut self,
        ctx: &Context,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        let total = ctx.nproc * ctx.nelems;
        require_extent(bufs, BufferKind::Result, total)?;
        if !bufs.is_in_place() {
            require_extent(bufs, BufferKind::Input, total)?;
        }
        let scratch = max_blocks_per_round(ctx.nproc) * ctx.nelems;
        bufs.reserve(tport, scratch, scratch)
    }

    fn init_dag(&mut self, ctx: &Context, dag: &mut ActionGraph) -> Result<()> {
        let n = ctx.nproc;
        let me = ctx.me;
        self.num_rounds = num_rounds(n);

        let rotate = dag.new_shuffle(0, Step::Rotate.selector());
        let mut last_local: ActionId = rotate;
        let mut prev_send: Option<ActionId> = None;

        for k in 0..self.num_rounds {
            let round = k + 1;
            let gap = 1usize << k;
            let span = Span::new(0, selected_blocks(n, k).count() * ctx.nelems);
            let dst = (me + gap) % n;
            let src = (me + n - gap) % n;

            let pack = dag.new_shuffle(round, Step::Pack(k).selector());
            let send = dag.new_send(round, Peer::direct(me, dst), span, SendPolicy::TempSend)?;
            let recv = dag.new_recv(round, Peer::direct(me, src), span, RecvPolicy::PackedTempBuf)?;
            let unpack = dag.new_shuffle(round, Step::Unpack(k).selector());

            // send scratch is reused every round
            dag.add_dependency(Some(last_local), pack)?;
            dag.add_dependency(prev_send, pack)?;
            dag.add_dependency(Some(pack), send)?;
            // and so is the recv scratch
            dag.add_dependency(Some(last_local), recv)?;
            dag.add_dependency(Some(recv), unpack)?;
            dag.add_dependency(Some(pack), unpack)?;

            last_local = unpack;
            prev_send = Some(send);
        }

        Ok(())
    }

    fn shuffle(
        &self,
        ctx: &Context,
        selector: u32,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        let n = ctx.nproc;
        let block = ctx.nelems * ctx.type_size;
        let step = Step::from_selector(selector);
        let round = match step {
            Step::Pack(k) | Step::Unpack(k) => Some(k),
            Step::Rotate => None,
        };
        if let Some(k) = round {
            if k >= self.num_rounds {
                return Err(Error::InvalidDag(format!(
                    "bruck has {} rounds, got shuffle {}",
                    self.num_rounds, selector
                )));
            }
        }
        trace!("rank {} bruck {:?}", ctx.me, step);

        let mut views = bufs.views();
        match step {
            Step::Rotate => match views.input {
                None => views.result[..n * block].rotate_left(ctx.me * block),
                Some(input) => {
                    for j in 0..n {
                        let src = (ctx.me + j) % n;
                        tport.memcopy(
                            &mut views.result[j * block..(j + 1) * block],
                            &input[src * block..(src + 1) * block],
                        );
                    }
                }
            },
            Step::Pack(k) => {
                for (i, j) in selected_blocks(n, k).enumerate() {
                    tport.memcopy(
                        &mut views.temp_send[i * block..(i + 1) * block],
                        &views.result[j * block..(j + 1) * block],
                    );
                }
            }
            Step::Unpack(k) => {
                for (i, j) in selected_blocks(n, k).enumerate() {
                    tport.memcopy(
                        &mut views.result[j * block..(j + 1) * block],
                        &views.temp_recv[i * block..(i + 1) * block],
                    );
                }
            }
        }
        Ok(())
    }

    fn finalize(
        &mut self,
        ctx: &Context,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        let n = ctx.nproc;
        let block = ctx.nelems * ctx.type_size;
        if n == 1 || block == 0 {
            return Ok(());
        }

        let mut tmp = bufs.alloc_temp(tport, n * block)?;
        {
            let mut views = bufs.views();
            tport.memcopy(tmp.as_mut_slice(), &views.result[..n * block]);
            let tmp = tmp.as_slice();
            for i in 0..n {
                let j = (ctx.me + n - i) % n;
                tport.memcopy(
                    &mut views.result[i * block..(i + 1) * block],
                    &tmp[j * block..(j + 1) * block],
                );
            }
        }
        bufs.free_temp(tport, tmp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_and_blocks() {
        assert_eq!(num_rounds(1), 0);
        assert_eq!(num_rounds(2), 1);
        assert_eq!(num_rounds(5), 3);
        assert_eq!(num_rounds(8), 3);
        assert_eq!(num_rounds(9), 4);

        assert_eq!(selected_blocks(5, 2).collect::<Vec<_>>(), vec![4]);
        assert_eq!(selected_blocks(7, 0).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(max_blocks_per_round(5), 2);
        assert_eq!(max_blocks_per_round(9), 4);
        assert_eq!(max_blocks_per_round(1), 0);
    }

    #[test]
    fn every_block_but_zero_moves() {
        // the union of all forwarded positions covers every block that must leave
        for n in 1..20 {
            let mut moved = vec![false; n];
            for k in 0..num_rounds(n) {
                for j in selected_blocks(n, k) {
                    moved[j] = true;
                }
            }
            assert!(moved.iter().skip(1).all(|&m| m), "n = {}", n);
        }
    }

    #[test]
    fn selector_round_trip() {
        for step in &[Step::Rotate, Step::Pack(0), Step::Unpack(0), Step::Pack(3), Step::Unpack(5)] {
            assert_eq!(Step::from_selector(step.selector()), *step);
        }
    }
}
