//! Direct all-to-all: in round `i` every rank sends to `me + i` and receives from `me - i`.
//! Only `window` exchanges per direction may be in flight at once.

use crate::algorithm::{require_extent, Collective, Context};
use crate::buffer::{BufferKind, BufferManager, RecvPolicy, SendPolicy};
use crate::dag::{ActionGraph, ActionId, Peer, Span};
use crate::transport::Transport;
use crate::{CollectiveKind, Error, Rank, Result};

pub const DEFAULT_WINDOW: usize = 8;

const OWN_BLOCK: u32 = 0;

/// Partner `step` positions away from `me`, walking forward for `stride_direction == 1` and
/// backward for `-1`.
#[inline]
pub fn partner(me: Rank, step: usize, nproc: usize, stride_direction: isize) -> Rank {
    let step = step % nproc;
    if stride_direction >= 0 {
        (me + step) % nproc
    } else {
        (me + nproc - step) % nproc
    }
}

#[derive(Debug)]
pub struct DirectAllToAll {
    window: usize,
}

impl DirectAllToAll {
    pub fn new(window: usize) -> Self {
        DirectAllToAll {
            window: window.max(1),
        }
    }

    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }
}

impl Collective for DirectAllToAll {
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
            return Ok(());
        }

        // received blocks overwrite the result, so outgoing blocks are staged first
        if ctx.nproc > 1 {
            bufs.reserve(tport, total, 0)?;
            let nbytes = total * ctx.type_size;
            let mut views = bufs.views();
            tport.memcopy(&mut views.temp_send[..nbytes], &views.result[..nbytes]);
        }
        Ok(())
    }

    fn init_dag(&mut self, ctx: &Context, dag: &mut ActionGraph) -> Result<()> {
        let n = ctx.nproc;
        let me = ctx.me;
        dag.new_shuffle(0, OWN_BLOCK);

        let mut sends: Vec<ActionId> = Vec::with_capacity(n.saturating_sub(1));
        let mut recvs: Vec<ActionId> = Vec::with_capacity(n.saturating_sub(1));
        for i in 1..n {
            let dst = partner(me, i, n, 1);
            let src = partner(me, i, n, -1);
            let round = i as u32;
            let send = dag.new_send(
                round,
                Peer::direct(me, dst),
                Span::new(dst * ctx.nelems, ctx.nelems),
                SendPolicy::TempSend,
            )?;
            let recv = dag.new_recv(
                round,
                Peer::direct(me, src),
                Span::new(src * ctx.nelems, ctx.nelems),
                RecvPolicy::InPlace,
            )?;
            if i > self.window {
                dag.add_dependency(Some(sends[i - 1 - self.window]), send)?;
                dag.add_dependency(Some(recvs[i - 1 - self.window]), recv)?;
            }
            sends.push(send);
            recvs.push(recv);
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
        if selector != OWN_BLOCK {
            return Err(Error::InvalidDag(format!(
                "direct all-to-all has no shuffle {}",
                selector
            )));
        }
        // in place the own block is already where it belongs
        bufs.copy_input_to_result(tport, ctx.me * ctx.nelems, ctx.me * ctx.nelems, ctx.nelems)
    }
}
