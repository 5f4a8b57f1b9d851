//! Recursive-doubling all-reduce: a reduce-scatter by recursive halving followed by an
//! all-gather that replays the same exchanges with sender and receiver swapped.
//!
//! Non power-of-two communicators run on the virtual rank space of [`VirtualRankMap`]; a rank
//! playing two roles skips the exchange between its own roles since both roles work on the
//! same result buffer.

use log::trace;

use crate::algorithm::{require_extent, Collective, Context};
use crate::buffer::{BufferKind, BufferManager, RecvPolicy, SendPolicy};
use crate::dag::{Action, ActionGraph, ActionId, Peer, Span};
use crate::rank_map::{compute_tree, is_shared_role, VirtualRankMap};
use crate::transport::Transport;
use crate::{CollectiveKind, Error, Result};

#[inline]
pub fn divide_by_2_round_up(n: usize) -> usize {
    n / 2 + n % 2
}

#[inline]
pub fn divide_by_2_round_down(n: usize) -> usize {
    n / 2
}

/// One exchange of the reduce phase, replayed in reverse by the gather phase.
#[derive(Debug, Clone, Copy)]
struct Exchange {
    peer: Peer,
    /// the part this role keeps and receives partial results for
    keep: Span,
    /// the part handed to the partner
    give: Span,
}

#[derive(Debug, Default)]
pub struct RecursiveDoublingAllReduce {
    num_reducing_rounds: u32,
    num_total_rounds: u32,
}

impl RecursiveDoublingAllReduce {
    pub fn new() -> Self {
        Default::default()
    }

    #[inline]
    pub fn num_reducing_rounds(&self) -> u32 {
        self.num_reducing_rounds
    }

    #[inline]
    pub fn num_total_rounds(&self) -> u32 {
        self.num_total_rounds
    }
}

impl Collective for RecursiveDoublingAllReduce {
    fn kind(&self) -> CollectiveKind {
        CollectiveKind::AllReduce
    }

    fn validate(&self, ctx: &Context) -> Result<()> {
        compute_tree(ctx.nproc)?;
        if ctx.reduce.is_none() && ctx.nproc > 1 {
            return Err(Error::InvalidDag(
                "allreduce needs a reduction function".to_owned(),
            ));
        }
        Ok(())
    }

    fn init_buffers(
        &mut self,
        ctx: &Context,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        require_extent(bufs, BufferKind::Result, ctx.nelems)?;
        if !bufs.is_in_place() {
            require_extent(bufs, BufferKind::Input, ctx.nelems)?;
            bufs.copy_input_to_result(tport, 0, 0, ctx.nelems)?;
        }
        // partial results land at their own offset, so the scratch mirrors the result
        let recv_elems = if ctx.nproc > 1 { ctx.nelems } else { 0 };
        bufs.reserve(tport, 0, recv_elems)
    }

    fn init_dag(&mut self, ctx: &Context, dag: &mut ActionGraph) -> Result<()> {
        let tree = compute_tree(ctx.nproc)?;
        let map = VirtualRankMap::new(ctx.nproc)?;
        let roles = map.real_to_virtual(ctx.me)?;

        let log2nproc = tree.log2nproc;
        self.num_reducing_rounds = log2nproc;
        self.num_total_rounds = 2 * log2nproc;

        for &role in &roles {
            let mut exchanges: Vec<Option<Exchange>> = Vec::with_capacity(log2nproc as usize);
            let mut round_span = Span::new(0, ctx.nelems);
            let mut prev: Option<ActionId> = None;

            for i in 0..log2nproc {
                let gap = 1usize << i;
                let low = role & gap == 0;
                let partner = if low { role + gap } else { role - gap };

                let up = divide_by_2_round_up(round_span.nelems);
                let down = divide_by_2_round_down(round_span.nelems);
                let (keep, give) = if low {
                    (
                        Span::new(round_span.offset, up),
                        Span::new(round_span.offset + up, down),
                    )
                } else {
                    (
                        Span::new(round_span.offset + up, down),
                        Span::new(round_span.offset, up),
                    )
                };
                round_span = keep;

                if is_shared_role(partner, &roles) {
                    trace!(
                        "rank {} role {} shares round {} with its own role {}",
                        ctx.me,
                        role,
                        i,
                        partner
                    );
                    exchanges.push(None);
                    continue;
                }

                let peer = Peer {
                    role,
                    partner,
                    rank: map.virtual_to_real(partner)?,
                };
                let send = dag.new_send(i, peer, give, SendPolicy::InPlace)?;
                let recv = dag.new_recv(i, peer, keep, RecvPolicy::TempRecv)?;
                dag.add_dependency(prev, send)?;
                dag.add_dependency(prev, recv)?;
                prev = Some(recv);
                exchanges.push(Some(Exchange { peer, keep, give }));
            }

            for (i, ex) in exchanges.iter().enumerate().rev() {
                let ex = match ex {
                    Some(ex) => ex,
                    None => continue,
                };
                let round = log2nproc + (log2nproc - 1 - i as u32);
                let send = dag.new_send(round, ex.peer, ex.keep, SendPolicy::InPlace)?;
                let recv = dag.new_recv(round, ex.peer, ex.give, RecvPolicy::InPlace)?;
                dag.add_dependency(prev, send)?;
                dag.add_dependency(prev, recv)?;
                prev = Some(recv);
            }
        }

        Ok(())
    }

    fn buffer_action(
        &self,
        ctx: &Context,
        action: &Action,
        bufs: &mut BufferManager<'_>,
        tport: &mut dyn Transport,
    ) -> Result<()> {
        let (round, span) = match *action {
            Action::Recv {
                round,
                span,
                policy: RecvPolicy::TempRecv,
                ..
            } => (round, span),
            _ => return Ok(()),
        };

        let (off, len) = bufs.byte_range(BufferKind::Result, span.offset, span.nelems)?;
        let mut views = bufs.views();
        let dst = &mut views.result[off..off + len];
        let src = &views.temp_recv[off..off + len];
        if round < self.num_reducing_rounds {
            let reduce = ctx.reduce.ok_or_else(|| {
                Error::InvalidDag("allreduce needs a reduction function".to_owned())
            })?;
            reduce(dst, src);
        } else {
            tport.memcopy(dst, src);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Extents;

    fn build(me: usize, nproc: usize, nelems: usize) -> ActionGraph {
        let ctx = Context {
            me,
            nproc,
            nelems,
            type_size: 8,
            reduce: Some(crate::reduce::sum::<i64>),
        };
        let mut dag = ActionGraph::new(Extents {
            input: nelems,
            result: nelems,
            temp_send: nelems,
            temp_recv: nelems,
        });
        let mut ar = RecursiveDoublingAllReduce::new();
        ar.init_dag(&ctx, &mut dag).unwrap();
        dag
    }

    #[test]
    fn halves_cover_the_range_exactly_once() {
        for n in 0..20 {
            assert_eq!(divide_by_2_round_up(n) + divide_by_2_round_down(n), n);
        }
    }

    #[test]
    fn power_of_two_actions() {
        // 4 ranks: 2 reduce rounds and 2 gather rounds, one send and one recv each
        let dag = build(1, 4, 7);
        assert_eq!(dag.len(), 8);
        assert!(dag.topological_order().is_ok());
        let rounds: Vec<u32> = dag.iter().map(|(_, a)| a.round()).collect();
        assert_eq!(rounds, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn doubled_rank_skips_its_own_roles() {
        // 3 ranks: rank 0 plays virtual 0 and 1, which pair up in round 0
        let dag = build(0, 3, 5);
        let partners: Vec<usize> = dag.iter().filter_map(|(_, a)| a.peer()).map(|p| p.partner).collect();
        assert!(!partners.contains(&0) && !partners.contains(&1));
        // each role has one remote exchange per phase
        assert_eq!(dag.len(), 8);
    }
}
