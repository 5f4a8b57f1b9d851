//! Buffers touched by one collective: the caller's send and result buffers, plus scratch
//! space borrowed from the transport.
//!
//! All scratch of a collective lives in a single workspace arena. The arena is carved into a
//! send-side region followed by a receive-side region; actions address the regions by element
//! offset, and every offset is checked against the region's extent when the action graph is
//! built.

use log::{debug, trace};

use crate::transport::{Transport, Workspace};
use crate::{Error, Result};

/// Where a Send reads its payload from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendPolicy {
    /// the result buffer
    InPlace,
    /// the send-side scratch region, or the caller's send buffer when there is none
    TempSend,
    /// the receive-side scratch region, filled by an earlier Recv of the same chain
    PrevRecv,
}

/// Where a Recv lands its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecvPolicy {
    /// directly into the result buffer
    InPlace,
    /// into scratch at the same offset, then combined into the result by the algorithm
    TempRecv,
    /// packed into scratch, unpacked by a later shuffle
    PackedTempBuf,
    /// into scratch, copied into the result when the collective finalizes
    UnpackTempBuf,
}

/// The named buffers an action can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Input,
    Result,
    TempSend,
    TempRecv,
}

impl BufferKind {
    pub fn name(self) -> &'static str {
        match self {
            BufferKind::Input => "send buffer",
            BufferKind::Result => "result buffer",
            BufferKind::TempSend => "send scratch",
            BufferKind::TempRecv => "recv scratch",
        }
    }
}

/// A byte range inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

/// Extent of every buffer, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extents {
    pub input: usize,
    pub result: usize,
    pub temp_send: usize,
    pub temp_recv: usize,
}

impl Extents {
    pub fn of(&self, kind: BufferKind) -> usize {
        match kind {
            BufferKind::Input => self.input,
            BufferKind::Result => self.result,
            BufferKind::TempSend => self.temp_send,
            BufferKind::TempRecv => self.temp_recv,
        }
    }
}

/// Simultaneous mutable access to every buffer, for shuffles and reductions.
pub struct Views<'s> {
    pub input: Option<&'s [u8]>,
    pub result: &'s mut [u8],
    pub temp_send: &'s mut [u8],
    pub temp_recv: &'s mut [u8],
}

pub struct BufferManager<'a> {
    type_size: usize,
    input: Option<&'a [u8]>,
    result: &'a mut [u8],
    arena: Option<Workspace>,
    temp_send: Option<Region>,
    temp_recv: Option<Region>,
    released: bool,
    num_allocs: usize,
    num_frees: usize,
}

impl<'a> std::fmt::Debug for BufferManager<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("type_size", &self.type_size)
            .field("input", &self.input.map(|b| b.len()))
            .field("result", &self.result.len())
            .field("temp_send", &self.temp_send)
            .field("temp_recv", &self.temp_recv)
            .field("num_allocs", &self.num_allocs)
            .field("num_frees", &self.num_frees)
            .finish()
    }
}

impl<'a> BufferManager<'a> {
    /// `input == None` means the operation runs in place: the caller's data is already in
    /// `result`.
    pub fn new(input: Option<&'a [u8]>, result: &'a mut [u8], type_size: usize) -> Self {
        BufferManager {
            type_size,
            input,
            result,
            arena: None,
            temp_send: None,
            temp_recv: None,
            released: false,
            num_allocs: 0,
            num_frees: 0,
        }
    }

    #[inline]
    pub fn type_size(&self) -> usize {
        self.type_size
    }

    #[inline]
    pub fn is_in_place(&self) -> bool {
        self.input.is_none()
    }

    #[inline]
    pub fn num_allocs(&self) -> usize {
        self.num_allocs
    }

    #[inline]
    pub fn num_frees(&self) -> usize {
        self.num_frees
    }

    #[inline]
    pub fn scratch_bytes(&self) -> usize {
        self.arena.as_ref().map_or(0, |ws| ws.len())
    }

    pub fn extents(&self) -> Extents {
        let ts = self.type_size;
        let input = self.input.map_or(0, |b| b.len() / ts);
        Extents {
            input,
            result: self.result.len() / ts,
            temp_send: self.temp_send.map_or(input, |r| r.len / ts),
            temp_recv: self.temp_recv.map_or(0, |r| r.len / ts),
        }
    }

    /// Allocate the scratch arena: `send_elems` for the send side, `recv_elems` for the
    /// receive side. Nothing is allocated when both are zero.
    pub fn reserve(
        &mut self,
        tport: &mut dyn Transport,
        send_elems: usize,
        recv_elems: usize,
    ) -> Result<()> {
        if self.arena.is_some() || self.released {
            return Err(Error::InvalidDag(
                "scratch space reserved twice for one collective".to_owned(),
            ));
        }

        let send_bytes = send_elems * self.type_size;
        let recv_bytes = recv_elems * self.type_size;
        if send_bytes + recv_bytes == 0 {
            return Ok(());
        }

        let ws = tport.allocate_workspace(send_bytes + recv_bytes)?;
        self.num_allocs += 1;
        debug!(
            "rank {} reserved workspace {:?}: {} send bytes, {} recv bytes",
            tport.rank(),
            ws.id(),
            send_bytes,
            recv_bytes
        );
        if send_bytes > 0 {
            self.temp_send = Some(Region {
                offset: 0,
                len: send_bytes,
            });
        }
        if recv_bytes > 0 {
            self.temp_recv = Some(Region {
                offset: send_bytes,
                len: recv_bytes,
            });
        }
        self.arena = Some(ws);
        Ok(())
    }

    /// The explicit first copy of `nelems` elements of the caller's send buffer into the result
    /// buffer, skipped when running in place.
    pub fn copy_input_to_result(
        &mut self,
        tport: &mut dyn Transport,
        src_offset: usize,
        dst_offset: usize,
        nelems: usize,
    ) -> Result<()> {
        if self.input.is_none() {
            return Ok(());
        }
        let (src_off, len) = self.byte_range(BufferKind::Input, src_offset, nelems)?;
        let (dst_off, _) = self.byte_range(BufferKind::Result, dst_offset, nelems)?;
        if let Some(input) = self.input {
            tport.memcopy(
                &mut self.result[dst_off..dst_off + len],
                &input[src_off..src_off + len],
            );
        }
        Ok(())
    }

    /// Copy the payload an action would send out of its source buffer.
    pub fn send_payload(&self, policy: SendPolicy, offset: usize, nelems: usize) -> Result<Vec<u8>> {
        let kind = self.send_source(policy);
        let (off, len) = self.byte_range(kind, offset, nelems)?;
        let buf = self.slice(kind);
        Ok(buf[off..off + len].to_vec())
    }

    /// Land a received payload into the buffer named by the policy.
    pub fn land(
        &mut self,
        tport: &mut dyn Transport,
        policy: RecvPolicy,
        offset: usize,
        payload: &[u8],
    ) -> Result<()> {
        let kind = Self::recv_sink(policy);
        let nelems = payload.len() / self.type_size;
        let (off, len) = self.byte_range(kind, offset, nelems)?;
        let dst = &mut self.slice_mut(kind)[off..off + len];
        tport.memcopy(dst, payload);
        Ok(())
    }

    pub fn send_source(&self, policy: SendPolicy) -> BufferKind {
        match policy {
            SendPolicy::InPlace => BufferKind::Result,
            SendPolicy::TempSend if self.temp_send.is_some() => BufferKind::TempSend,
            SendPolicy::TempSend => BufferKind::Input,
            SendPolicy::PrevRecv => BufferKind::TempRecv,
        }
    }

    pub fn recv_sink(policy: RecvPolicy) -> BufferKind {
        match policy {
            RecvPolicy::InPlace => BufferKind::Result,
            RecvPolicy::TempRecv | RecvPolicy::PackedTempBuf | RecvPolicy::UnpackTempBuf => {
                BufferKind::TempRecv
            }
        }
    }

    /// Byte range of `[offset, offset + nelems)` elements in `kind`, bounds checked.
    pub fn byte_range(&self, kind: BufferKind, offset: usize, nelems: usize) -> Result<(usize, usize)> {
        let extent = self.extents().of(kind);
        if offset + nelems > extent {
            return Err(Error::BufferOverflow {
                buffer: kind.name(),
                offset,
                nelems,
                extent,
            });
        }
        Ok((offset * self.type_size, nelems * self.type_size))
    }

    fn slice(&self, kind: BufferKind) -> &[u8] {
        match kind {
            BufferKind::Input => self.input.unwrap_or(&[]),
            BufferKind::Result => &*self.result,
            BufferKind::TempSend => match (&self.arena, self.temp_send) {
                (Some(ws), Some(r)) => &ws.as_slice()[r.offset..r.offset + r.len],
                _ => &[],
            },
            BufferKind::TempRecv => match (&self.arena, self.temp_recv) {
                (Some(ws), Some(r)) => &ws.as_slice()[r.offset..r.offset + r.len],
                _ => &[],
            },
        }
    }

    fn slice_mut(&mut self, kind: BufferKind) -> &mut [u8] {
        let region = match kind {
            BufferKind::Result => return &mut *self.result,
            BufferKind::Input => None,
            BufferKind::TempSend => self.temp_send,
            BufferKind::TempRecv => self.temp_recv,
        };
        match (self.arena.as_mut(), region) {
            (Some(ws), Some(r)) => &mut ws.as_mut_slice()[r.offset..r.offset + r.len],
            _ => &mut [],
        }
    }

    pub fn views(&mut self) -> Views<'_> {
        let send_len = self.temp_send.map_or(0, |r| r.len);
        let recv_len = self.temp_recv.map_or(0, |r| r.len);
        let (temp_send, temp_recv): (&mut [u8], &mut [u8]) = match self.arena.as_mut() {
            Some(ws) => {
                let (s, r) = ws.as_mut_slice().split_at_mut(send_len);
                (s, &mut r[..recv_len])
            }
            None => (&mut [], &mut []),
        };
        Views {
            input: self.input,
            result: &mut *self.result,
            temp_send,
            temp_recv,
        }
    }

    /// A one-off full-size temporary, returned to the transport by [`free_temp`].
    ///
    /// [`free_temp`]: BufferManager::free_temp
    pub fn alloc_temp(&mut self, tport: &mut dyn Transport, nbytes: usize) -> Result<Workspace> {
        let ws = tport.allocate_workspace(nbytes)?;
        self.num_allocs += 1;
        trace!("rank {} allocated temporary {:?} of {} bytes", tport.rank(), ws.id(), nbytes);
        Ok(ws)
    }

    pub fn free_temp(&mut self, tport: &mut dyn Transport, ws: Workspace) {
        self.num_frees += 1;
        tport.free_workspace(ws);
    }

    /// Return the arena to the transport. Only the first call frees anything.
    pub fn release(&mut self, tport: &mut dyn Transport) {
        if self.released {
            return;
        }
        self.released = true;
        self.temp_send = None;
        self.temp_recv = None;
        if let Some(ws) = self.arena.take() {
            debug!("rank {} releasing workspace {:?}", tport.rank(), ws.id());
            self.num_frees += 1;
            tport.free_workspace(ws);
        }
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Endpoint;

    #[test]
    fn reserve_and_release_once() {
        let input = vec![1u8; 16];
        let mut result = vec![0u8; 16];
        let mut ep = Endpoint::new(0, 1);
        let mut bufs = BufferManager::new(Some(&input[..]), &mut result, 4);

        bufs.reserve(&mut ep, 2, 3).unwrap();
        assert_eq!(bufs.scratch_bytes(), 20);
        let ext = bufs.extents();
        assert_eq!((ext.input, ext.result, ext.temp_send, ext.temp_recv), (4, 4, 2, 3));
        assert!(bufs.reserve(&mut ep, 1, 1).is_err());

        bufs.release(&mut ep);
        bufs.release(&mut ep);
        assert_eq!((bufs.num_allocs(), bufs.num_frees()), (1, 1));
        assert_eq!(ep.workspace_stats(), (1, 1));
    }

    #[test]
    fn temp_send_falls_back_to_input() {
        let input = vec![7u8; 8];
        let mut result = vec![0u8; 8];
        let bufs = BufferManager::new(Some(&input[..]), &mut result, 2);
        assert_eq!(bufs.send_source(SendPolicy::TempSend), BufferKind::Input);
        assert_eq!(bufs.extents().temp_send, 4);
        assert_eq!(bufs.send_payload(SendPolicy::TempSend, 1, 2).unwrap(), vec![7u8; 4]);
    }

    #[test]
    fn out_of_bounds_is_buffer_overflow() {
        let mut result = vec![0u8; 8];
        let mut ep = Endpoint::new(0, 1);
        let mut bufs = BufferManager::new(None, &mut result, 4);
        assert!(matches!(
            bufs.send_payload(SendPolicy::InPlace, 1, 2),
            Err(Error::BufferOverflow { extent: 2, .. })
        ));
        assert!(bufs.land(&mut ep, RecvPolicy::TempRecv, 0, &[0u8; 4]).is_err());
        bufs.land(&mut ep, RecvPolicy::InPlace, 1, &[9u8; 4]).unwrap();
        assert_eq!(&bufs.views().result[4..], &[9u8; 4]);
    }
}
