/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Loopback DMA test.
//!
//! The device copies a host buffer filled with a known pattern into a
//! second host buffer; the host checks the copy when the completion
//! arrives. Exercises both DMA directions without a network.

use log::{debug, error, warn};
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::bus::BusOps;
use crate::dma::{DmaOps, DmaRegion, RegionGuard};
use crate::error::MsgbufError;
use crate::host::{FaultHandler, HostOps};
use crate::proto::{Msgbuf, State};
use crate::wire::{
    Addr64, CmnMsgHdr, DMAXFER_MAX_LEN, DMAXFER_REQ_ID, DmaXferReq, MsgType, StatusCmplt,
};

/// Extra bytes of destination buffer the device may write past the copy.
const DST_SLACK: usize = 8;
const CHUNK: usize = 256;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaXferError {
    #[error("A loopback transfer is already running")]
    Busy,
    #[error("Loopback transfer of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: u32, max: u32 },
    #[error("Loopback transfer of zero bytes")]
    Empty,
}

/// A transfer the device has not completed yet.
#[derive(Debug)]
pub(crate) struct DmaXfer {
    src: DmaRegion,
    dst: DmaRegion,
    len: u32,
}

/// Outcome of the last finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaXferResult {
    pub len: u32,
    /// Device completion status.
    pub status: u16,
    /// The destination holds the source pattern.
    pub matched: bool,
}

/// Byte `i` of the source buffer.
fn pattern() -> [u8; CHUNK] {
    core::array::from_fn(|i| i as u8)
}

impl<B, D, H> Msgbuf<B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    /// Starts a loopback transfer of `len` bytes. The device waits
    /// `src_delay` and `dst_delay` (in its own units) around the copy.
    /// Check [`dmaxfer_result`](Self::dmaxfer_result) once the control
    /// ring has delivered the completion.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn dmaxfer(&self, len: u32, src_delay: u32, dst_delay: u32) -> Result<(), MsgbufError> {
        if len == 0 {
            return Err(DmaXferError::Empty.into());
        }
        if len > DMAXFER_MAX_LEN {
            return Err(DmaXferError::TooLong {
                len,
                max: DMAXFER_MAX_LEN,
            }
            .into());
        }
        if self.is_link_down() {
            return Err(MsgbufError::LinkDown);
        }
        if self.state.lock().dmaxfer.is_some() {
            return Err(DmaXferError::Busy.into());
        }

        let n = len as usize;
        let src = RegionGuard::alloc(&self.dma, n, 8)
            .ok_or(MsgbufError::NoResource("loopback source buffer"))?;
        let dst = RegionGuard::alloc(&self.dma, n + DST_SLACK, 8)
            .ok_or(MsgbufError::NoResource("loopback destination buffer"))?;

        let src_region = src.region();
        let pat = pattern();
        for off in (0..n).step_by(CHUNK) {
            let end = core::cmp::min(n, off + CHUNK);
            self.dma
                .write(src_region.va + off as u64, &pat[..end - off])
                .map_err(|_| MsgbufError::MemAccess)?;
        }
        self.dma.cache_flush(src_region.va, n);

        let mut st = self.state.lock();
        if st.dmaxfer.is_some() {
            return Err(DmaXferError::Busy.into());
        }
        let req = DmaXferReq {
            cmn: CmnMsgHdr::new(MsgType::LpbkDmaxfer, 0, DMAXFER_REQ_ID),
            host_input_buf_addr: Addr64::from(src_region.pa),
            host_output_buf_addr: Addr64::from(dst.region().pa),
            xfer_len: len,
            src_delay,
            dest_delay: dst_delay,
            rsvd: 0,
        };
        self.submit_ctrl(&mut st, req)?;

        st.dmaxfer_result = None;
        st.dmaxfer = Some(DmaXfer {
            src: src.dismiss(),
            dst: dst.dismiss(),
            len,
        });
        debug!("loopback transfer of {} bytes started", len);
        Ok(())
    }

    /// Result of the last completed loopback transfer.
    pub fn dmaxfer_result(&self) -> Option<DmaXferResult> {
        self.state.lock().dmaxfer_result
    }

    pub(crate) fn on_dmaxfer_cmplt(
        &self,
        st: &mut State<D::Pkt>,
        m: &StatusCmplt,
    ) -> Result<(), MsgbufError> {
        let Some(x) = st.dmaxfer.take() else {
            warn!("loopback completion with no transfer running");
            return Ok(());
        };

        self.dma.cache_invalidate(x.dst.va, x.len as usize);
        let matched = self.dmaxfer_matches(&x);
        self.dma.free_coherent(x.src);
        self.dma.free_coherent(x.dst);
        let matched = matched?;

        let status = m.compl.status;
        if status != 0 || !matched {
            error!(
                "loopback transfer of {} bytes: status {}, data {}",
                x.len,
                status,
                if matched { "intact" } else { "corrupted" }
            );
        } else {
            debug!("loopback transfer of {} bytes verified", x.len);
        }
        st.dmaxfer_result = Some(DmaXferResult {
            len: x.len,
            status,
            matched,
        });
        Ok(())
    }

    fn dmaxfer_matches(&self, x: &DmaXfer) -> Result<bool, MsgbufError> {
        let n = x.len as usize;
        let pat = pattern();
        let mut buf = [0u8; CHUNK];
        for off in (0..n).step_by(CHUNK) {
            let chunk = &mut buf[..core::cmp::min(CHUNK, n - off)];
            self.dma
                .read(x.dst.va + off as u64, chunk)
                .map_err(|_| MsgbufError::MemAccess)?;
            if chunk[..] != pat[..chunk.len()] {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Frees the buffers of an unfinished transfer.
    pub(crate) fn dmaxfer_free(&self, st: &mut State<D::Pkt>) {
        if let Some(x) = st.dmaxfer.take() {
            debug!("dropping unfinished loopback transfer of {} bytes", x.len);
            self.dma.free_coherent(x.src);
            self.dma.free_coherent(x.dst);
        }
    }
}
