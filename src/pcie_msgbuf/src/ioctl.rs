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

//! Ioctl Control Channel
//!
//! Control requests are round trips over the control submit ring: the
//! request names a host buffer holding its input, and the device answers
//! with an ACK and then a completion whose request id is the packet id of
//! one of the posted ioctl response buffers.
//!
//! Only one request is ever in flight. A round-trip lock serializes whole
//! requests, and [`IoctlChannel`] tracks the one that is outstanding so a
//! completion arriving after its waiter gave up is recognized as stray and
//! its buffer reclaimed instead of handed to the next request.

use core::cmp::min;

use log::{debug, error, warn};
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::bus::BusOps;
use crate::dma::{DmaOps, PacketBuf};
use crate::error::MsgbufError;
use crate::host::{Fault, FaultHandler, HostOps, Upcall, Upcalls};
use crate::pktid::{BufClass, PktIdError};
use crate::proto::{Msgbuf, State};
use crate::wire::{
    Addr64, CmnMsgHdr, IOCTL_REQ_PKTID, IoctlAck, IoctlCmplt, IoctlReq, MsgType, RingId,
};

/// Query of a named variable.
pub const WLC_GET_VAR: u32 = 262;
/// Variable answered locally with the last non-zero completion status.
const BCMERROR_VAR: &[u8] = b"bcmerror\0";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoctlError {
    #[error("Ioctl of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("Another ioctl is outstanding")]
    Busy,
    #[error("Ioctl {cmd:#x} timed out")]
    Timeout { cmd: u32 },
    #[error("Ioctl {cmd:#x} failed with device status {status}")]
    Status { cmd: u32, status: u16 },
    #[error("Link is down")]
    LinkDown,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    cmd: u32,
    trans_id: u16,
    acked: bool,
}

/// The device's answer to the outstanding request.
pub(crate) struct IoctlResponse<P> {
    pub status: u16,
    pub len: u16,
    pub pkt: P,
}

/// State of the single outstanding ioctl.
pub(crate) struct IoctlChannel<P> {
    outstanding: Option<Outstanding>,
    next_trans_id: u16,
    response: Option<IoctlResponse<P>>,
    last_error: u16,
}

impl<P> IoctlChannel<P> {
    pub(crate) fn new() -> Self {
        Self {
            outstanding: None,
            next_trans_id: 1,
            response: None,
            last_error: 0,
        }
    }

    /// Marks `cmd` outstanding and returns its transaction id.
    pub(crate) fn begin(&mut self, cmd: u32) -> Result<u16, IoctlError> {
        if let Some(o) = self.outstanding {
            error!(
                "ioctl {:#x} issued while {:#x} is pending",
                cmd, o.cmd
            );
            return Err(IoctlError::Busy);
        }
        let trans_id = self.next_trans_id;
        self.next_trans_id = self.next_trans_id.wrapping_add(1);
        self.outstanding = Some(Outstanding {
            cmd,
            trans_id,
            acked: false,
        });
        Ok(trans_id)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.outstanding.is_some()
    }

    pub(crate) fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Records an ACK. False if no request is outstanding.
    pub(crate) fn on_ack(&mut self, ack: &IoctlAck) -> bool {
        match self.outstanding.as_mut() {
            Some(o) => {
                if o.cmd != ack.cmd {
                    warn!("ioctl ack for {:#x}, outstanding {:#x}", ack.cmd, o.cmd);
                }
                o.acked = true;
                true
            }
            None => false,
        }
    }

    /// Hands a completion and its response buffer to the waiter. Only one
    /// request is ever outstanding, so the completion belongs to it whatever
    /// transaction id it carries. The buffer comes back if nobody is
    /// waiting.
    pub(crate) fn on_complete(&mut self, cmplt: &IoctlCmplt, pkt: P) -> Result<(), P> {
        match self.outstanding {
            Some(o) if self.response.is_none() => {
                if o.trans_id != cmplt.trans_id {
                    debug!(
                        "ioctl {:#x} completed with trans id {}, sent {}",
                        o.cmd, cmplt.trans_id, o.trans_id
                    );
                }
                if !o.acked {
                    debug!("ioctl {:#x} completed without an ack", o.cmd);
                }
                self.response = Some(IoctlResponse {
                    status: cmplt.compl.status,
                    len: cmplt.resp_len,
                    pkt,
                });
                Ok(())
            }
            _ => Err(pkt),
        }
    }

    pub(crate) fn take_response(&mut self) -> Option<IoctlResponse<P>> {
        self.response.take()
    }

    /// Ends the outstanding request. Returns the buffer of a response that
    /// arrived but was never taken.
    pub(crate) fn finish(&mut self) -> Option<P> {
        self.outstanding = None;
        self.response.take().map(|r| r.pkt)
    }

    pub(crate) fn record_error(&mut self, status: u16) {
        self.last_error = status;
    }

    pub(crate) fn last_error(&self) -> u16 {
        self.last_error
    }
}

/// Clears the outstanding request when a round trip ends, however it ends.
struct RoundTrip<'a, B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    proto: &'a Msgbuf<B, D, H>,
}

impl<B, D, H> Drop for RoundTrip<'_, B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    fn drop(&mut self) {
        let stale = self.proto.state.lock().ioctl.finish();
        if let Some(pkt) = stale {
            self.proto.dma.free_pkt(pkt);
        }
    }
}

impl<B, D, H> Msgbuf<B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    /// Issues a control request and waits for its completion.
    ///
    /// `buf` holds the request payload and receives the response, truncated
    /// to its length. Returns the number of response bytes copied, or
    /// [`IoctlError::Busy`] if another request is still outstanding.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn ioctl(
        &self,
        ifidx: u8,
        cmd: u32,
        set: bool,
        buf: &mut [u8],
    ) -> Result<usize, MsgbufError> {
        let max = self.cfg.ioctl_max_len();
        if buf.len() > max {
            return Err(IoctlError::TooLarge { len: buf.len(), max }.into());
        }
        if self.is_link_down() {
            return Err(IoctlError::LinkDown.into());
        }

        // A caller re-entering from an upcall delivered while the
        // outstanding request waits would spin on the lock forever.
        let _serialized = loop {
            if let Some(guard) = self.ioctl_lock.try_lock() {
                break guard;
            }
            if self.state.lock().ioctl.is_pending() {
                debug!("ioctl {:#x} rejected, another request is outstanding", cmd);
                return Err(IoctlError::Busy.into());
            }
            core::hint::spin_loop();
        };

        if !set && cmd == WLC_GET_VAR && buf.starts_with(BCMERROR_VAR) {
            let err = self.state.lock().ioctl.last_error() as i32;
            let n = min(buf.len(), 4);
            buf[..n].copy_from_slice(&err.to_le_bytes()[..n]);
            return Ok(n);
        }

        self.send_ioctl(ifidx, cmd, buf)?;
        let _round_trip = RoundTrip { proto: self };

        let budget = self.cfg.ctrl_budget();
        self.bus
            .wait_ioctl_response(self.cfg.ioctl_timeout(), &mut || {
                self.process_ctrl_completions(budget);
                self.is_link_down() || self.state.lock().ioctl.has_response()
            });

        let response = self.state.lock().ioctl.take_response();
        let Some(resp) = response else {
            if self.is_link_down() {
                return Err(IoctlError::LinkDown.into());
            }
            warn!("ioctl {:#x} timed out after {:?}", cmd, self.cfg.ioctl_timeout());
            return Err(IoctlError::Timeout { cmd }.into());
        };

        let n = min(min(buf.len(), resp.len as usize), resp.pkt.len());
        buf[..n].copy_from_slice(&resp.pkt.data()[..n]);
        self.dma.free_pkt(resp.pkt);

        if resp.status != 0 {
            self.state.lock().ioctl.record_error(resp.status);
            return Err(IoctlError::Status {
                cmd,
                status: resp.status,
            }
            .into());
        }
        Ok(n)
    }

    /// Last non-zero ioctl completion status.
    pub fn dongle_error(&self) -> u16 {
        self.state.lock().ioctl.last_error()
    }

    fn send_ioctl(&self, ifidx: u8, cmd: u32, buf: &[u8]) -> Result<(), MsgbufError> {
        let input_len = min(buf.len(), self.cfg.ioctl_max_input_len());
        let mut st = self.state.lock();
        let trans_id = st.ioctl.begin(cmd)?;

        let req = IoctlReq {
            cmn: CmnMsgHdr::new(MsgType::IoctlReq, ifidx, IOCTL_REQ_PKTID),
            cmd,
            output_buf_len: buf.len() as u16,
            trans_id,
            input_buf_len: input_len as u16,
            rsvd: 0,
            host_input_buf_addr: Addr64::from(self.ioctbuf.pa),
            rsvd2: [0; 3],
        };

        let sent = self
            .dma
            .write(self.ioctbuf.va, &buf[..input_len])
            .map_err(|_| MsgbufError::MemAccess)
            .and_then(|_| {
                self.dma.cache_flush(self.ioctbuf.va, input_len);
                self.submit_ctrl(&mut st, req)
            });
        if let Err(e) = sent {
            st.ioctl.finish();
            return Err(e);
        }
        debug!("ioctl {:#x} sent, trans_id {} len {}", cmd, trans_id, buf.len());
        Ok(())
    }

    /// ACKs carry the request's sentinel id; anything else is a device
    /// bug worth reporting but not worth halting for.
    pub(crate) fn on_ioctl_ack(
        &self,
        st: &mut State<D::Pkt>,
        ring: RingId,
        m: &IoctlAck,
        up: &mut Upcalls<D::Pkt>,
    ) {
        if m.cmn.request_id != IOCTL_REQ_PKTID {
            error!("ioctl ack with request id {:#x}", m.cmn.request_id);
            up.push(Upcall::Fault(Fault::BadPktId {
                ring,
                error: PktIdError::Invalid(m.cmn.request_id),
            }));
            return;
        }
        if m.compl.status != 0 {
            warn!("ioctl {:#x} acked with status {}", m.cmd, m.compl.status);
        }
        if !st.ioctl.on_ack(m) {
            debug!("ioctl ack for {:#x} with nothing outstanding", m.cmd);
        }
    }

    pub(crate) fn on_ioctl_cmplt(
        &self,
        st: &mut State<D::Pkt>,
        m: &IoctlCmplt,
        up: &mut Upcalls<D::Pkt>,
    ) -> Result<(), MsgbufError> {
        let r = st.pktids.release(m.cmn.request_id, BufClass::IoctlResp)?;
        self.dma.unmap(r.pa, r.len as usize, r.dir);
        st.ioctlresp_posted = st.ioctlresp_posted.saturating_sub(1);
        self.post_ctrl_bufs(st, BufClass::IoctlResp)?;

        match st.ioctl.on_complete(m, r.pkt) {
            Ok(()) => up.push(Upcall::WakeIoctlWaiter),
            Err(pkt) => {
                warn!(
                    "stray ioctl completion for {:#x}, trans_id {}",
                    m.cmd, m.trans_id
                );
                self.dma.free_pkt(pkt);
            }
        }
        Ok(())
    }
}
