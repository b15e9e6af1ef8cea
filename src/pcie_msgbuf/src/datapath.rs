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

//! Data path: receive buffer posting, transmit posting and the data and
//! event completions.
//!
//! Receive completions of one pass are grouped into chains of unicast IP
//! frames sharing interface, addresses and priority, so the host can hand
//! a burst upward in one call.

use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use core::fmt;

use log::{debug, error, trace, warn};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::bus::BusOps;
use crate::config::MsgbufConfig;
use crate::dma::{DmaDir, DmaOps, PacketBuf};
use crate::error::MsgbufError;
use crate::flowring::FlowRingTable;
use crate::host::{FaultHandler, HostOps, Upcall, Upcalls};
use crate::pktid::{BufClass, PktId, PoolExhausted};
use crate::proto::{Msgbuf, State};
use crate::ring::{MsgRing, RingError};
use crate::wire::{
    Addr64, CmnMsgHdr, CtrlBufPost, ETHER_ADDR_LEN, ETHER_HDR_LEN, ETHER_TYPE_IPV4,
    ETHER_TYPE_IPV6, MsgType, RxCmplt, RxPost, TxFlags, TxPost, TxStatus, WlEvent,
};

/// A frame [`Msgbuf::txdata`] did not accept, handed back with the reason.
pub struct TxRejected<P> {
    pub pkt: P,
    pub error: MsgbufError,
}

impl<P> fmt::Debug for TxRejected<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<P> From<TxRejected<P>> for MsgbufError {
    fn from(r: TxRejected<P>) -> Self {
        r.error
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChainKey {
    ifidx: u8,
    da: [u8; ETHER_ADDR_LEN],
    sa: [u8; ETHER_ADDR_LEN],
    prio: u8,
}

impl ChainKey {
    /// Key of a unicast IPv4 or IPv6 frame; other frames never chain.
    fn of(ifidx: u8, frame: &[u8]) -> Option<Self> {
        if frame.len() < ETHER_HDR_LEN + 2 {
            return None;
        }
        let mut da = [0u8; ETHER_ADDR_LEN];
        let mut sa = [0u8; ETHER_ADDR_LEN];
        da.copy_from_slice(&frame[..ETHER_ADDR_LEN]);
        sa.copy_from_slice(&frame[ETHER_ADDR_LEN..2 * ETHER_ADDR_LEN]);
        if da[0] & 1 != 0 {
            return None;
        }

        let ip = &frame[ETHER_HDR_LEN..];
        let tos = match u16::from_be_bytes([frame[12], frame[13]]) {
            ETHER_TYPE_IPV4 => ip[1],
            ETHER_TYPE_IPV6 => (ip[0] << 4) | (ip[1] >> 4),
            _ => return None,
        };
        Some(Self {
            ifidx,
            da,
            sa,
            prio: tos >> 5,
        })
    }
}

/// Upcalls and the receive chain of one completion pass.
pub(crate) struct Batch<P> {
    pub(crate) up: Upcalls<P>,
    chain_max: usize,
    key: Option<ChainKey>,
    chain: Vec<P>,
}

impl<P: PacketBuf> Batch<P> {
    pub(crate) fn new(cfg: &MsgbufConfig) -> Self {
        let chain_max = if cfg.rx_chaining() {
            cfg.rx_chain_max() as usize
        } else {
            1
        };
        Self {
            up: Upcalls::new(),
            chain_max,
            key: None,
            chain: Vec::new(),
        }
    }

    /// Queues a received frame for delivery.
    pub(crate) fn rx(&mut self, ifidx: u8, pkt: P) {
        let key = if self.chain_max > 1 {
            ChainKey::of(ifidx, pkt.data())
        } else {
            None
        };
        let Some(key) = key else {
            self.flush();
            self.up.push(Upcall::RxFrames {
                ifidx,
                frames: vec![pkt],
            });
            return;
        };

        if self.key != Some(key) {
            self.flush();
            self.key = Some(key);
        }
        self.chain.push(pkt);
        if self.chain.len() >= self.chain_max {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if let Some(key) = self.key.take()
            && !self.chain.is_empty()
        {
            self.up.push(Upcall::RxFrames {
                ifidx: key.ifidx,
                frames: core::mem::take(&mut self.chain),
            });
        }
    }

    pub(crate) fn finish(mut self) -> Upcalls<P> {
        self.flush();
        self.up
    }
}

/// The ring a frame for `flow_id` goes out on: the common tx ring in push
/// mode, otherwise the flow's own ring.
fn tx_ring<'s>(
    txpost: &'s mut Option<MsgRing>,
    flows: &'s mut FlowRingTable,
    flow_id: u16,
) -> Result<&'s mut MsgRing, MsgbufError> {
    match txpost {
        Some(ring) => Ok(ring),
        None => Ok(flows.active_ring_mut(flow_id)?),
    }
}

impl<B, D, H> Msgbuf<B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    /// Allocates, maps and parks one device-writable buffer of `len` bytes.
    /// `None` when any step runs out of resources.
    fn alloc_rx_buf(
        &self,
        st: &mut State<D::Pkt>,
        len: usize,
        class: BufClass,
    ) -> Option<(PktId, u64)> {
        let Some(pkt) = self.dma.alloc_pkt(len) else {
            trace!("{:?} buffer allocation failed", class);
            return None;
        };
        let Some(pa) = self.dma.map(&pkt, len, DmaDir::FromDevice) else {
            warn!("{:?} buffer mapping failed", class);
            self.dma.free_pkt(pkt);
            return None;
        };
        match st
            .pktids
            .alloc(pkt, pa, len as u32, DmaDir::FromDevice, class)
        {
            Ok(id) => Some((id, pa)),
            Err(PoolExhausted(pkt)) => {
                trace!("packet ids exhausted posting {:?} buffer", class);
                self.dma.unmap(pa, len, DmaDir::FromDevice);
                self.dma.free_pkt(pkt);
                None
            }
        }
    }

    /// Gives back a buffer [`alloc_rx_buf`](Self::alloc_rx_buf) parked
    /// but never posted.
    fn unpark(&self, st: &mut State<D::Pkt>, id: PktId, class: BufClass) {
        if let Ok(r) = st.pktids.release(id.raw(), class) {
            self.dma.unmap(r.pa, r.len as usize, r.dir);
            self.dma.free_pkt(r.pkt);
        }
    }

    /// Tops the rx post ring up to the device's limit, in bursts. Stops
    /// quietly when the ring, the pool or the allocator runs dry. Returns
    /// the number of buffers posted.
    pub(crate) fn post_rx_bufs(&self, st: &mut State<D::Pkt>) -> Result<u16, MsgbufError> {
        let io = self.io();
        let meta = st.rx_metadata_len as usize;
        let len = meta + self.cfg.rx_buf_size() as usize;
        let mut posted = 0u16;

        while st.rxbufpost < st.max_rxbufpost {
            let want = min(self.cfg.rx_buf_burst(), st.max_rxbufpost - st.rxbufpost);
            let Some(span) = io.reserve(&mut st.rxpost, want)? else {
                break;
            };

            let mut filled = 0u16;
            for idx in span.indices() {
                let Some((id, pa)) = self.alloc_rx_buf(st, len, BufClass::DataRx) else {
                    break;
                };
                let post = RxPost {
                    cmn: CmnMsgHdr::new(MsgType::RxBufPost, 0, id.raw()),
                    metadata_buf_len: meta as u16,
                    data_buf_len: self.cfg.rx_buf_size(),
                    rsvd: 0,
                    metadata_buf_addr: Addr64::from(if meta > 0 { pa } else { 0 }),
                    data_buf_addr: Addr64::from(pa + meta as u64),
                };
                if let Err(e) = io.write_slot(&st.rxpost, idx, post) {
                    self.unpark(st, id, BufClass::DataRx);
                    st.rxpost.unreserve(span.count - filled);
                    return Err(e);
                }
                filled += 1;
            }

            if filled < span.count {
                st.rxpost.unreserve(span.count - filled);
            }
            if filled == 0 {
                break;
            }
            io.commit(
                &st.rxpost,
                crate::ring::Span {
                    start: span.start,
                    count: filled,
                },
            )?;
            st.rxbufpost += filled;
            posted += filled;
            if filled < span.count {
                break;
            }
        }

        if posted > 0 {
            trace!("posted {} rx buffers, {} outstanding", posted, st.rxbufpost);
        }
        Ok(posted)
    }

    /// Tops up the event or ioctl response buffers, one control message
    /// each. Returns the number of buffers posted.
    pub(crate) fn post_ctrl_bufs(
        &self,
        st: &mut State<D::Pkt>,
        class: BufClass,
    ) -> Result<u16, MsgbufError> {
        let (msg_type, len, max) = match class {
            BufClass::Event => (
                MsgType::EventBufPost,
                self.cfg.rx_buf_size(),
                self.cfg.max_event_bufs(),
            ),
            BufClass::IoctlResp => (
                MsgType::IoctlRespBufPost,
                self.cfg.ioctl_resp_buf_size(),
                self.cfg.max_ioctlresp_bufs(),
            ),
            _ => return Ok(0),
        };
        let posted_of = |st: &State<D::Pkt>| match class {
            BufClass::Event => st.event_posted,
            _ => st.ioctlresp_posted,
        };

        let mut posted = 0u16;
        while posted_of(&*st) < max {
            let Some((id, pa)) = self.alloc_rx_buf(st, len as usize, class) else {
                break;
            };
            let msg = CtrlBufPost {
                cmn: CmnMsgHdr::new(msg_type, 0, id.raw()),
                host_buf_len: len,
                rsvd: [0; 3],
                host_buf_addr: Addr64::from(pa),
                rsvd2: [0; 4],
            };
            if let Err(e) = self.submit_ctrl(st, msg) {
                self.unpark(st, id, class);
                if e.is_backpressure() {
                    debug!("control ring full posting {:?} buffers", class);
                    break;
                }
                return Err(e);
            }
            match class {
                BufClass::Event => st.event_posted += 1,
                _ => st.ioctlresp_posted += 1,
            }
            posted += 1;
        }
        Ok(posted)
    }

    /// Queues one Ethernet frame for transmission on `flow_id` (ignored in
    /// push mode, where every frame uses the common tx ring).
    ///
    /// Frames are written to the ring at once but announced to the device
    /// in batches; see [`tx_flush`](Self::tx_flush). An accepted frame
    /// always comes back through [`HostOps::tx_complete`]. A refused one
    /// comes back in the error, untouched.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn txdata(&self, pkt: D::Pkt, ifidx: u8, flow_id: u16) -> Result<(), TxRejected<D::Pkt>> {
        if self.is_link_down() {
            return Err(TxRejected {
                pkt,
                error: MsgbufError::LinkDown,
            });
        }
        if pkt.len() < ETHER_HDR_LEN {
            let len = pkt.len();
            return Err(TxRejected {
                pkt,
                error: MsgbufError::ShortFrame { len },
            });
        }

        let mut up = Upcalls::new();
        let res = {
            let mut st = self.state.lock();
            self.txdata_locked(&mut st, pkt, ifidx, flow_id, &mut up)
        };
        self.deliver(up);
        res
    }

    fn txdata_locked(
        &self,
        st: &mut State<D::Pkt>,
        mut pkt: D::Pkt,
        ifidx: u8,
        flow_id: u16,
        up: &mut Upcalls<D::Pkt>,
    ) -> Result<(), TxRejected<D::Pkt>> {
        let State {
            txpost,
            flows,
            pktids,
            tx_metadata_len,
            tx_in_flight,
            tx_stopped,
            ..
        } = st;
        let io = self.io();

        let ring = match tx_ring(txpost, flows, flow_id) {
            Ok(ring) => ring,
            Err(error) => return Err(TxRejected { pkt, error }),
        };
        let idx = match io.reserve(ring, 1) {
            Ok(Some(span)) => span.start,
            Ok(None) => {
                return Err(TxRejected {
                    pkt,
                    error: RingError::NoSpace.into(),
                });
            }
            Err(error) => return Err(TxRejected { pkt, error }),
        };

        let mut txhdr = [0u8; ETHER_HDR_LEN];
        txhdr.copy_from_slice(&pkt.data()[..ETHER_HDR_LEN]);
        let prio = pkt.priority();
        pkt.pull(ETHER_HDR_LEN);
        let data_len = pkt.len();

        let mut meta = *tx_metadata_len as usize;
        if meta > pkt.headroom() {
            trace!(
                "tx frame has {} bytes of headroom, sending without {} bytes of metadata",
                pkt.headroom(),
                meta
            );
            meta = 0;
        }
        let meta = if meta > 0 && pkt.push(meta) { meta } else { 0 };
        let total = meta + data_len;
        let Some(pa) = self.dma.map(&pkt, total, DmaDir::ToDevice) else {
            pkt.pull(meta);
            pkt.push(ETHER_HDR_LEN);
            ring.unreserve(1);
            return Err(TxRejected {
                pkt,
                error: MsgbufError::NoResource("tx mapping"),
            });
        };
        pkt.pull(meta);

        let id = match pktids.alloc(pkt, pa, total as u32, DmaDir::ToDevice, BufClass::DataTx) {
            Ok(id) => id,
            Err(PoolExhausted(mut pkt)) => {
                self.dma.unmap(pa, total, DmaDir::ToDevice);
                pkt.push(ETHER_HDR_LEN);
                ring.unreserve(1);
                return Err(TxRejected {
                    pkt,
                    error: MsgbufError::NoResource("packet ids"),
                });
            }
        };

        let post = TxPost {
            cmn: CmnMsgHdr::new(MsgType::TxPost, ifidx, id.raw()),
            txhdr,
            flags: TxFlags::ethernet(prio).bits(),
            seg_cnt: 1,
            metadata_buf_addr: Addr64::from(if meta > 0 { pa } else { 0 }),
            data_buf_addr: Addr64::from(pa + meta as u64),
            metadata_buf_len: meta as u16,
            data_len: data_len as u16,
            rsvd: 0,
        };
        if let Err(e) = io.write_slot(ring, idx, post) {
            // the frame is ours now; hand it back as failed
            error!("{} ring slot {}: {}", ring.name(), idx, e);
            ring.unreserve(1);
            if let Ok(r) = pktids.release(id.raw(), BufClass::DataTx) {
                self.dma.unmap(r.pa, r.len as usize, r.dir);
                let mut pkt = r.pkt;
                pkt.push(ETHER_HDR_LEN);
                up.push(Upcall::TxComplete {
                    pkt,
                    success: false,
                });
            }
            return Ok(());
        }

        ring.add_pending(idx);
        if ring.pending() >= self.cfg.txp_threshold() || idx == ring.max_items() - 1 {
            if let Some(span) = ring.take_pending()
                && let Err(e) = io.commit(ring, span)
            {
                error!("{} ring commit: {}", ring.name(), e);
            }
        }

        *tx_in_flight += 1;
        if !*tx_stopped && *tx_in_flight >= self.cfg.tx_stop_threshold() {
            debug!("{} frames in flight, stopping tx", tx_in_flight);
            *tx_stopped = true;
            up.push(Upcall::FlowControl { stop: true });
        }
        Ok(())
    }

    /// Announces every transmit written to the ring of `flow_id` (or the
    /// common tx ring in push mode) but not yet committed.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn tx_flush(&self, flow_id: u16) -> Result<(), MsgbufError> {
        let mut st = self.state.lock();
        let io = self.io();
        if let Some(ring) = st.txpost.as_mut() {
            if let Some(span) = ring.take_pending() {
                io.commit(ring, span)?;
            }
            return Ok(());
        }
        st.flows.get(flow_id)?;
        self.commit_pending(&io, &mut st, flow_id)
    }

    pub(crate) fn on_tx_status(
        &self,
        st: &mut State<D::Pkt>,
        m: &TxStatus,
        batch: &mut Batch<D::Pkt>,
    ) -> Result<(), MsgbufError> {
        let r = st.pktids.release(m.cmn.request_id, BufClass::DataTx)?;
        self.dma.unmap(r.pa, r.len as usize, r.dir);

        match st.tx_in_flight.checked_sub(1) {
            Some(n) => st.tx_in_flight = n,
            None => warn!("tx completion with nothing in flight"),
        }
        if st.tx_stopped && st.tx_in_flight <= self.cfg.tx_start_threshold() {
            debug!("{} frames in flight, resuming tx", st.tx_in_flight);
            st.tx_stopped = false;
            batch.up.push(Upcall::FlowControl { stop: false });
        }

        let success = m.compl.status == 0;
        if !success {
            debug!(
                "tx {} failed with status {}",
                m.cmn.request_id, m.compl.status
            );
        }
        let mut pkt = r.pkt;
        pkt.push(ETHER_HDR_LEN);
        batch.up.push(Upcall::TxComplete { pkt, success });
        Ok(())
    }

    pub(crate) fn on_rx_cmplt(
        &self,
        st: &mut State<D::Pkt>,
        m: &RxCmplt,
        batch: &mut Batch<D::Pkt>,
    ) -> Result<(), MsgbufError> {
        let r = st.pktids.release(m.cmn.request_id, BufClass::DataRx)?;
        self.dma.unmap(r.pa, r.len as usize, r.dir);
        st.rxbufpost = st.rxbufpost.saturating_sub(1);

        let offset = match m.data_offset {
            0 => st.rx_dataoffset,
            n => n,
        };
        let mut pkt = r.pkt;
        let skip = st.rx_metadata_len as usize + offset as usize;
        if pkt.pull(skip) && pkt.len() >= m.data_len as usize {
            pkt.set_len(m.data_len as usize);
            batch.rx(m.cmn.if_id, pkt);
        } else {
            warn!(
                "rx {}: {} bytes at offset {} overrun the buffer",
                m.cmn.request_id, m.data_len, skip
            );
            self.dma.free_pkt(pkt);
        }

        if st.max_rxbufpost - st.rxbufpost >= self.cfg.rxbufpost_threshold() {
            self.post_rx_bufs(st)?;
        }
        Ok(())
    }

    pub(crate) fn on_event(
        &self,
        st: &mut State<D::Pkt>,
        m: &WlEvent,
        batch: &mut Batch<D::Pkt>,
    ) -> Result<(), MsgbufError> {
        let r = st.pktids.release(m.cmn.request_id, BufClass::Event)?;
        self.dma.unmap(r.pa, r.len as usize, r.dir);
        st.event_posted = st.event_posted.saturating_sub(1);

        let mut pkt = r.pkt;
        if pkt.pull(st.rx_dataoffset as usize) && pkt.len() >= m.event_data_len as usize {
            pkt.set_len(m.event_data_len as usize);
            batch.rx(m.cmn.if_id, pkt);
        } else {
            warn!("event of {} bytes overruns its buffer", m.event_data_len);
            self.dma.free_pkt(pkt);
        }

        self.post_ctrl_bufs(st, BufClass::Event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;

    use super::*;
    use crate::ErrorKind;
    use crate::bus::SharedField;
    use crate::flowring::tests::FLOW;
    use crate::proto::tests::active_flow;
    use crate::testutil::{
        Harness, PKT_HEADROOM, TestBus, TestDma, TestHost, TestPkt, harness, harness_with,
        ipv4_frame, small_config,
    };
    use crate::wire::{RingId, SharedFlags};

    const DA: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const SA: [u8; 6] = [0x02, 0, 0, 0, 0, 2];

    fn ipv6_frame(tclass: u8, body: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&DA);
        f.extend_from_slice(&SA);
        f.extend_from_slice(&ETHER_TYPE_IPV6.to_be_bytes());
        f.push(0x60 | (tclass >> 4));
        f.push(tclass << 4);
        f.extend_from_slice(&[0u8; 38]);
        f.extend_from_slice(body);
        f
    }

    fn send(h: &Harness, frame: &[u8]) {
        h.proto.txdata(h.dma.pkt_from(frame), 0, FLOW).unwrap();
    }

    #[test]
    fn chain_keys() {
        let f = ipv4_frame(DA, SA, 0xa0, b"x");
        let k = ChainKey::of(1, &f).unwrap();
        assert_eq!(k.prio, 5);
        assert_eq!(k.ifidx, 1);

        assert_eq!(ChainKey::of(0, &ipv6_frame(0xe0, b"y")).unwrap().prio, 7);

        // multicast, non-IP and runt frames do not chain
        let mut mcast = ipv4_frame(DA, SA, 0, b"x");
        mcast[0] = 0x01;
        assert!(ChainKey::of(0, &mcast).is_none());
        let mut arp = ipv4_frame(DA, SA, 0, b"x");
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert!(ChainKey::of(0, &arp).is_none());
        assert!(ChainKey::of(0, &f[..ETHER_HDR_LEN]).is_none());
    }

    #[test]
    fn batch_chains_matching_frames() {
        let dma = TestDma::new(1 << 16);
        let mut cfg = small_config();
        cfg.set_rx_chaining(true, 3);
        let mut batch = Batch::<TestPkt>::new(&cfg);

        for _ in 0..4 {
            batch.rx(0, dma.pkt_from(&ipv4_frame(DA, SA, 0, b"a")));
        }
        batch.rx(0, dma.pkt_from(&ipv4_frame(DA, SA, 0xe0, b"b")));
        let mut bcast = ipv4_frame(DA, SA, 0, b"c");
        bcast[..6].fill(0xff);
        batch.rx(0, dma.pkt_from(&bcast));

        let sizes: Vec<usize> = batch
            .finish()
            .into_iter()
            .map(|u| match u {
                Upcall::RxFrames { frames, .. } => frames.len(),
                _ => panic!("unexpected upcall"),
            })
            .collect();
        // full chain, leftover, new priority, broadcast alone
        assert_eq!(sizes, [3, 1, 1, 1]);
    }

    #[test]
    fn chaining_can_be_disabled() {
        let h = {
            let mut cfg = small_config();
            cfg.set_rx_chaining(false, 0);
            harness_with(SharedFlags::D2H_SYNC_SEQNUM, cfg, false)
        };
        for _ in 0..3 {
            h.bus.complete_rx(0, &ipv4_frame(DA, SA, 0, b"data"), 0);
        }
        h.proto.process_rx_completions(16);
        assert_eq!(h.host.rx.borrow().len(), 3);
    }

    #[test]
    fn rx_frames_are_delivered_and_buffers_replenished() {
        let h = harness();
        let f1 = ipv4_frame(DA, SA, 0, b"first");
        let f2 = ipv4_frame(DA, SA, 0, b"second");
        h.bus.complete_rx(3, &f1, 0);
        h.bus.complete_rx(3, &f2, 0);

        assert!(!h.proto.process_rx_completions(16));
        assert_eq!(*h.host.rx.borrow(), [(3, vec![f1, f2])]);

        // two slots free reaches the threshold
        assert_eq!(h.proto.stats().rxbufpost, 8);
        h.bus.pump();
        assert_eq!(h.bus.rx_bufs_posted(), 8);
        assert_eq!(h.dma.live_mappings(), 12);
    }

    #[test]
    fn rx_below_threshold_is_not_replenished() {
        let h = harness();
        h.bus.complete_rx(0, &ipv4_frame(DA, SA, 0, b"one"), 0);
        h.proto.process_rx_completions(16);
        assert_eq!(h.proto.stats().rxbufpost, 7);
    }

    #[test]
    fn rx_honours_offsets_and_metadata() {
        let dma = TestDma::new(4 << 20);
        let bus = Rc::new(TestBus::new(dma.mem(), SharedFlags::D2H_SYNC_SEQNUM));
        let host = Rc::new(TestHost::default());
        let proto = Msgbuf::attach(bus.clone(), dma.clone(), host.clone(), small_config()).unwrap();
        proto.set_metadata_lens(16, 0);
        proto.set_rx_dataoffset(2);
        proto.init().unwrap();
        bus.pump();

        let post = bus.rx_bufs()[0];
        assert_eq!(post.metadata_buf_len, 16);
        assert_eq!(
            u64::from(post.data_buf_addr),
            u64::from(post.metadata_buf_addr) + 16
        );
        assert_eq!(post.data_buf_len, 256);

        let frame = ipv4_frame(DA, SA, 0, b"offset");
        bus.complete_rx(0, &frame, 6);
        // no offset in the completion: the configured one applies
        let mut padded = vec![0u8; 2];
        padded.extend_from_slice(&frame);
        bus.complete_rx(0, &padded, 0);
        proto.process_rx_completions(16);
        assert_eq!(host.frames().len(), 2);
        assert_eq!(host.frames()[0], frame);
        assert_eq!(&host.frames()[1][..frame.len()], &frame[..]);
    }

    #[test]
    fn rx_replenish_survives_allocation_failure() {
        let h = harness();
        h.dma.fail_alloc_pkt(true);
        for _ in 0..3 {
            h.bus.complete_rx(0, &ipv4_frame(DA, SA, 0, b"x"), 0);
        }
        h.proto.process_rx_completions(16);
        assert_eq!(h.proto.stats().rxbufpost, 5);
        assert!(!h.proto.is_link_down());

        h.dma.fail_alloc_pkt(false);
        h.bus.complete_rx(0, &ipv4_frame(DA, SA, 0, b"y"), 0);
        h.proto.process_rx_completions(16);
        assert_eq!(h.proto.stats().rxbufpost, 8);
        assert_eq!(h.host.frames().len(), 4);
    }

    #[test]
    fn xor_checksum_mode_receives() {
        let h = harness_with(SharedFlags::D2H_SYNC_XORCSUM, small_config(), false);
        for i in 0..12u8 {
            h.bus.complete_rx(0, &ipv4_frame(DA, SA, 0, &[i]), 0);
            h.proto.process_rx_completions(16);
            h.bus.pump();
        }
        assert_eq!(h.host.frames().len(), 12);
        assert_eq!(h.proto.stats().sync.livelocks, 0);
    }

    #[test]
    fn events_reach_the_host_and_are_reposted() {
        let h = harness();
        h.bus.send_event(1, b"event payload");
        h.proto.process_ctrl_completions(16);
        assert_eq!(*h.host.rx.borrow(), [(1, vec![b"event payload".to_vec()])]);
        h.bus.pump();
        assert_eq!(h.bus.event_bufs_posted(), 2);
        assert_eq!(h.proto.stats().event_bufs_posted, 2);
    }

    #[test]
    fn tx_posts_are_batched() {
        let h = harness();
        active_flow(&h);
        let frames: Vec<Vec<u8>> = (0..5u8).map(|i| ipv4_frame(DA, SA, 0, &[i; 10])).collect();

        for f in &frames[..3] {
            send(&h, f);
        }
        h.bus.pump();
        assert!(h.bus.take_tx_posts().is_empty());

        send(&h, &frames[3]);
        h.bus.pump();
        let posts = h.bus.take_tx_posts();
        assert_eq!(posts.len(), 4);
        let flow_ring = RingId::for_flow(FLOW).unwrap();
        assert_eq!(h.bus.doorbells().last(), Some(&(flow_ring, 4)));

        let p = posts[0];
        assert_eq!(p.txhdr[..], frames[0][..ETHER_HDR_LEN]);
        assert_eq!(p.data_len as usize, frames[0].len() - ETHER_HDR_LEN);
        assert_eq!(p.seg_cnt, 1);
        assert_eq!(u64::from(p.metadata_buf_addr), 0);
        assert_eq!(
            TxFlags::from_bits_truncate(p.flags),
            TxFlags::FRAME_802_3
        );

        // a flush announces a partial batch
        send(&h, &frames[4]);
        h.proto.tx_flush(FLOW).unwrap();
        h.bus.pump();
        assert_eq!(h.bus.take_tx_posts().len(), 1);
    }

    #[test]
    fn tx_completions_return_frames() {
        let h = harness();
        active_flow(&h);
        let mut pkt = h.dma.pkt_from(&ipv4_frame(DA, SA, 0, b"ok"));
        pkt.set_priority(6);
        h.proto.txdata(pkt, 0, FLOW).unwrap();
        send(&h, &ipv4_frame(DA, SA, 0, b"fails"));
        h.proto.tx_flush(FLOW).unwrap();
        h.bus.pump();

        let post = h.bus.complete_tx(0);
        assert_eq!(TxFlags::from_bits_truncate(post.flags).priority(), 6);
        h.bus.complete_tx(9);
        assert!(!h.proto.process_tx_completions(16));

        assert_eq!(
            *h.host.tx_done.borrow(),
            [
                (ipv4_frame(DA, SA, 0, b"ok"), true),
                (ipv4_frame(DA, SA, 0, b"fails"), false)
            ]
        );
        assert_eq!(h.proto.stats().tx_in_flight, 0);
        assert_eq!(h.dma.live_mappings(), 12);
    }

    #[test]
    fn tx_metadata_is_pushed_in_front() {
        let h = harness();
        active_flow(&h);
        h.proto.set_metadata_lens(0, 8);
        let frame = ipv4_frame(DA, SA, 0, b"meta");
        send(&h, &frame);
        h.proto.tx_flush(FLOW).unwrap();
        h.bus.pump();

        let p = h.bus.take_tx_posts()[0];
        assert_eq!(p.metadata_buf_len, 8);
        assert_eq!(
            u64::from(p.data_buf_addr),
            u64::from(p.metadata_buf_addr) + 8
        );
        assert_eq!(p.data_len as usize, frame.len() - ETHER_HDR_LEN);
    }

    #[test]
    fn tx_metadata_needs_headroom() {
        let h = harness();
        active_flow(&h);
        // more than the frame's headroom once the Ethernet header is pulled
        h.proto.set_metadata_lens(0, (PKT_HEADROOM + ETHER_HDR_LEN + 1) as u16);
        let frame = ipv4_frame(DA, SA, 0, b"no room");
        send(&h, &frame);
        h.proto.tx_flush(FLOW).unwrap();
        h.bus.pump();

        let p = h.bus.take_tx_posts()[0];
        assert_eq!(p.metadata_buf_len, 0);
        assert_eq!(u64::from(p.metadata_buf_addr), 0);
        assert_eq!(p.data_len as usize, frame.len() - ETHER_HDR_LEN);
    }

    #[test]
    fn tx_flow_control_stops_and_resumes() {
        let mut cfg = small_config();
        cfg.set_tx_flow_thresholds(3, 1).unwrap();
        let h = harness_with(SharedFlags::D2H_SYNC_SEQNUM, cfg, false);
        active_flow(&h);

        for i in 0..3u8 {
            send(&h, &ipv4_frame(DA, SA, 0, &[i]));
        }
        assert_eq!(*h.host.flow_control.borrow(), [true]);
        h.proto.tx_flush(FLOW).unwrap();
        h.bus.pump();

        h.bus.complete_tx(0);
        h.proto.process_tx_completions(16);
        assert_eq!(*h.host.flow_control.borrow(), [true]);
        h.bus.complete_tx(0);
        h.proto.process_tx_completions(16);
        assert_eq!(*h.host.flow_control.borrow(), [true, false]);
    }

    #[test]
    fn refused_frames_come_back_untouched() {
        let h = harness();
        let frame = ipv4_frame(DA, SA, 0, b"nowhere");

        // no active flow
        let r = h.proto.txdata(h.dma.pkt_from(&frame), 0, FLOW).unwrap_err();
        assert!(matches!(r.error, MsgbufError::FlowRing(_)));
        assert_eq!(r.pkt.data(), &frame[..]);

        active_flow(&h);
        h.dma.fail_map(true);
        let r = h.proto.txdata(h.dma.pkt_from(&frame), 0, FLOW).unwrap_err();
        assert!(r.error.is_backpressure());
        assert_eq!(r.pkt.data(), &frame[..]);
        h.dma.fail_map(false);

        let r = h.proto.txdata(h.dma.pkt_from(&frame[..10]), 0, FLOW).unwrap_err();
        assert_eq!(r.error.kind(), ErrorKind::InvalidInput);

        // nothing reached the ring
        h.proto.tx_flush(FLOW).unwrap();
        h.bus.pump();
        assert!(h.bus.take_tx_posts().is_empty());
        assert_eq!(h.proto.stats().tx_in_flight, 0);
    }

    #[test]
    fn tx_pool_exhaustion_is_backpressure() {
        let mut cfg = small_config();
        cfg.set_max_pktids(13);
        let h = harness_with(SharedFlags::D2H_SYNC_SEQNUM, cfg, false);
        active_flow(&h);
        // 12 ids hold rx, event and ioctl buffers
        send(&h, &ipv4_frame(DA, SA, 0, b"last id"));
        let r = h
            .proto
            .txdata(h.dma.pkt_from(&ipv4_frame(DA, SA, 0, b"none left")), 0, FLOW)
            .unwrap_err();
        assert_eq!(r.error.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(h.dma.live_mappings(), 13);
    }

    #[test]
    fn push_mode_uses_the_common_ring() {
        let h = harness_with(SharedFlags::D2H_SYNC_SEQNUM, small_config(), true);
        assert_ne!(
            h.bus.shared(SharedField::RingBase(RingId::TXPOST_SUBMIT)),
            0
        );
        for i in 0..4u8 {
            h.proto
                .txdata(h.dma.pkt_from(&ipv4_frame(DA, SA, 0, &[i])), 0, 77)
                .unwrap();
        }
        h.bus.pump();
        assert_eq!(h.bus.take_tx_posts().len(), 4);
        assert_eq!(
            h.bus.doorbells().last(),
            Some(&(RingId::TXPOST_SUBMIT, 4))
        );
        // no flow rings in push mode
        assert!(h.proto.create_flow_ring(FLOW, crate::flowring::tests::info(), 0).is_err());
    }
}
