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

//! The protocol object.
//!
//! [`Msgbuf`] owns the six system rings, the flow ring table, the packet-id
//! map and the control channel, and drives them through the collaborator
//! traits. All ring and pool state sits behind one general lock. Whole
//! ioctl round trips are serialized by a second lock that is taken first
//! and may be held across the wait for the response; the general lock is
//! never held across a wait.
//!
//! Upward calls ([`HostOps`], [`FaultHandler`], waking the ioctl waiter)
//! are collected while the general lock is held and made after it is
//! released, so collaborators are free to call back into the protocol.
//!
//! A protocol fault on a completion ring halts processing: the link is
//! marked down, the fault is reported and every entry point becomes a
//! no-op until the next [`Msgbuf::init`].

use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicBool, Ordering};

use bytemuck::Pod;
use log::{debug, error, trace, warn};
use spin::Mutex;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::bus::{BusOps, IndexKind, SharedField};
use crate::config::{MsgbufConfig, RingGeometry};
use crate::datapath::Batch;
use crate::dispatch::{D2hMsg, DispatchError};
use crate::dma::{DmaOps, DmaRegion, PacketBuf, RegionGuard};
use crate::dmaxfer::{DmaXfer, DmaXferResult};
use crate::error::MsgbufError;
use crate::flowring::{
    CreateOutcome, DeleteOutcome, FlowInfo, FlowRingError, FlowRingState, FlowRingTable,
};
use crate::host::{Fault, FaultHandler, FlowRingEvent, HostOps, Upcall, Upcalls};
use crate::index::{IndexStore, RingIo};
use crate::ioctl::IoctlChannel;
use crate::pktid::{BufClass, PktIdMap};
use crate::ring::{MsgRing, RingError};
use crate::sync::{D2hSync, SyncStats, Synced};
use crate::wire::{
    Addr64, CmnMsgHdr, D2H_SCRATCH_LEN, ETHER_HDR_LEN, FlowRingCreateReq, FlowRingCtlReq,
    IOCTL_REQ_BUF_LEN, MsgType, RingId, RxCmplt, StatusCmplt,
};

/// Alignment of every coherent region the protocol allocates.
const REGION_ALIGN: usize = 8;
/// Largest D2H message; slots are read into a buffer of this size.
const MAX_D2H_MSG: usize = RxCmplt::SIZE;

/// One of the three completion rings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum D2hRing {
    Ctrl,
    Tx,
    Rx,
}

impl D2hRing {
    fn id(self) -> RingId {
        match self {
            D2hRing::Ctrl => RingId::CTRL_COMPLETE,
            D2hRing::Tx => RingId::TX_COMPLETE,
            D2hRing::Rx => RingId::RX_COMPLETE,
        }
    }
}

/// Everything behind the general lock.
pub(crate) struct State<P> {
    pub(crate) ctrl_submit: MsgRing,
    pub(crate) rxpost: MsgRing,
    /// Common tx post ring, only in push mode.
    pub(crate) txpost: Option<MsgRing>,
    pub(crate) ctrl_complete: MsgRing,
    pub(crate) tx_complete: MsgRing,
    pub(crate) rx_complete: MsgRing,
    pub(crate) flows: FlowRingTable,
    pub(crate) pktids: PktIdMap<P>,
    pub(crate) sync_stats: SyncStats,
    /// Rx buffers the device wants posted.
    pub(crate) max_rxbufpost: u16,
    pub(crate) rxbufpost: u16,
    pub(crate) event_posted: u16,
    pub(crate) ioctlresp_posted: u16,
    pub(crate) tx_in_flight: u32,
    /// The upper layer was told to stop transmitting.
    pub(crate) tx_stopped: bool,
    pub(crate) ioctl: IoctlChannel<P>,
    pub(crate) dmaxfer: Option<DmaXfer>,
    pub(crate) dmaxfer_result: Option<DmaXferResult>,
    pub(crate) rx_metadata_len: u16,
    pub(crate) tx_metadata_len: u16,
    pub(crate) rx_dataoffset: u16,
}

impl<P> State<P> {
    fn d2h_mut(&mut self, which: D2hRing) -> &mut MsgRing {
        match which {
            D2hRing::Ctrl => &mut self.ctrl_complete,
            D2hRing::Tx => &mut self.tx_complete,
            D2hRing::Rx => &mut self.rx_complete,
        }
    }

    fn d2h_parts(&mut self, which: D2hRing) -> (&mut MsgRing, &mut SyncStats) {
        let ring = match which {
            D2hRing::Ctrl => &mut self.ctrl_complete,
            D2hRing::Tx => &mut self.tx_complete,
            D2hRing::Rx => &mut self.rx_complete,
        };
        (ring, &mut self.sync_stats)
    }

    fn system_rings(&self) -> impl Iterator<Item = &MsgRing> {
        [
            &self.ctrl_submit,
            &self.rxpost,
            &self.ctrl_complete,
            &self.tx_complete,
            &self.rx_complete,
        ]
        .into_iter()
        .chain(self.txpost.as_ref())
    }

    fn system_rings_mut(&mut self) -> impl Iterator<Item = &mut MsgRing> {
        [
            &mut self.ctrl_submit,
            &mut self.rxpost,
            &mut self.ctrl_complete,
            &mut self.tx_complete,
            &mut self.rx_complete,
        ]
        .into_iter()
        .chain(self.txpost.as_mut())
    }
}

/// Read and write index of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub id: RingId,
    pub name: &'static str,
    pub rd: u16,
    pub wr: u16,
}

/// A snapshot of the protocol's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolStats {
    /// System rings, then the rings of every flow that has one.
    pub rings: Vec<RingStats>,
    pub rxbufpost: u16,
    pub max_rxbufpost: u16,
    pub event_bufs_posted: u16,
    pub ioctlresp_bufs_posted: u16,
    pub tx_in_flight: u32,
    pub pktids_free: usize,
    pub pktid_audit_failures: u32,
    pub sync: SyncStats,
    /// Last non-zero ioctl completion status.
    pub dongle_error: u16,
    pub link_down: bool,
}

/// Host side of the message-buffer protocol.
pub struct Msgbuf<B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    pub(crate) bus: B,
    pub(crate) dma: D,
    host: H,
    pub(crate) cfg: MsgbufConfig,
    sync: D2hSync,
    indices: IndexStore,
    /// Input buffer of ioctl requests.
    pub(crate) ioctbuf: DmaRegion,
    scratch: DmaRegion,
    link_down: AtomicBool,
    /// Serializes ioctl round trips. Taken before `state`.
    pub(crate) ioctl_lock: Mutex<()>,
    pub(crate) state: Mutex<State<D::Pkt>>,
}

fn alloc_ring<'a, D: DmaOps>(
    dma: &'a D,
    geom: RingGeometry,
    what: &'static str,
) -> Result<RegionGuard<'a, D>, MsgbufError> {
    RegionGuard::alloc(dma, geom.size(), REGION_ALIGN).ok_or(MsgbufError::NoResource(what))
}

impl<B, D, H> Msgbuf<B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    /// Allocates rings, buffers and the packet-id pool and picks the D2H
    /// sync strategy from the device's shared flags. Nothing is visible to
    /// the device until [`Msgbuf::init`]; the link stays down until then.
    ///
    /// On failure everything allocated so far is freed.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn attach(bus: B, dma: D, host: H, cfg: MsgbufConfig) -> Result<Self, MsgbufError> {
        let layout = cfg.rings();
        layout.validate()?;

        let flags = bus.shared_flags();
        let sync = D2hSync::from_flags(flags);
        let push_mode = bus.tx_push_mode();
        let max_flows = if push_mode { 0 } else { cfg.max_flow_rings() };

        let ctrl_submit_mem = alloc_ring(&dma, layout.ctrl_submit, "control submit ring")?;
        let rxpost_mem = alloc_ring(&dma, layout.rxpost, "rx post ring")?;
        let ctrl_complete_mem = alloc_ring(&dma, layout.ctrl_complete, "control complete ring")?;
        let tx_complete_mem = alloc_ring(&dma, layout.tx_complete, "tx complete ring")?;
        let rx_complete_mem = alloc_ring(&dma, layout.rx_complete, "rx complete ring")?;
        let txpost_mem = if push_mode {
            Some(alloc_ring(&dma, layout.txpost, "tx post ring")?)
        } else {
            None
        };
        let ioctbuf = RegionGuard::alloc(&dma, IOCTL_REQ_BUF_LEN, REGION_ALIGN)
            .ok_or(MsgbufError::NoResource("ioctl buffer"))?;
        let scratch = RegionGuard::alloc(&dma, D2H_SCRATCH_LEN, REGION_ALIGN)
            .ok_or(MsgbufError::NoResource("scratch buffer"))?;

        let ring = |id, name, mem: &RegionGuard<'_, D>, geom: RingGeometry| {
            MsgRing::new(id, name, mem.region(), geom.max_items, geom.item_len)
        };
        let ctrl_submit = ring(
            RingId::CTRL_SUBMIT,
            "ctrl_submit",
            &ctrl_submit_mem,
            layout.ctrl_submit,
        )?;
        let rxpost = ring(RingId::RXPOST_SUBMIT, "rxpost", &rxpost_mem, layout.rxpost)?;
        let ctrl_complete = ring(
            RingId::CTRL_COMPLETE,
            "ctrl_cpl",
            &ctrl_complete_mem,
            layout.ctrl_complete,
        )?;
        let tx_complete =
            ring(RingId::TX_COMPLETE, "tx_cpl", &tx_complete_mem, layout.tx_complete)?;
        let rx_complete =
            ring(RingId::RX_COMPLETE, "rx_cpl", &rx_complete_mem, layout.rx_complete)?;
        let txpost = match &txpost_mem {
            Some(mem) => Some(ring(RingId::TXPOST_SUBMIT, "txpost", mem, layout.txpost)?),
            None => None,
        };

        let h2d_rings = (RingId::H2D_COMMON + core::cmp::max(max_flows, 1)) as usize;
        let indices = IndexStore::attach(&dma, flags, cfg.use_dma_indices(), h2d_rings)?;

        // nothing below can fail
        for guard in [
            ctrl_submit_mem,
            rxpost_mem,
            ctrl_complete_mem,
            tx_complete_mem,
            rx_complete_mem,
        ] {
            guard.dismiss();
        }
        txpost_mem.map(RegionGuard::dismiss);
        let ioctbuf = ioctbuf.dismiss();
        let scratch = scratch.dismiss();

        debug!(
            "attached: sync {:?}, index mode {:?}, push mode {}, {} flow rings",
            sync,
            indices.mode(),
            push_mode,
            max_flows
        );

        Ok(Self {
            bus,
            dma,
            host,
            cfg,
            sync,
            indices,
            ioctbuf,
            scratch,
            link_down: AtomicBool::new(true),
            ioctl_lock: Mutex::new(()),
            state: Mutex::new(State {
                ctrl_submit,
                rxpost,
                txpost,
                ctrl_complete,
                tx_complete,
                rx_complete,
                flows: FlowRingTable::new(max_flows),
                pktids: PktIdMap::new(cfg.max_pktids()),
                sync_stats: SyncStats::default(),
                max_rxbufpost: cfg.max_rxbufpost(),
                rxbufpost: 0,
                event_posted: 0,
                ioctlresp_posted: 0,
                tx_in_flight: 0,
                tx_stopped: false,
                ioctl: IoctlChannel::new(),
                dmaxfer: None,
                dmaxfer_result: None,
                rx_metadata_len: 0,
                tx_metadata_len: 0,
                rx_dataoffset: 0,
            }),
        })
    }

    /// Resets all protocol state, tells the device where the rings live,
    /// brings the link up and posts the initial rx, ioctl response and
    /// event buffers.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn init(&self) -> Result<(), MsgbufError> {
        let mut up = Upcalls::new();
        let res = {
            let mut st = self.state.lock();
            self.clear_locked(&mut st, &mut up)
                .and_then(|_| self.init_locked(&mut st))
        };
        self.deliver(up);
        res
    }

    fn init_locked(&self, st: &mut State<D::Pkt>) -> Result<(), MsgbufError> {
        let advertised = self.bus.read_shared(SharedField::MaxHostRxBufs);
        let ring_cap = st.rxpost.max_items() - 1;
        st.max_rxbufpost = match advertised {
            0 => min(self.cfg.max_rxbufpost(), ring_cap),
            n => min(n, ring_cap as u32) as u16,
        };

        let io = self.io();
        for ring in st.system_rings() {
            io.announce(ring);
        }
        self.indices.publish_arrays(&self.bus);
        for ring in st.system_rings() {
            if ring.id().is_d2h() {
                io.publish_read_index(ring)?;
            } else {
                io.publish_write_index(ring)?;
            }
        }
        self.bus
            .write_shared(SharedField::ScratchBufAddr, self.scratch.pa);
        self.bus
            .write_shared(SharedField::ScratchBufLen, self.scratch.len as u64);

        self.link_down.store(false, Ordering::Release);
        debug!("link up, posting up to {} rx buffers", st.max_rxbufpost);

        self.post_rx_bufs(st)?;
        self.post_ctrl_bufs(st, BufClass::IoctlResp)?;
        self.post_ctrl_bufs(st, BufClass::Event)?;
        Ok(())
    }

    /// Zeroes every ring and counter without freeing the system rings,
    /// tears down every flow ring and force-frees every packet id.
    /// Outstanding transmits come back through
    /// [`HostOps::tx_complete`] as failed.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn clear(&self) -> Result<(), MsgbufError> {
        let mut up = Upcalls::new();
        let res = {
            let mut st = self.state.lock();
            self.clear_locked(&mut st, &mut up)
        };
        self.deliver(up);
        res
    }

    fn clear_locked(
        &self,
        st: &mut State<D::Pkt>,
        up: &mut Upcalls<D::Pkt>,
    ) -> Result<(), MsgbufError> {
        for ring in st.flows.drain() {
            self.dma.free_coherent(ring.region());
        }

        let released = st.pktids.drain();
        if !released.is_empty() {
            debug!("clear: reclaiming {} buffers", released.len());
        }
        for r in released {
            self.dma.unmap(r.pa, r.len as usize, r.dir);
            match r.class {
                BufClass::DataTx => {
                    let mut pkt = r.pkt;
                    pkt.push(ETHER_HDR_LEN);
                    up.push(Upcall::TxComplete {
                        pkt,
                        success: false,
                    });
                }
                _ => self.dma.free_pkt(r.pkt),
            }
        }
        if let Some(pkt) = st.ioctl.finish() {
            self.dma.free_pkt(pkt);
        }
        self.dmaxfer_free(st);

        st.rxbufpost = 0;
        st.event_posted = 0;
        st.ioctlresp_posted = 0;
        st.tx_in_flight = 0;
        if st.tx_stopped {
            st.tx_stopped = false;
            up.push(Upcall::FlowControl { stop: false });
        }
        st.sync_stats = SyncStats::default();

        let io = self.io();
        for ring in st.system_rings_mut() {
            io.clear(ring)?;
        }
        self.indices.clear(&self.dma)
    }

    pub fn is_link_down(&self) -> bool {
        self.link_down.load(Ordering::Acquire)
    }

    /// Marks the link down (or up again). While down, completion
    /// processing stops and new requests are refused; a blocked ioctl is
    /// woken so it can give up.
    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::Release);
        if down {
            warn!("link down");
            self.bus.wake_ioctl_waiter();
        }
    }

    /// Metadata bytes reserved in front of rx buffers and pushed in front
    /// of tx frames, in that order.
    pub fn metadata_lens(&self) -> (u16, u16) {
        let st = self.state.lock();
        (st.rx_metadata_len, st.tx_metadata_len)
    }

    /// Takes effect for buffers posted from now on.
    pub fn set_metadata_lens(&self, rx: u16, tx: u16) {
        let mut st = self.state.lock();
        st.rx_metadata_len = rx;
        st.tx_metadata_len = tx;
    }

    pub fn rx_dataoffset(&self) -> u16 {
        self.state.lock().rx_dataoffset
    }

    /// Offset of the frame within rx and event buffers whose completion
    /// does not carry one.
    pub fn set_rx_dataoffset(&self, offset: u16) {
        self.state.lock().rx_dataoffset = offset;
    }

    pub fn stats(&self) -> ProtocolStats {
        let st = self.state.lock();
        let ring_stats = |r: &MsgRing| RingStats {
            id: r.id(),
            name: r.name(),
            rd: r.rd(),
            wr: r.wr(),
        };
        let mut rings: Vec<RingStats> = st.system_rings().map(ring_stats).collect();
        rings.extend(st.flows.nodes().filter_map(|n| n.ring()).map(ring_stats));

        ProtocolStats {
            rings,
            rxbufpost: st.rxbufpost,
            max_rxbufpost: st.max_rxbufpost,
            event_bufs_posted: st.event_posted,
            ioctlresp_bufs_posted: st.ioctlresp_posted,
            tx_in_flight: st.tx_in_flight,
            pktids_free: st.pktids.avail(),
            pktid_audit_failures: st.pktids.audit_failures(),
            sync: st.sync_stats,
            dongle_error: st.ioctl.last_error(),
            link_down: self.is_link_down(),
        }
    }

    pub(crate) fn io(&self) -> RingIo<'_, D, B> {
        RingIo {
            mem: &self.dma,
            bus: &self.bus,
            idx: &self.indices,
        }
    }

    /// Writes one message to the control submit ring and commits it.
    pub(crate) fn submit_ctrl<T: Pod>(
        &self,
        st: &mut State<D::Pkt>,
        msg: T,
    ) -> Result<(), MsgbufError> {
        let io = self.io();
        let span = io
            .reserve(&mut st.ctrl_submit, 1)?
            .ok_or(RingError::NoSpace)?;
        if let Err(e) = io.write_slot(&st.ctrl_submit, span.start, msg) {
            st.ctrl_submit.unreserve(span.count);
            return Err(e);
        }
        io.commit(&st.ctrl_submit, span)
    }

    /// Makes upward calls recorded under the lock.
    pub(crate) fn deliver(&self, up: Upcalls<D::Pkt>) {
        for call in up {
            match call {
                Upcall::RxFrames { ifidx, frames } => self.host.rx_frames(ifidx, frames),
                Upcall::TxComplete { pkt, success } => self.host.tx_complete(pkt, success),
                Upcall::FlowRing { flow_id, event } => self.host.flow_ring_event(flow_id, event),
                Upcall::FlowControl { stop } => self.host.tx_flow_control(stop),
                Upcall::Fault(fault) => self.host.fault(fault),
                Upcall::WakeIoctlWaiter => self.bus.wake_ioctl_waiter(),
            }
        }
    }

    // --- completion processing ----------------------------------------

    /// Services the control completion ring: ioctl acks and completions,
    /// events, flow ring responses, status messages.
    ///
    /// At most `bound` messages are handled. Returns true if more are
    /// waiting.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn process_ctrl_completions(&self, bound: u32) -> bool {
        self.process(D2hRing::Ctrl, bound)
    }

    /// Services the tx completion ring. See
    /// [`process_ctrl_completions`](Self::process_ctrl_completions).
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn process_tx_completions(&self, bound: u32) -> bool {
        self.process(D2hRing::Tx, bound)
    }

    /// Services the rx completion ring. See
    /// [`process_ctrl_completions`](Self::process_ctrl_completions).
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn process_rx_completions(&self, bound: u32) -> bool {
        self.process(D2hRing::Rx, bound)
    }

    fn process(&self, which: D2hRing, bound: u32) -> bool {
        if self.is_link_down() {
            return false;
        }

        let mut batch = Batch::new(&self.cfg);
        let more = {
            let mut st = self.state.lock();
            match self.drain(&mut st, which, bound, &mut batch) {
                Ok(more) => more,
                Err(e) => {
                    self.halt(which.id(), e, &mut batch.up);
                    false
                }
            }
        };
        self.deliver(batch.finish());
        more && !self.is_link_down()
    }

    fn drain(
        &self,
        st: &mut State<D::Pkt>,
        which: D2hRing,
        bound: u32,
        batch: &mut Batch<D::Pkt>,
    ) -> Result<bool, MsgbufError> {
        let io = self.io();
        let mut budget = bound;

        while let Some(span) = io.consume(st.d2h_mut(which))? {
            for idx in span.indices() {
                if budget == 0 {
                    let ring = st.d2h_mut(which);
                    ring.set_read_index(idx);
                    io.publish_read_index(ring)?;
                    return Ok(true);
                }
                budget -= 1;

                let msg = self.read_d2h(st, which, idx, &mut batch.up)?;
                if which == D2hRing::Rx {
                    let ring = st.d2h_mut(which);
                    io.publish_read_index_at(ring, (idx + 1) % ring.max_items())?;
                }
                self.handle(st, which.id(), msg, batch)?;
            }
            io.publish_read_index(st.d2h_mut(which))?;
        }
        Ok(false)
    }

    /// Syncs and decodes slot `idx`. A livelocked slot is reported, zeroed
    /// and skipped.
    fn read_d2h(
        &self,
        st: &mut State<D::Pkt>,
        which: D2hRing,
        idx: u16,
        up: &mut Upcalls<D::Pkt>,
    ) -> Result<D2hMsg, MsgbufError> {
        let params = self.cfg.sync();
        let (ring, stats) = st.d2h_parts(which);
        let synced = self
            .sync
            .sync(&self.dma, ring, idx, &params, stats, |us| self.bus.delay_us(us))?;

        let addr = ring.slot_addr(idx);
        if let Synced::Livelock { expected, tries } = synced {
            up.push(Upcall::Fault(Fault::Livelock {
                ring: ring.id(),
                expected,
                tries,
            }));
            self.dma
                .zero(addr, ring.item_len() as usize)
                .map_err(|_| MsgbufError::MemAccess)?;
        }

        let mut slot = [0u8; MAX_D2H_MSG];
        let len = min(ring.item_len() as usize, slot.len());
        self.dma
            .read(addr, &mut slot[..len])
            .map_err(|_| MsgbufError::MemAccess)?;
        let raw = synced.msg_type();
        if let Ok(t) = MsgType::try_from(raw)
            && !t.is_d2h()
        {
            warn!("{} ring slot {}: host request type {:?} skipped", ring.name(), idx, t);
        }
        Ok(D2hMsg::decode(raw, &slot[..len])?)
    }

    fn handle(
        &self,
        st: &mut State<D::Pkt>,
        ring: RingId,
        msg: D2hMsg,
        batch: &mut Batch<D::Pkt>,
    ) -> Result<(), MsgbufError> {
        match msg {
            D2hMsg::Noop => {}
            D2hMsg::GenStatus(m) => {
                if m.compl.status != 0 {
                    warn!(
                        "general status {} on flow ring {}",
                        m.compl.status, m.compl.flow_ring_id
                    );
                }
            }
            D2hMsg::RingStatus(m) => {
                warn!(
                    "ring status {} for ring {}, device write index {}",
                    m.compl.status, m.compl.flow_ring_id, m.write_idx
                );
            }
            D2hMsg::FlowRingCreated(m) => self.on_flow_created(st, &m, &mut batch.up),
            D2hMsg::FlowRingDeleted(m) => self.on_flow_deleted(st, &m, &mut batch.up),
            D2hMsg::FlowRingFlushed(m) => self.on_flow_flushed(st, &m, &mut batch.up),
            D2hMsg::IoctlAck(m) => self.on_ioctl_ack(st, ring, &m, &mut batch.up),
            D2hMsg::IoctlCmplt(m) => self.on_ioctl_cmplt(st, &m, &mut batch.up)?,
            D2hMsg::Event(m) => self.on_event(st, &m, batch)?,
            D2hMsg::TxStatus(m) => self.on_tx_status(st, &m, batch)?,
            D2hMsg::RxCmplt(m) => self.on_rx_cmplt(st, &m, batch)?,
            D2hMsg::DmaXferCmplt(m) => self.on_dmaxfer_cmplt(st, &m)?,
        }
        Ok(())
    }

    /// Stops processing after a fault on `ring`.
    fn halt(&self, ring: RingId, err: MsgbufError, up: &mut Upcalls<D::Pkt>) {
        error!("{:?} halted: {}", ring, err);
        let fault = match err {
            MsgbufError::Ring(RingError::Desync {
                rd, wr, max_items, ..
            }) => Some(Fault::RingDesync {
                ring,
                rd,
                wr,
                max_items,
            }),
            MsgbufError::Ring(RingError::BadIndex { value, .. }) => {
                Some(Fault::BadIndex { ring, value })
            }
            MsgbufError::PktId(error) => Some(Fault::BadPktId { ring, error }),
            MsgbufError::Dispatch(DispatchError::UnknownType(msg_type))
            | MsgbufError::Dispatch(DispatchError::Truncated { msg_type, .. }) => {
                Some(Fault::BadMsgType { ring, msg_type })
            }
            _ => None,
        };
        self.link_down.store(true, Ordering::Release);
        up.push(Upcall::WakeIoctlWaiter);
        if let Some(fault) = fault {
            up.push(Upcall::Fault(fault));
        }
    }

    // --- flow rings -----------------------------------------------------

    /// Allocates a ring for `flow_id` and asks the device to create it.
    /// The flow becomes usable once the device confirms, reported through
    /// [`HostOps::flow_ring_event`].
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn create_flow_ring(
        &self,
        flow_id: u16,
        info: FlowInfo,
        priority: u8,
    ) -> Result<(), MsgbufError> {
        if self.is_link_down() {
            return Err(MsgbufError::LinkDown);
        }
        self.state.lock().flows.check_create(flow_id)?;

        let geom = self.cfg.rings().txpost;
        let id = RingId::for_flow(flow_id).ok_or(FlowRingError::UnknownFlow(flow_id))?;
        let mem = alloc_ring(&self.dma, geom, "flow ring")?;
        let mut ring = MsgRing::new(id, "flow", mem.region(), geom.max_items, geom.item_len)?;

        let mut st = self.state.lock();
        let io = self.io();
        io.clear(&mut ring)?;
        io.publish_write_index(&ring)?;
        self.indices
            .write(&self.dma, &self.bus, IndexKind::H2dRead, id, 0)?;

        let req = FlowRingCreateReq {
            cmn: CmnMsgHdr::new(MsgType::FlowRingCreate, info.ifidx, 0),
            da: info.da,
            sa: info.sa,
            tid: info.tid,
            if_flags: 0,
            flow_ring_id: flow_id,
            tc: info.tid,
            priority,
            int_vector: 0,
            max_items: ring.max_items(),
            len_item: ring.item_len(),
            flow_ring_addr: Addr64::from(ring.region().pa),
        };
        if let Err((e, _ring)) = st.flows.begin_create(flow_id, info, ring) {
            return Err(e.into());
        }
        if let Err(e) = self.submit_ctrl(&mut st, req) {
            st.flows.abort_create(flow_id);
            return Err(e);
        }
        mem.dismiss();
        debug!("flow {}: create requested on ring {:?}", flow_id, id);
        Ok(())
    }

    /// Asks the device to delete an active flow ring. Pending transmits
    /// are committed first.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn delete_flow_ring(&self, flow_id: u16, reason: u16) -> Result<(), MsgbufError> {
        self.flow_ctl(flow_id, MsgType::FlowRingDelete, reason)
    }

    /// Asks the device to drain an active flow ring without destroying it.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn flush_flow_ring(&self, flow_id: u16) -> Result<(), MsgbufError> {
        self.flow_ctl(flow_id, MsgType::FlowRingFlush, 0)
    }

    fn flow_ctl(&self, flow_id: u16, msg_type: MsgType, reason: u16) -> Result<(), MsgbufError> {
        if self.is_link_down() {
            return Err(MsgbufError::LinkDown);
        }
        let mut st = self.state.lock();
        let delete = msg_type == MsgType::FlowRingDelete;
        if delete {
            st.flows.begin_delete(flow_id)?;
        } else {
            st.flows.begin_flush(flow_id)?;
        }
        let ifidx = st.flows.get(flow_id)?.info().ifidx;

        let io = self.io();
        let committed = self.commit_pending(&io, &mut st, flow_id);
        let req = FlowRingCtlReq {
            cmn: CmnMsgHdr::new(msg_type, ifidx, 0),
            flow_ring_id: flow_id,
            reason,
            rsvd: [0; 7],
        };
        let sent = committed.and_then(|_| self.submit_ctrl(&mut st, req));
        if let Err(e) = sent {
            if delete {
                st.flows.abort_delete(flow_id);
            } else {
                st.flows.abort_flush(flow_id);
            }
            return Err(e);
        }
        debug!("flow {}: {:?} requested", flow_id, msg_type);
        Ok(())
    }

    /// Commits the pending transmits of a flow's ring, whatever its state.
    pub(crate) fn commit_pending(
        &self,
        io: &RingIo<'_, D, B>,
        st: &mut State<D::Pkt>,
        flow_id: u16,
    ) -> Result<(), MsgbufError> {
        let Some(id) = RingId::for_flow(flow_id) else {
            return Ok(());
        };
        if let Some(ring) = st.flows.rings_mut().find(|r| r.id() == id)
            && let Some(span) = ring.take_pending()
        {
            io.commit(ring, span)?;
        }
        Ok(())
    }

    pub fn flow_ring_state(&self, flow_id: u16) -> Result<FlowRingState, MsgbufError> {
        Ok(self.state.lock().flows.state(flow_id)?)
    }

    fn on_flow_created(&self, st: &mut State<D::Pkt>, m: &StatusCmplt, up: &mut Upcalls<D::Pkt>) {
        let flow_id = m.compl.flow_ring_id;
        let status = m.compl.status;
        let event = match st.flows.on_create_response(flow_id, status) {
            Ok(CreateOutcome::Active) => FlowRingEvent::Active,
            Ok(CreateOutcome::Failed(ring)) => {
                warn!("flow {}: create failed with status {}", flow_id, status);
                self.dma.free_coherent(ring.region());
                FlowRingEvent::CreateFailed { status }
            }
            Err(e) => {
                error!("flow ring create response: {}", e);
                return;
            }
        };
        up.push(Upcall::FlowRing { flow_id, event });
    }

    fn on_flow_deleted(&self, st: &mut State<D::Pkt>, m: &StatusCmplt, up: &mut Upcalls<D::Pkt>) {
        let flow_id = m.compl.flow_ring_id;
        let status = m.compl.status;
        let event = match st.flows.on_delete_response(flow_id, status) {
            Ok(DeleteOutcome::Deleted(ring)) => {
                self.dma.free_coherent(ring.region());
                FlowRingEvent::Deleted
            }
            Ok(DeleteOutcome::Refused) => {
                warn!("flow {}: delete refused with status {}", flow_id, status);
                FlowRingEvent::DeleteFailed { status }
            }
            Err(e) => {
                error!("flow ring delete response: {}", e);
                return;
            }
        };
        up.push(Upcall::FlowRing { flow_id, event });
    }

    fn on_flow_flushed(&self, st: &mut State<D::Pkt>, m: &StatusCmplt, up: &mut Upcalls<D::Pkt>) {
        let flow_id = m.compl.flow_ring_id;
        let status = m.compl.status;
        if let Err(e) = st.flows.on_flush_response(flow_id) {
            error!("flow ring flush response: {}", e);
            return;
        }
        trace!("flow {}: flushed, status {}", flow_id, status);
        up.push(Upcall::FlowRing {
            flow_id,
            event: FlowRingEvent::Flushed { status },
        });
    }
}

impl<B, D, H> Drop for Msgbuf<B, D, H>
where
    B: BusOps,
    D: DmaOps,
    H: HostOps<D::Pkt> + FaultHandler,
{
    fn drop(&mut self) {
        let mut up = Upcalls::new();
        let regions: Vec<DmaRegion> = {
            let mut st = self.state.lock();
            if let Err(e) = self.clear_locked(&mut st, &mut up) {
                warn!("teardown: {}", e);
            }
            st.system_rings().map(MsgRing::region).collect()
        };
        for region in regions {
            self.dma.free_coherent(region);
        }
        self.dma.free_coherent(self.ioctbuf);
        self.dma.free_coherent(self.scratch);
        self.indices.release(&self.dma);
        self.deliver(up);
    }
}
