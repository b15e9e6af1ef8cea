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

//! Fake platform for unit tests.
//!
//! [`TestMem`] is a flat byte arena whose addresses are real pointers, so
//! packet buffers and ring memory can be touched both through [`MemOps`]
//! and through slices. [`TestDma`] allocates out of it, [`TestBus`] plays
//! the device and [`TestHost`] records everything delivered upward.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::{Rc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{Ordering, fence};
use core::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::access::MemOps;
use crate::bus::{BusOps, IndexKind, SharedField};
use crate::config::MsgbufConfig;
use crate::dma::{DmaDir, DmaOps, DmaRegion, PacketBuf};
use crate::error::MsgbufError;
use crate::host::{Fault, FaultHandler, FlowRingEvent, HostOps};
use crate::proto::Msgbuf;
use crate::wire::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutOfBounds(pub u64);

/// Byte arena addressed by real pointers.
pub(crate) struct TestMem {
    /// Owns the bytes; only ever reached through `base_ptr`.
    _storage: UnsafeCell<Vec<u8>>,
    base_ptr: *mut u8,
    base_addr: u64,
    len: usize,
    next: Cell<u64>,
    /// Freed blocks, reused for allocations of the same size.
    free: RefCell<Vec<(u64, usize)>>,
}

impl TestMem {
    pub(crate) fn new(size: usize) -> Self {
        let mut storage = vec![0u8; size];
        let base_ptr = storage.as_mut_ptr();
        Self {
            _storage: UnsafeCell::new(storage),
            base_ptr,
            base_addr: base_ptr as u64,
            len: size,
            next: Cell::new(base_ptr as u64),
            free: RefCell::new(Vec::new()),
        }
    }

    fn ptr_for(&self, addr: u64, len: usize) -> Result<*mut u8, OutOfBounds> {
        let end = addr.checked_add(len as u64).ok_or(OutOfBounds(addr))?;
        if addr < self.base_addr || end > self.base_addr + self.len as u64 {
            return Err(OutOfBounds(addr));
        }
        Ok(self.base_ptr.wrapping_add((addr - self.base_addr) as usize))
    }

    /// Zeroed block of `len` bytes aligned to `align`.
    pub(crate) fn alloc(&self, len: usize, align: usize) -> Option<u64> {
        let reuse = {
            let mut free = self.free.borrow_mut();
            let pos = free
                .iter()
                .position(|&(a, l)| l == len && a.is_multiple_of(align as u64));
            pos.map(|i| free.swap_remove(i).0)
        };
        let addr = match reuse {
            Some(addr) => addr,
            None => {
                let align = align.max(1) as u64;
                let addr = self.next.get().div_ceil(align) * align;
                if addr + len as u64 > self.base_addr + self.len as u64 {
                    return None;
                }
                self.next.set(addr + len as u64);
                addr
            }
        };
        self.zero(addr, len).ok()?;
        Some(addr)
    }

    pub(crate) fn release(&self, addr: u64, len: usize) {
        self.free.borrow_mut().push((addr, len));
    }

    /// # Safety
    ///
    /// No mutable slice of the same bytes may be alive.
    pub(crate) unsafe fn slice(&self, addr: u64, len: usize) -> &[u8] {
        match self.ptr_for(addr, len) {
            // SAFETY: in bounds; aliasing is up to the caller
            Ok(p) => unsafe { core::slice::from_raw_parts(p, len) },
            Err(_) => &[],
        }
    }

    /// # Safety
    ///
    /// No other slice of the same bytes may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, addr: u64, len: usize) -> &mut [u8] {
        match self.ptr_for(addr, len) {
            // SAFETY: in bounds; aliasing is up to the caller
            Ok(p) => unsafe { core::slice::from_raw_parts_mut(p, len) },
            Err(_) => &mut [],
        }
    }

    fn zero(&self, addr: u64, len: usize) -> Result<(), OutOfBounds> {
        let p = self.ptr_for(addr, len)?;
        // SAFETY: in bounds
        unsafe { ptr::write_bytes(p, 0, len) };
        Ok(())
    }
}

impl MemOps for Rc<TestMem> {
    type Error = OutOfBounds;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let src = self.ptr_for(addr, dst.len())?;
        // SAFETY: in bounds, dst is a distinct allocation
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let dst = self.ptr_for(addr, src.len())?;
        // SAFETY: in bounds; src may alias only through a slice the test
        // obtained itself, and copy tolerates that
        unsafe { ptr::copy(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u32, Self::Error> {
        let p = self.ptr_for(addr, 4)?;
        // SAFETY: in bounds
        let val = unsafe { ptr::read_unaligned(p.cast::<u32>()) };
        fence(Ordering::Acquire);
        Ok(val)
    }

    fn store_release(&self, addr: u64, val: u32) -> Result<(), Self::Error> {
        let p = self.ptr_for(addr, 4)?;
        fence(Ordering::Release);
        // SAFETY: in bounds
        unsafe { ptr::write_unaligned(p.cast::<u32>(), val) };
        Ok(())
    }
}

/// Packet buffer living in a [`TestMem`].
pub(crate) struct TestPkt {
    mem: Rc<TestMem>,
    base: u64,
    cap: usize,
    head: usize,
    len: usize,
    prio: u8,
    live: Rc<Cell<usize>>,
}

impl TestPkt {
    pub(crate) fn addr(&self) -> u64 {
        self.base + self.head as u64
    }

    pub(crate) fn set_priority(&mut self, prio: u8) {
        self.prio = prio;
    }
}

impl core::fmt::Debug for TestPkt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TestPkt")
            .field("addr", &self.addr())
            .field("len", &self.len)
            .finish()
    }
}

impl PacketBuf for TestPkt {
    fn len(&self) -> usize {
        self.len
    }

    fn data(&self) -> &[u8] {
        // SAFETY: the packet owns its bytes
        unsafe { self.mem.slice(self.addr(), self.len) }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: the packet owns its bytes
        unsafe { self.mem.slice_mut(self.addr(), self.len) }
    }

    fn headroom(&self) -> usize {
        self.head
    }

    fn push(&mut self, n: usize) -> bool {
        if n > self.head {
            return false;
        }
        self.head -= n;
        self.len += n;
        true
    }

    fn pull(&mut self, n: usize) -> bool {
        if n > self.len {
            return false;
        }
        self.head += n;
        self.len -= n;
        true
    }

    fn set_len(&mut self, len: usize) {
        self.len = len.min(self.cap - self.head);
    }

    fn priority(&self) -> u8 {
        self.prio
    }
}

impl Drop for TestPkt {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
        self.mem.release(self.base, self.cap);
    }
}

pub(crate) const PKT_HEADROOM: usize = 64;

struct DmaInner {
    mem: Rc<TestMem>,
    live_pkts: Rc<Cell<usize>>,
    live_regions: Cell<usize>,
    live_mappings: Cell<usize>,
    fail_alloc_pkt: Cell<bool>,
    fail_map: Cell<bool>,
    fail_coherent: Cell<bool>,
}

/// Allocator over a [`TestMem`] with leak counters and failure injection.
/// Bus addresses equal host addresses.
#[derive(Clone)]
pub(crate) struct TestDma {
    inner: Rc<DmaInner>,
}

impl TestDma {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            inner: Rc::new(DmaInner {
                mem: Rc::new(TestMem::new(size)),
                live_pkts: Rc::new(Cell::new(0)),
                live_regions: Cell::new(0),
                live_mappings: Cell::new(0),
                fail_alloc_pkt: Cell::new(false),
                fail_map: Cell::new(false),
                fail_coherent: Cell::new(false),
            }),
        }
    }

    pub(crate) fn mem(&self) -> Rc<TestMem> {
        self.inner.mem.clone()
    }

    pub(crate) fn read_u32(&self, addr: u64) -> u32 {
        self.inner.mem.read_val(addr).unwrap()
    }

    /// A packet holding `bytes`, with headroom in front.
    pub(crate) fn pkt_from(&self, bytes: &[u8]) -> TestPkt {
        let mut pkt = self.alloc_pkt(bytes.len()).unwrap();
        pkt.data_mut().copy_from_slice(bytes);
        pkt
    }

    pub(crate) fn live_pkts(&self) -> usize {
        self.inner.live_pkts.get()
    }

    pub(crate) fn live_regions(&self) -> usize {
        self.inner.live_regions.get()
    }

    pub(crate) fn live_mappings(&self) -> usize {
        self.inner.live_mappings.get()
    }

    pub(crate) fn fail_alloc_pkt(&self, fail: bool) {
        self.inner.fail_alloc_pkt.set(fail);
    }

    pub(crate) fn fail_map(&self, fail: bool) {
        self.inner.fail_map.set(fail);
    }

    pub(crate) fn fail_coherent(&self, fail: bool) {
        self.inner.fail_coherent.set(fail);
    }
}

impl MemOps for TestDma {
    type Error = OutOfBounds;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        self.inner.mem.read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        self.inner.mem.write(addr, src)
    }

    fn load_acquire(&self, addr: u64) -> Result<u32, Self::Error> {
        self.inner.mem.load_acquire(addr)
    }

    fn store_release(&self, addr: u64, val: u32) -> Result<(), Self::Error> {
        self.inner.mem.store_release(addr, val)
    }
}

impl DmaOps for TestDma {
    type Pkt = TestPkt;

    fn alloc_coherent(&self, len: usize, align: usize) -> Option<DmaRegion> {
        if self.inner.fail_coherent.get() {
            return None;
        }
        let va = self.inner.mem.alloc(len, align)?;
        self.inner.live_regions.set(self.inner.live_regions.get() + 1);
        Some(DmaRegion { va, pa: va, len })
    }

    fn free_coherent(&self, region: DmaRegion) {
        self.inner.live_regions.set(self.inner.live_regions.get() - 1);
        self.inner.mem.release(region.va, region.len);
    }

    fn alloc_pkt(&self, len: usize) -> Option<TestPkt> {
        if self.inner.fail_alloc_pkt.get() {
            return None;
        }
        let cap = len + PKT_HEADROOM;
        let base = self.inner.mem.alloc(cap, 8)?;
        self.inner.live_pkts.set(self.inner.live_pkts.get() + 1);
        Some(TestPkt {
            mem: self.inner.mem.clone(),
            base,
            cap,
            head: PKT_HEADROOM,
            len,
            prio: 0,
            live: self.inner.live_pkts.clone(),
        })
    }

    fn map(&self, pkt: &TestPkt, len: usize, _dir: DmaDir) -> Option<u64> {
        if self.inner.fail_map.get() || len > pkt.cap - pkt.head {
            return None;
        }
        self.inner
            .live_mappings
            .set(self.inner.live_mappings.get() + 1);
        Some(pkt.addr())
    }

    fn unmap(&self, _pa: u64, _len: usize, _dir: DmaDir) {
        self.inner
            .live_mappings
            .set(self.inner.live_mappings.get() - 1);
    }
}

/// Sync marker the device puts on its `n`th message of a ring.
pub(crate) fn epoch_marker(n: u32) -> u32 {
    (EPOCH_INIT + n) % EPOCH_MODULO
}

/// Stamps the epoch of message `n` into `bytes` and fixes the last word so
/// that all words XOR to zero.
pub(crate) fn seal_xor(bytes: &[u8], n: u32) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(bytes.len().next_multiple_of(4), 0);
    out[CmnMsgHdr::EPOCH_OFFSET] = epoch_marker(n) as u8;
    let last = out.len() - 4;
    out[last..].fill(0);
    let csum = out
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    out[last..].copy_from_slice(&csum.to_le_bytes());
    out
}

/// An ioctl request as the device saw it.
#[derive(Debug, Clone)]
pub(crate) struct SeenIoctl {
    pub req: IoctlReq,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct DevRing {
    base: u64,
    max_items: u16,
    item_len: u16,
}

#[derive(Default)]
struct Device {
    shared: BTreeMap<SharedField, u64>,
    doorbells: Vec<(RingId, u16)>,
    /// Device read index of each H2D ring.
    h2d_rd: BTreeMap<RingId, u16>,
    /// Device write index and message count of each D2H ring.
    d2h_wr: BTreeMap<RingId, (u16, u32)>,
    flow_rings: BTreeMap<RingId, DevRing>,
    rx_bufs: VecDeque<RxPost>,
    event_bufs: VecDeque<CtrlBufPost>,
    ioctl_bufs: VecDeque<CtrlBufPost>,
    ioctls: VecDeque<SeenIoctl>,
    flow_creates: VecDeque<FlowRingCreateReq>,
    flow_ctls: VecDeque<(u8, FlowRingCtlReq)>,
    tx_posts: VecDeque<TxPost>,
    dmaxfers: VecDeque<DmaXferReq>,
    /// Answers for blocked ioctls: `None` never answers.
    ioctl_script: VecDeque<Option<(u16, Vec<u8>)>>,
    delays_us: u64,
    wakeups: u32,
}

/// Shared structure, doorbell and a scripted device.
///
/// The device side is driven explicitly by tests: [`TestBus::pump`] takes
/// everything the host posted off the H2D rings, and the `complete_*`
/// helpers answer it on the D2H rings with correct sync markers.
pub(crate) struct TestBus {
    mem: Rc<TestMem>,
    flags: SharedFlags,
    push_mode: Cell<bool>,
    /// XORed into the transaction id of ioctl completions.
    trans_id_xor: Cell<u16>,
    dev: RefCell<Device>,
}

impl TestBus {
    pub(crate) fn new(mem: Rc<TestMem>, flags: SharedFlags) -> Self {
        Self {
            mem,
            flags,
            push_mode: Cell::new(false),
            trans_id_xor: Cell::new(0),
            dev: RefCell::new(Device::default()),
        }
    }

    pub(crate) fn shared(&self, field: SharedField) -> u64 {
        self.dev.borrow().shared.get(&field).copied().unwrap_or(0)
    }

    pub(crate) fn set_shared(&self, field: SharedField, value: u64) {
        self.dev.borrow_mut().shared.insert(field, value);
    }

    pub(crate) fn doorbells(&self) -> Vec<(RingId, u16)> {
        self.dev.borrow().doorbells.clone()
    }

    pub(crate) fn set_push_mode(&self, on: bool) {
        self.push_mode.set(on);
    }

    /// Makes the device answer ioctls with a transaction id other than the
    /// one it was sent.
    pub(crate) fn skew_trans_id(&self, xor: u16) {
        self.trans_id_xor.set(xor);
    }

    pub(crate) fn delays_us(&self) -> u64 {
        self.dev.borrow().delays_us
    }

    pub(crate) fn wakeups(&self) -> u32 {
        self.dev.borrow().wakeups
    }

    /// Queues the answer for the next blocked ioctl; `None` lets it time
    /// out.
    pub(crate) fn script_ioctl(&self, answer: Option<(u16, &[u8])>) {
        self.dev
            .borrow_mut()
            .ioctl_script
            .push_back(answer.map(|(s, p)| (s, p.to_vec())));
    }

    fn dma_index(&self, kind: IndexKind, ring: RingId) -> Option<u64> {
        if !self.flags.contains(SharedFlags::DMA_INDEX) {
            return None;
        }
        let arr = self.shared(SharedField::IndexArray(kind));
        if arr == 0 {
            return None;
        }
        let slot = match kind {
            IndexKind::H2dWrite | IndexKind::H2dRead => ring.h2d_index_slot(),
            IndexKind::D2hWrite | IndexKind::D2hRead => ring.d2h_index_slot(),
        };
        Some(arr + slot as u64 * 4)
    }

    fn host_index(&self, kind: IndexKind, ring: RingId) -> u16 {
        match self.dma_index(kind, ring) {
            Some(addr) => self.mem.load_acquire(addr).unwrap() as u16,
            None => {
                let field = match kind {
                    IndexKind::H2dWrite | IndexKind::D2hWrite => SharedField::RingWriteIndex(ring),
                    IndexKind::H2dRead | IndexKind::D2hRead => SharedField::RingReadIndex(ring),
                };
                self.shared(field) as u16
            }
        }
    }

    fn set_device_index(&self, kind: IndexKind, ring: RingId, val: u16) {
        match self.dma_index(kind, ring) {
            Some(addr) => self.mem.store_release(addr, val as u32).unwrap(),
            None => {
                let field = match kind {
                    IndexKind::H2dWrite | IndexKind::D2hWrite => SharedField::RingWriteIndex(ring),
                    IndexKind::H2dRead | IndexKind::D2hRead => SharedField::RingReadIndex(ring),
                };
                self.set_shared(field, val as u64);
            }
        }
    }

    fn ring(&self, id: RingId) -> DevRing {
        if let Some(r) = self.dev.borrow().flow_rings.get(&id) {
            return *r;
        }
        DevRing {
            base: self.shared(SharedField::RingBase(id)),
            max_items: self.shared(SharedField::RingMaxItems(id)) as u16,
            item_len: self.shared(SharedField::RingItemLen(id)) as u16,
        }
    }

    /// Takes every posted message off the H2D rings.
    pub(crate) fn pump(&self) {
        let mut ids = vec![RingId::CTRL_SUBMIT, RingId::RXPOST_SUBMIT, RingId::TXPOST_SUBMIT];
        ids.extend(self.dev.borrow().flow_rings.keys().copied());
        for id in ids {
            self.pump_ring(id);
        }
    }

    fn pump_ring(&self, id: RingId) {
        let ring = self.ring(id);
        if ring.base == 0 || ring.max_items == 0 {
            return;
        }
        let wr = self.host_index(IndexKind::H2dWrite, id);
        let mut rd = self.dev.borrow().h2d_rd.get(&id).copied().unwrap_or(0);
        while rd != wr {
            let addr = ring.base + rd as u64 * ring.item_len as u64;
            self.take_h2d(addr);
            rd = (rd + 1) % ring.max_items;
        }
        self.dev.borrow_mut().h2d_rd.insert(id, rd);
        self.set_device_index(IndexKind::H2dRead, id, rd);
    }

    fn take_h2d(&self, addr: u64) {
        let hdr: CmnMsgHdr = self.mem.read_val(addr).unwrap();
        let Ok(msg_type) = MsgType::try_from(hdr.msg_type) else {
            panic!("host posted unknown message type {:#x}", hdr.msg_type);
        };
        match msg_type {
            MsgType::RxBufPost => {
                let m = self.mem.read_val(addr).unwrap();
                self.dev.borrow_mut().rx_bufs.push_back(m);
            }
            MsgType::EventBufPost => {
                let m = self.mem.read_val(addr).unwrap();
                self.dev.borrow_mut().event_bufs.push_back(m);
            }
            MsgType::IoctlRespBufPost => {
                let m = self.mem.read_val(addr).unwrap();
                self.dev.borrow_mut().ioctl_bufs.push_back(m);
            }
            MsgType::IoctlReq => {
                let req: IoctlReq = self.mem.read_val(addr).unwrap();
                let mut input = vec![0u8; req.input_buf_len as usize];
                self.mem
                    .read(u64::from(req.host_input_buf_addr), &mut input)
                    .unwrap();
                self.dev.borrow_mut().ioctls.push_back(SeenIoctl { req, input });
            }
            MsgType::FlowRingCreate => {
                let req: FlowRingCreateReq = self.mem.read_val(addr).unwrap();
                if let Some(id) = RingId::for_flow(req.flow_ring_id) {
                    let ring = DevRing {
                        base: u64::from(req.flow_ring_addr),
                        max_items: req.max_items,
                        item_len: req.len_item,
                    };
                    let mut dev = self.dev.borrow_mut();
                    dev.flow_rings.insert(id, ring);
                    dev.h2d_rd.insert(id, 0);
                }
                self.dev.borrow_mut().flow_creates.push_back(req);
            }
            MsgType::FlowRingDelete | MsgType::FlowRingFlush => {
                let req = self.mem.read_val(addr).unwrap();
                self.dev
                    .borrow_mut()
                    .flow_ctls
                    .push_back((msg_type as u8, req));
            }
            MsgType::TxPost => {
                let m = self.mem.read_val(addr).unwrap();
                self.dev.borrow_mut().tx_posts.push_back(m);
            }
            MsgType::LpbkDmaxfer => {
                let m = self.mem.read_val(addr).unwrap();
                self.dev.borrow_mut().dmaxfers.push_back(m);
            }
            other => panic!("host posted a D2H message {other:?}"),
        }
    }

    /// Writes `msg` into the next slot of a D2H ring with the sync marker
    /// the negotiated mode expects, then advances the write index.
    pub(crate) fn push_d2h<T: Pod>(&self, id: RingId, msg: T) {
        self.push_d2h_bytes(id, bytemuck::bytes_of(&msg));
    }

    pub(crate) fn push_d2h_bytes(&self, id: RingId, msg: &[u8]) {
        let ring = self.ring(id);
        let (wr, n) = self.dev.borrow().d2h_wr.get(&id).copied().unwrap_or((0, 0));
        let rd = self.host_index(IndexKind::D2hRead, id);
        assert_ne!((wr + 1) % ring.max_items, rd, "D2H ring {id:?} full");

        let mut slot = vec![0u8; ring.item_len as usize];
        slot[..msg.len()].copy_from_slice(msg);
        let last = slot.len() - 4;
        if self.flags.contains(SharedFlags::D2H_SYNC_SEQNUM) {
            slot[last..].copy_from_slice(&epoch_marker(n).to_le_bytes());
        } else if self.flags.contains(SharedFlags::D2H_SYNC_XORCSUM) {
            slot = seal_xor(&slot, n);
        }

        let addr = ring.base + wr as u64 * ring.item_len as u64;
        self.mem.write(addr, &slot).unwrap();
        let wr = (wr + 1) % ring.max_items;
        self.dev.borrow_mut().d2h_wr.insert(id, (wr, n + 1));
        self.set_device_index(IndexKind::D2hWrite, id, wr);
    }

    pub(crate) fn rx_bufs_posted(&self) -> usize {
        self.dev.borrow().rx_bufs.len()
    }

    pub(crate) fn event_bufs_posted(&self) -> usize {
        self.dev.borrow().event_bufs.len()
    }

    pub(crate) fn ioctl_bufs_posted(&self) -> usize {
        self.dev.borrow().ioctl_bufs.len()
    }

    pub(crate) fn rx_bufs(&self) -> Vec<RxPost> {
        self.dev.borrow().rx_bufs.iter().copied().collect()
    }

    pub(crate) fn take_tx_posts(&self) -> Vec<TxPost> {
        self.dev.borrow_mut().tx_posts.drain(..).collect()
    }

    pub(crate) fn take_ioctl(&self) -> Option<SeenIoctl> {
        self.dev.borrow_mut().ioctls.pop_front()
    }

    pub(crate) fn take_flow_ctl(&self) -> Option<(u8, FlowRingCtlReq)> {
        self.dev.borrow_mut().flow_ctls.pop_front()
    }

    pub(crate) fn flow_creates(&self) -> Vec<FlowRingCreateReq> {
        self.dev.borrow().flow_creates.iter().copied().collect()
    }

    fn cmpl(
        msg_type: MsgType,
        if_id: u8,
        request_id: u32,
        status: u16,
        flow: u16,
    ) -> (CmnMsgHdr, ComplHdr) {
        (
            CmnMsgHdr::new(msg_type, if_id, request_id),
            ComplHdr {
                status,
                flow_ring_id: flow,
            },
        )
    }

    /// Fills the oldest posted rx buffer with `frame` at `data_offset` and
    /// completes it. Returns the packet id.
    pub(crate) fn complete_rx(&self, ifidx: u8, frame: &[u8], data_offset: u16) -> u32 {
        let buf = self.dev.borrow_mut().rx_bufs.pop_front().unwrap();
        let data = u64::from(buf.data_buf_addr) + data_offset as u64;
        self.mem.write(data, frame).unwrap();

        let (cmn, compl) = Self::cmpl(MsgType::RxCmplt, ifidx, buf.cmn.request_id, 0, 0);
        self.push_d2h(
            RingId::RX_COMPLETE,
            RxCmplt {
                cmn,
                compl,
                metadata_len: 0,
                data_len: frame.len() as u16,
                data_offset,
                ..Zeroable::zeroed()
            },
        );
        buf.cmn.request_id
    }

    /// Completes the oldest transmit post.
    pub(crate) fn complete_tx(&self, status: u16) -> TxPost {
        let post = self.dev.borrow_mut().tx_posts.pop_front().unwrap();
        let (cmn, compl) =
            Self::cmpl(MsgType::TxStatus, post.cmn.if_id, post.cmn.request_id, status, 0);
        self.push_d2h(
            RingId::TX_COMPLETE,
            TxStatus {
                cmn,
                compl,
                metadata_len: 0,
                tx_status: status,
            },
        );
        post
    }

    /// Acks and completes the oldest ioctl, writing `payload` into the
    /// oldest posted response buffer.
    pub(crate) fn complete_ioctl(&self, status: u16, payload: &[u8]) -> SeenIoctl {
        let seen = self.dev.borrow_mut().ioctls.pop_front().unwrap();
        let buf = self.dev.borrow_mut().ioctl_bufs.pop_front().unwrap();
        self.mem
            .write(u64::from(buf.host_buf_addr), payload)
            .unwrap();

        let (cmn, compl) = Self::cmpl(MsgType::IoctlAck, 0, seen.req.cmn.request_id, 0, 0);
        self.push_d2h(
            RingId::CTRL_COMPLETE,
            IoctlAck {
                cmn,
                compl,
                cmd: seen.req.cmd,
                ..Zeroable::zeroed()
            },
        );
        let (cmn, compl) = Self::cmpl(MsgType::IoctlCmplt, 0, buf.cmn.request_id, status, 0);
        self.push_d2h(
            RingId::CTRL_COMPLETE,
            IoctlCmplt {
                cmn,
                compl,
                resp_len: payload.len() as u16,
                trans_id: seen.req.trans_id ^ self.trans_id_xor.get(),
                cmd: seen.req.cmd,
                marker: 0,
            },
        );
        seen
    }

    /// Delivers an event through the oldest posted event buffer.
    pub(crate) fn send_event(&self, ifidx: u8, payload: &[u8]) {
        let buf = self.dev.borrow_mut().event_bufs.pop_front().unwrap();
        self.mem
            .write(u64::from(buf.host_buf_addr), payload)
            .unwrap();
        let (cmn, compl) = Self::cmpl(MsgType::WlEvent, ifidx, buf.cmn.request_id, 0, 0);
        self.push_d2h(
            RingId::CTRL_COMPLETE,
            WlEvent {
                cmn,
                compl,
                event_data_len: payload.len() as u16,
                ..Zeroable::zeroed()
            },
        );
    }

    pub(crate) fn complete_flow_create(&self, status: u16) -> FlowRingCreateReq {
        let req = self.dev.borrow_mut().flow_creates.pop_front().unwrap();
        self.push_status(MsgType::FlowRingCreateCmplt, req.flow_ring_id, status);
        req
    }

    /// Answers the oldest flow ring delete or flush.
    pub(crate) fn complete_flow_ctl(&self, status: u16) -> FlowRingCtlReq {
        let (msg_type, req) = self.dev.borrow_mut().flow_ctls.pop_front().unwrap();
        let reply = if msg_type == MsgType::FlowRingDelete as u8 {
            MsgType::FlowRingDeleteCmplt
        } else {
            MsgType::FlowRingFlushCmplt
        };
        self.push_status(reply, req.flow_ring_id, status);
        req
    }

    /// Answers the oldest loopback transfer, copying the data if `copy`.
    pub(crate) fn complete_dmaxfer(&self, status: u16, copy: bool) {
        let req = self.dev.borrow_mut().dmaxfers.pop_front().unwrap();
        if copy {
            let mut data = vec![0u8; req.xfer_len as usize];
            self.mem
                .read(u64::from(req.host_input_buf_addr), &mut data)
                .unwrap();
            self.mem
                .write(u64::from(req.host_output_buf_addr), &data)
                .unwrap();
        }
        self.push_status(MsgType::LpbkDmaxferCmplt, 0, status);
    }

    pub(crate) fn push_status(&self, msg_type: MsgType, flow: u16, status: u16) {
        let (cmn, compl) = Self::cmpl(msg_type, 0, 0, status, flow);
        self.push_d2h(
            RingId::CTRL_COMPLETE,
            StatusCmplt {
                cmn,
                compl,
                ..Zeroable::zeroed()
            },
        );
    }
}

impl BusOps for Rc<TestBus> {
    fn shared_flags(&self) -> SharedFlags {
        self.flags
    }

    fn read_shared(&self, field: SharedField) -> u32 {
        self.shared(field) as u32
    }

    fn write_shared(&self, field: SharedField, value: u64) {
        self.set_shared(field, value);
    }

    fn ring_doorbell(&self, ring: RingId, write_index: u16) {
        self.dev.borrow_mut().doorbells.push((ring, write_index));
    }

    fn delay_us(&self, us: u32) {
        self.dev.borrow_mut().delays_us += us as u64;
    }

    fn tx_push_mode(&self) -> bool {
        self.push_mode.get()
    }

    fn wait_ioctl_response(&self, _timeout: Duration, ready: &mut dyn FnMut() -> bool) -> bool {
        if ready() {
            return true;
        }
        let answer = self.dev.borrow_mut().ioctl_script.pop_front();
        match answer {
            Some(Some((status, payload))) => {
                self.pump();
                self.complete_ioctl(status, &payload);
                ready()
            }
            Some(None) => {
                self.pump();
                false
            }
            None => ready(),
        }
    }

    fn wake_ioctl_waiter(&self) {
        self.dev.borrow_mut().wakeups += 1;
    }
}

/// Records everything delivered upward.
#[derive(Default)]
pub(crate) struct TestHost {
    pub rx: RefCell<Vec<(u8, Vec<Vec<u8>>)>>,
    pub tx_done: RefCell<Vec<(Vec<u8>, bool)>>,
    pub flow_events: RefCell<Vec<(u16, FlowRingEvent)>>,
    pub flow_control: RefCell<Vec<bool>>,
    pub faults: RefCell<Vec<Fault>>,
    /// When set, every rx delivery issues an ioctl on this protocol.
    pub reenter: RefCell<Option<Weak<TestMsgbuf>>>,
    pub reentered: RefCell<Vec<Result<usize, MsgbufError>>>,
}

impl TestHost {
    /// Received frames, flattened.
    pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
        self.rx
            .borrow()
            .iter()
            .flat_map(|(_, chain)| chain.iter().cloned())
            .collect()
    }
}

impl HostOps<TestPkt> for Rc<TestHost> {
    fn rx_frames(&self, ifidx: u8, frames: Vec<TestPkt>) {
        let chain = frames.iter().map(|p| p.data().to_vec()).collect();
        self.rx.borrow_mut().push((ifidx, chain));

        let proto = self.reenter.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(proto) = proto {
            let res = proto.ioctl(ifidx, 0x99, false, &mut [0u8; 4]);
            self.reentered.borrow_mut().push(res);
        }
    }

    fn tx_complete(&self, pkt: TestPkt, success: bool) {
        self.tx_done.borrow_mut().push((pkt.data().to_vec(), success));
    }

    fn flow_ring_event(&self, flow_id: u16, event: FlowRingEvent) {
        self.flow_events.borrow_mut().push((flow_id, event));
    }

    fn tx_flow_control(&self, stop: bool) {
        self.flow_control.borrow_mut().push(stop);
    }
}

impl FaultHandler for Rc<TestHost> {
    fn fault(&self, fault: Fault) {
        self.faults.borrow_mut().push(fault);
    }
}

pub(crate) type TestMsgbuf = Msgbuf<Rc<TestBus>, TestDma, Rc<TestHost>>;

/// An attached and initialized protocol on the fake platform.
pub(crate) struct Harness {
    pub dma: TestDma,
    pub bus: Rc<TestBus>,
    pub host: Rc<TestHost>,
    pub proto: TestMsgbuf,
}

/// Small pools and rings so tests can fill them.
pub(crate) fn small_config() -> MsgbufConfig {
    let mut cfg = MsgbufConfig::default();
    cfg.set_max_pktids(64)
        .set_rx_buf_size(256)
        .set_ioctl_resp_buf_size(1024)
        .set_max_rxbufpost(8)
        .set_rxbufpost_threshold(2)
        .set_rx_buf_burst(4)
        .set_max_event_bufs(2)
        .set_max_ioctlresp_bufs(2)
        .set_txp_threshold(4)
        .set_max_flow_rings(4)
        .set_sync(crate::config::SyncParams {
            tries_per_step: 2,
            steps: 2,
            delay_us: 10,
        });
    cfg
}

pub(crate) fn harness_with(flags: SharedFlags, cfg: MsgbufConfig, push_mode: bool) -> Harness {
    let dma = TestDma::new(4 << 20);
    let bus = Rc::new(TestBus::new(dma.mem(), flags));
    bus.set_push_mode(push_mode);
    let host = Rc::new(TestHost::default());
    let proto = Msgbuf::attach(bus.clone(), dma.clone(), host.clone(), cfg).unwrap();
    proto.init().unwrap();
    bus.pump();
    Harness {
        dma,
        bus,
        host,
        proto,
    }
}

pub(crate) fn harness() -> Harness {
    harness_with(SharedFlags::D2H_SYNC_SEQNUM, small_config(), false)
}

/// An Ethernet frame from `sa` to `da` carrying an IPv4 header with the
/// given TOS and `body`.
pub(crate) fn ipv4_frame(da: [u8; 6], sa: [u8; 6], tos: u8, body: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(ETHER_HDR_LEN + 20 + body.len());
    f.extend_from_slice(&da);
    f.extend_from_slice(&sa);
    f.extend_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
    f.push(0x45);
    f.push(tos);
    f.extend_from_slice(&[0u8; 18]);
    f.extend_from_slice(body);
    f
}
