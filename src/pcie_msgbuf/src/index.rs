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

//! Ring index publication and ring I/O.
//!
//! The device and host exchange ring indices in one of two ways, chosen at
//! attach time:
//!
//! - through named fields of the device's shared structure, read and
//!   written by the bus ([`BusOps::read_shared`] and friends), or
//! - through four host-resident arrays of 32-bit entries, one entry per
//!   ring. The device DMAs its indices (H2D read, D2H write) into two of
//!   them and fetches the host's (H2D write, D2H read) from the other two.
//!
//! [`RingIo`] layers the ring operations on top: reserving with one
//! refresh-and-retry, committing written slots (flush, publish, doorbell),
//! consuming D2H slots and publishing the host read index.

use crate::access::MemOps;
use crate::bus::{BusOps, IndexKind, SharedField};
use crate::dma::{DmaOps, DmaRegion, RegionGuard};
use crate::error::MsgbufError;
use crate::ring::{MsgRing, RingError, Span};
use crate::wire::{RingId, SharedFlags};

const INDEX_ENTRY_LEN: usize = 4;

/// Where ring indices travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexMode {
    /// Named fields of the shared structure, through the bus.
    Shared,
    /// Host-resident arrays: the device DMAs its own indices in and
    /// fetches the host's out.
    HostArrays,
}

#[derive(Debug, Clone, Copy)]
struct IndexArrays {
    h2d_write: DmaRegion,
    h2d_read: DmaRegion,
    d2h_write: DmaRegion,
    d2h_read: DmaRegion,
}

impl IndexArrays {
    fn region(&self, kind: IndexKind) -> DmaRegion {
        match kind {
            IndexKind::H2dWrite => self.h2d_write,
            IndexKind::H2dRead => self.h2d_read,
            IndexKind::D2hWrite => self.d2h_write,
            IndexKind::D2hRead => self.d2h_read,
        }
    }
}

/// Where each ring index lives.
#[derive(Debug)]
pub struct IndexStore {
    mode: IndexMode,
    arrays: Option<IndexArrays>,
}

impl IndexStore {
    /// Indices only through the shared structure.
    pub fn shared() -> Self {
        Self {
            mode: IndexMode::Shared,
            arrays: None,
        }
    }

    /// Allocates host index arrays when the device advertises support and
    /// `allowed` is set; otherwise falls back to shared fields.
    ///
    /// `h2d_rings` counts the H2D common rings plus every tx ring.
    pub fn attach<D: DmaOps>(
        dma: &D,
        flags: SharedFlags,
        allowed: bool,
        h2d_rings: usize,
    ) -> Result<Self, MsgbufError> {
        if !allowed || !flags.contains(SharedFlags::DMA_INDEX) {
            return Ok(Self::shared());
        }

        let h2d_len = h2d_rings * INDEX_ENTRY_LEN;
        let d2h_len = RingId::D2H_COMMON as usize * INDEX_ENTRY_LEN;
        let alloc = |len| {
            RegionGuard::alloc(dma, len, INDEX_ENTRY_LEN)
                .ok_or(MsgbufError::NoResource("index arrays"))
        };
        let h2d_write = alloc(h2d_len)?;
        let h2d_read = alloc(h2d_len)?;
        let d2h_write = alloc(d2h_len)?;
        let d2h_read = alloc(d2h_len)?;

        Ok(Self {
            mode: IndexMode::HostArrays,
            arrays: Some(IndexArrays {
                h2d_write: h2d_write.dismiss(),
                h2d_read: h2d_read.dismiss(),
                d2h_write: d2h_write.dismiss(),
                d2h_read: d2h_read.dismiss(),
            }),
        })
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    /// Tells the device where the index arrays live.
    pub fn publish_arrays<B: BusOps>(&self, bus: &B) {
        let Some(arrays) = self.arrays else {
            return;
        };
        for kind in [
            IndexKind::H2dWrite,
            IndexKind::H2dRead,
            IndexKind::D2hWrite,
            IndexKind::D2hRead,
        ] {
            bus.write_shared(SharedField::IndexArray(kind), arrays.region(kind).pa);
        }
    }

    /// Zeroes the arrays.
    pub fn clear<M: MemOps>(&self, mem: &M) -> Result<(), MsgbufError> {
        if let Some(arrays) = self.arrays {
            for region in [
                arrays.h2d_write,
                arrays.h2d_read,
                arrays.d2h_write,
                arrays.d2h_read,
            ] {
                mem.zero(region.va, region.len)
                    .map_err(|_| MsgbufError::MemAccess)?;
                mem.cache_flush(region.va, region.len);
            }
        }
        Ok(())
    }

    /// Frees the arrays.
    pub fn release<D: DmaOps>(&mut self, dma: &D) {
        if let Some(arrays) = self.arrays.take() {
            dma.free_coherent(arrays.h2d_write);
            dma.free_coherent(arrays.h2d_read);
            dma.free_coherent(arrays.d2h_write);
            dma.free_coherent(arrays.d2h_read);
        }
        self.mode = IndexMode::Shared;
    }

    fn entry(&self, kind: IndexKind, ring: RingId) -> Option<u64> {
        let region = self.arrays?.region(kind);
        let slot = match kind {
            IndexKind::H2dWrite | IndexKind::H2dRead => ring.h2d_index_slot(),
            IndexKind::D2hWrite | IndexKind::D2hRead => ring.d2h_index_slot(),
        };
        let off = slot * INDEX_ENTRY_LEN;
        (off + INDEX_ENTRY_LEN <= region.len).then_some(region.va + off as u64)
    }

    /// Reads an index the device owns.
    pub fn read<M: MemOps, B: BusOps>(
        &self,
        mem: &M,
        bus: &B,
        kind: IndexKind,
        ring: RingId,
    ) -> Result<u16, MsgbufError> {
        if let Some(addr) = self.entry(kind, ring) {
            mem.cache_invalidate(addr, INDEX_ENTRY_LEN);
            let val = mem.load_acquire(addr).map_err(|_| MsgbufError::MemAccess)?;
            return to_index(ring, val);
        }

        let field = match kind {
            IndexKind::H2dRead | IndexKind::D2hRead => SharedField::RingReadIndex(ring),
            IndexKind::H2dWrite | IndexKind::D2hWrite => SharedField::RingWriteIndex(ring),
        };
        to_index(ring, bus.read_shared(field))
    }

    /// Publishes an index the host owns.
    pub fn write<M: MemOps, B: BusOps>(
        &self,
        mem: &M,
        bus: &B,
        kind: IndexKind,
        ring: RingId,
        val: u16,
    ) -> Result<(), MsgbufError> {
        if let Some(addr) = self.entry(kind, ring) {
            mem.store_release(addr, val as u32)
                .map_err(|_| MsgbufError::MemAccess)?;
            mem.cache_flush(addr, INDEX_ENTRY_LEN);
            return Ok(());
        }

        let field = match kind {
            IndexKind::H2dRead | IndexKind::D2hRead => SharedField::RingReadIndex(ring),
            IndexKind::H2dWrite | IndexKind::D2hWrite => SharedField::RingWriteIndex(ring),
        };
        bus.write_shared(field, val as u64);
        Ok(())
    }
}

/// Ring operations that touch memory, the bus and the index store.
pub struct RingIo<'a, M, B> {
    pub mem: &'a M,
    pub bus: &'a B,
    pub idx: &'a IndexStore,
}

impl<M: MemOps, B: BusOps> RingIo<'_, M, B> {
    /// Claims up to `n` contiguous slots of an H2D ring.
    ///
    /// If the ring looks full, the device's read index is refreshed once
    /// and the reservation retried: the cached value lags behind whenever
    /// the device consumed slots since the last refresh.
    pub fn reserve(&self, ring: &mut MsgRing, n: u16) -> Result<Option<Span>, MsgbufError> {
        if let Some(span) = ring.reserve(n) {
            return Ok(Some(span));
        }

        let rd = self.idx.read(self.mem, self.bus, IndexKind::H2dRead, ring.id())?;
        if rd >= ring.max_items() {
            return Err(ring_desync(ring, rd).into());
        }
        ring.set_read_index(rd);
        let span = ring.reserve(n);
        if span.is_none() {
            log::trace!("{} ring full: rd {} wr {}", ring.name(), ring.rd(), ring.wr());
        }
        Ok(span)
    }

    /// Makes written slots visible: flushes them, publishes the write index
    /// and rings the doorbell.
    pub fn commit(&self, ring: &MsgRing, span: Span) -> Result<(), MsgbufError> {
        let (addr, len) = ring.span_bytes(span);
        self.mem.cache_flush(addr, len);
        self.publish_write_index(ring)?;
        self.bus.ring_doorbell(ring.id(), ring.wr());
        Ok(())
    }

    pub fn publish_write_index(&self, ring: &MsgRing) -> Result<(), MsgbufError> {
        self.idx
            .write(self.mem, self.bus, IndexKind::H2dWrite, ring.id(), ring.wr())
    }

    /// Claims every unread contiguous slot of a D2H ring.
    ///
    /// The host read index advances immediately; the device only learns
    /// about it through [`RingIo::publish_read_index`].
    pub fn consume(&self, ring: &mut MsgRing) -> Result<Option<Span>, MsgbufError> {
        let wr = self.idx.read(self.mem, self.bus, IndexKind::D2hWrite, ring.id())?;
        ring.set_write_index(wr);

        let span = ring.consume()?;
        if let Some(span) = span {
            let (addr, len) = ring.span_bytes(span);
            self.mem.cache_invalidate(addr, len);
        }
        Ok(span)
    }

    pub fn publish_read_index(&self, ring: &MsgRing) -> Result<(), MsgbufError> {
        self.publish_read_index_at(ring, ring.rd())
    }

    /// Publishes `rd` as the host read index of a D2H ring.
    pub fn publish_read_index_at(&self, ring: &MsgRing, rd: u16) -> Result<(), MsgbufError> {
        self.idx
            .write(self.mem, self.bus, IndexKind::D2hRead, ring.id(), rd)
    }

    /// Writes one message into slot `idx`.
    pub fn write_slot<T: bytemuck::Pod>(
        &self,
        ring: &MsgRing,
        idx: u16,
        msg: T,
    ) -> Result<(), MsgbufError> {
        self.mem
            .write_val(ring.slot_addr(idx), msg)
            .map_err(|_| MsgbufError::MemAccess)
    }

    /// Zeroes a ring's slots and forgets its indices.
    pub fn clear(&self, ring: &mut MsgRing) -> Result<(), MsgbufError> {
        let region = ring.region();
        self.mem
            .zero(region.va, region.len)
            .map_err(|_| MsgbufError::MemAccess)?;
        self.mem.cache_flush(region.va, region.len);
        ring.reset();
        Ok(())
    }

    /// Tells the device where `ring` lives and how it is shaped.
    pub fn announce(&self, ring: &MsgRing) {
        self.bus
            .write_shared(SharedField::RingBase(ring.id()), ring.region().pa);
        self.bus
            .write_shared(SharedField::RingMaxItems(ring.id()), ring.max_items() as u64);
        self.bus
            .write_shared(SharedField::RingItemLen(ring.id()), ring.item_len() as u64);
    }
}

/// Entries are 32 bits wide but ring indices are not.
fn to_index(ring: RingId, value: u32) -> Result<u16, MsgbufError> {
    u16::try_from(value).map_err(|_| RingError::BadIndex { ring: ring.0, value }.into())
}

fn ring_desync(ring: &MsgRing, rd: u16) -> RingError {
    RingError::Desync {
        ring: ring.id().0,
        rd,
        wr: ring.wr(),
        max_items: ring.max_items(),
    }
}
