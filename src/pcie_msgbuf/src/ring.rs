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

//! Descriptor Ring
//!
//! A ring is `max_items` fixed-size slots in host memory with a read and a
//! write index. For H2D rings the host owns the write index and the device
//! the read index; for D2H rings it is the other way round.
//!
//! ```text
//!            rd                      wr
//!            v                       v
//!   +----+----+----+----+----+----+----+----+
//!   |    | F  | F  | F  | F  | F  |    |    |     F = filled, not yet consumed
//!   +----+----+----+----+----+----+----+----+
//!     0    1    2    3    4    5    6    7
//! ```
//!
//! One slot always stays empty so that `rd == wr` unambiguously means
//! empty. Producers only ever claim a contiguous run of slots: when the
//! free space wraps, a reservation stops at the end of the ring and the
//! caller asks again for the rest.
//!
//! [`MsgRing`] is only the index arithmetic and slot addressing. Moving
//! indices to and from the device, cache maintenance and doorbells live in
//! [`crate::index`].

use thiserror::Error;

use crate::dma::DmaRegion;
use crate::wire::{EPOCH_INIT, RingId};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Ring is full")]
    NoSpace,
    #[error("Ring {ring} out of sync: rd {rd} wr {wr} max {max_items}")]
    Desync {
        ring: u16,
        rd: u16,
        wr: u16,
        max_items: u16,
    },
    #[error("Ring {ring} index entry {value:#x} does not fit a ring index")]
    BadIndex { ring: u16, value: u32 },
    #[error("Invalid ring geometry: {max_items} items of {item_len} bytes")]
    InvalidGeometry { max_items: u16, item_len: u16 },
}

/// A run of contiguous slots, `start..start + count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u16,
    pub count: u16,
}

impl Span {
    pub fn indices(&self) -> impl Iterator<Item = u16> + use<> {
        self.start..self.start + self.count
    }
}

#[derive(Debug)]
pub struct MsgRing {
    id: RingId,
    name: &'static str,
    region: DmaRegion,
    max_items: u16,
    item_len: u16,
    rd: u16,
    wr: u16,
    /// Expected D2H epoch counter.
    seqnum: u32,
    /// Written but not yet committed slots, for doorbell batching.
    pend_start: u16,
    pend_items: u16,
}

impl MsgRing {
    /// Ring memory needed for `max_items` slots of `item_len` bytes.
    pub const fn query_size(max_items: u16, item_len: u16) -> usize {
        max_items as usize * item_len as usize
    }

    /// Wraps `region` as a ring of `max_items` slots.
    ///
    /// Slots hold whole 32-bit words so D2H sync can find the marker word.
    pub fn new(
        id: RingId,
        name: &'static str,
        region: DmaRegion,
        max_items: u16,
        item_len: u16,
    ) -> Result<Self, RingError> {
        if max_items < 2
            || item_len < 8
            || !item_len.is_multiple_of(4)
            || region.len < Self::query_size(max_items, item_len)
        {
            return Err(RingError::InvalidGeometry {
                max_items,
                item_len,
            });
        }

        Ok(Self {
            id,
            name,
            region,
            max_items,
            item_len,
            rd: 0,
            wr: 0,
            seqnum: EPOCH_INIT,
            pend_start: 0,
            pend_items: 0,
        })
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn region(&self) -> DmaRegion {
        self.region
    }

    pub fn max_items(&self) -> u16 {
        self.max_items
    }

    pub fn item_len(&self) -> u16 {
        self.item_len
    }

    pub fn rd(&self) -> u16 {
        self.rd
    }

    pub fn wr(&self) -> u16 {
        self.wr
    }

    /// Host address of slot `idx`.
    pub fn slot_addr(&self, idx: u16) -> u64 {
        self.region.va + idx as u64 * self.item_len as u64
    }

    /// Host address and byte length of `span`.
    pub fn span_bytes(&self, span: Span) -> (u64, usize) {
        (
            self.slot_addr(span.start),
            span.count as usize * self.item_len as usize,
        )
    }

    /// Slots that can be claimed contiguously from `wr`.
    pub fn write_space(&self) -> u16 {
        let (r, w, d) = (self.rd, self.wr, self.max_items);
        if r > w {
            r - w - 1
        } else if r == 0 {
            d - w - 1
        } else {
            d - w
        }
    }

    /// Slots between `rd` and `wr` that can be read contiguously.
    pub fn read_avail(&self) -> u16 {
        let (r, w, d) = (self.rd, self.wr, self.max_items);
        if w >= r { w - r } else { d - r }
    }

    /// Slots currently holding unconsumed messages, wrapped or not.
    pub fn occupied(&self) -> u16 {
        let d = self.max_items as u32;
        ((self.wr as u32 + d - self.rd as u32) % d) as u16
    }

    /// Claims up to `n` contiguous slots for writing and advances `wr` past
    /// them. Grants fewer than `n` when space is short and `None` when
    /// there is none.
    pub fn reserve(&mut self, n: u16) -> Option<Span> {
        let count = core::cmp::min(n, self.write_space());
        if count == 0 {
            return None;
        }

        let start = self.wr;
        self.wr += count;
        if self.wr == self.max_items {
            self.wr = 0;
        }
        Some(Span { start, count })
    }

    /// Gives back the last `n` reserved slots.
    pub fn unreserve(&mut self, n: u16) {
        let d = self.max_items as u32;
        self.wr = ((self.wr as u32 + d - (n as u32 % d)) % d) as u16;
    }

    /// Claims every readable contiguous slot and advances `rd` past them.
    ///
    /// A write index outside the ring means host and device disagree about
    /// the ring; that is reported rather than wrapped.
    pub fn consume(&mut self) -> Result<Option<Span>, RingError> {
        if self.wr >= self.max_items || self.rd >= self.max_items {
            return Err(self.desync());
        }

        let count = self.read_avail();
        if count == 0 {
            return Ok(None);
        }

        let start = self.rd;
        if self.rd + count >= self.max_items {
            self.rd = 0;
        } else {
            self.rd += count;
        }
        Ok(Some(Span { start, count }))
    }

    /// Updates the index owned by the device. Values outside the ring are
    /// stored as-is and caught by the next [`MsgRing::consume`].
    pub fn set_write_index(&mut self, wr: u16) {
        self.wr = wr;
    }

    pub fn set_read_index(&mut self, rd: u16) {
        self.rd = rd;
    }

    pub(crate) fn desync(&self) -> RingError {
        RingError::Desync {
            ring: self.id.0,
            rd: self.rd,
            wr: self.wr,
            max_items: self.max_items,
        }
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub(crate) fn advance_seqnum(&mut self) {
        self.seqnum = self.seqnum.wrapping_add(1);
    }

    /// Records slot `idx` as written but not yet announced to the device.
    /// Pending slots are always a contiguous run.
    pub fn add_pending(&mut self, idx: u16) {
        if self.pend_items == 0 {
            self.pend_start = idx;
        }
        self.pend_items += 1;
    }

    pub fn pending(&self) -> u16 {
        self.pend_items
    }

    /// Returns and forgets the pending run.
    pub fn take_pending(&mut self) -> Option<Span> {
        if self.pend_items == 0 {
            return None;
        }
        let span = Span {
            start: self.pend_start,
            count: self.pend_items,
        };
        self.pend_items = 0;
        Some(span)
    }

    /// Forgets all index state; the caller zeroes the slot memory.
    pub fn reset(&mut self) {
        self.rd = 0;
        self.wr = 0;
        self.seqnum = EPOCH_INIT;
        self.pend_start = 0;
        self.pend_items = 0;
    }
}
