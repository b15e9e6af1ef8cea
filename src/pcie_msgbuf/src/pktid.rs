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

//! Packet-Identifier Map
//!
//! Native packet buffers never cross the wire. When a buffer is posted to
//! the device it is parked in a locker of this map and the device is given
//! the locker's index, a small integer packet id. The completion names the
//! same id and the host takes the buffer back out.
//!
//! ```text
//!   lockers: [ 0: never used | 1: Rx pkt | 2: free | 3: Tx pkt | ... | N ]
//!   free:    FIFO of free ids  ->  2, 5, 6, ...
//! ```
//!
//! Ownership of the buffer moves into the map on [`PktIdMap::reserve`] and
//! back out exactly once on [`PktIdMap::release`]. Reserving and recording
//! the DMA mapping are separate steps so a locker can be claimed before a
//! mapping that may still fail.
//!
//! Every locker remembers the [`BufClass`] it was reserved for and release
//! must name the same class: a tx completion can never reclaim an rx
//! buffer that happens to carry the same id. A bitmap tracks allocation
//! state independently of the lockers and flags double allocations and
//! double frees.
//!
//! Id 0 is never issued, and neither is the ioctl sentinel
//! [`IOCTL_REQ_PKTID`]; the pool capacity is capped below it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use fixedbitset::FixedBitSet;
use log::error;
use thiserror::Error;

use crate::dma::DmaDir;
use crate::wire::{IOCTL_REQ_PKTID, PKTID_INVALID};

/// What a parked buffer is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum BufClass {
    DataTx,
    DataRx,
    IoctlResp,
    Event,
    /// As a release class: skip the class check.
    Unchecked,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PktIdError {
    #[error("Invalid packet id {0}")]
    Invalid(u32),
    #[error("Packet id {0} is not in use")]
    NotInUse(u32),
    #[error("Packet id {id} holds a {stored:?} buffer, expected {expected:?}")]
    ClassMismatch {
        id: u32,
        stored: BufClass,
        expected: BufClass,
    },
}

/// A packet id handed out by [`PktIdMap::reserve`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PktId(u32);

impl PktId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// The pool had no free locker; the buffer is handed back.
pub struct PoolExhausted<P>(pub P);

impl<P> fmt::Debug for PoolExhausted<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PoolExhausted")
    }
}

/// Buffer and mapping returned by [`PktIdMap::release`].
pub struct Released<P> {
    pub pkt: P,
    pub pa: u64,
    pub len: u32,
    pub dir: DmaDir,
    pub class: BufClass,
}

impl<P> fmt::Debug for Released<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Released")
            .field("pa", &self.pa)
            .field("len", &self.len)
            .field("dir", &self.dir)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

struct Locker<P> {
    pkt: P,
    pa: u64,
    len: u32,
    dir: DmaDir,
    class: BufClass,
}

pub struct PktIdMap<P> {
    /// Index 0 stays `None` forever.
    lockers: Vec<Option<Locker<P>>>,
    free: VecDeque<u32>,
    audit: FixedBitSet,
    audit_failures: u32,
}

impl<P> PktIdMap<P> {
    /// A pool of ids `1..=capacity`. Capacity is capped so that the ioctl
    /// sentinel is never issued.
    pub fn new(capacity: u32) -> Self {
        let capacity = core::cmp::min(capacity, IOCTL_REQ_PKTID - 1);
        let n = capacity as usize + 1;
        let mut lockers = Vec::with_capacity(n);
        lockers.resize_with(n, || None);

        Self {
            lockers,
            free: (1..=capacity).collect(),
            audit: FixedBitSet::with_capacity(n),
            audit_failures: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        (self.lockers.len() - 1) as u32
    }

    /// Free lockers. O(1).
    pub fn avail(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() as usize - self.free.len()
    }

    /// Bitmap audit disagreements seen so far.
    pub fn audit_failures(&self) -> u32 {
        self.audit_failures
    }

    /// Parks `pkt` in a free locker. On an empty pool the packet comes back
    /// in the error; callers treat that as backpressure.
    pub fn reserve(&mut self, pkt: P, class: BufClass) -> Result<PktId, PoolExhausted<P>> {
        let Some(id) = self.free.pop_front() else {
            return Err(PoolExhausted(pkt));
        };

        if self.audit.contains(id as usize) {
            self.audit_failures += 1;
            error!("pktid audit: {} allocated twice", id);
        }
        self.audit.insert(id as usize);

        self.lockers[id as usize] = Some(Locker {
            pkt,
            pa: 0,
            len: 0,
            dir: DmaDir::ToDevice,
            class,
        });
        Ok(PktId(id))
    }

    /// Records the DMA mapping of a reserved locker.
    pub fn save(
        &mut self,
        id: PktId,
        pa: u64,
        len: u32,
        dir: DmaDir,
        class: BufClass,
    ) -> Result<(), PktIdError> {
        let locker = self
            .lockers
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(PktIdError::NotInUse(id.0))?;
        if locker.class != class {
            return Err(PktIdError::ClassMismatch {
                id: id.0,
                stored: locker.class,
                expected: class,
            });
        }
        locker.pa = pa;
        locker.len = len;
        locker.dir = dir;
        Ok(())
    }

    /// [`reserve`](Self::reserve) and [`save`](Self::save) in one step, for
    /// buffers that are already mapped.
    pub fn alloc(
        &mut self,
        pkt: P,
        pa: u64,
        len: u32,
        dir: DmaDir,
        class: BufClass,
    ) -> Result<PktId, PoolExhausted<P>> {
        let id = self.reserve(pkt, class)?;
        if let Some(Some(locker)) = self.lockers.get_mut(id.0 as usize) {
            locker.pa = pa;
            locker.len = len;
            locker.dir = dir;
        }
        Ok(id)
    }

    /// Takes the buffer of `id` back out and frees the locker.
    ///
    /// `id` usually comes from the device, so anything is possible: out of
    /// range ids, free lockers and lockers of another class are all
    /// rejected and leave the map untouched.
    pub fn release(&mut self, id: u32, expected: BufClass) -> Result<Released<P>, PktIdError> {
        if id == PKTID_INVALID || id as usize >= self.lockers.len() {
            return Err(PktIdError::Invalid(id));
        }

        let slot = &mut self.lockers[id as usize];
        let stored = match slot {
            Some(locker) => locker.class,
            None => {
                if self.audit.contains(id as usize) {
                    self.audit_failures += 1;
                    error!("pktid audit: {} marked allocated but locker is empty", id);
                }
                return Err(PktIdError::NotInUse(id));
            }
        };
        if expected != BufClass::Unchecked && stored != expected {
            return Err(PktIdError::ClassMismatch {
                id,
                stored,
                expected,
            });
        }

        let Some(locker) = slot.take() else {
            return Err(PktIdError::NotInUse(id));
        };
        if !self.audit.contains(id as usize) {
            self.audit_failures += 1;
            error!("pktid audit: {} freed but not marked allocated", id);
        }
        self.audit.set(id as usize, false);
        self.free.push_back(id);

        Ok(Released {
            pkt: locker.pkt,
            pa: locker.pa,
            len: locker.len,
            dir: locker.dir,
            class: locker.class,
        })
    }

    /// Force-frees every in-use locker, for teardown. The pool is full
    /// again afterwards.
    pub fn drain(&mut self) -> Vec<Released<P>> {
        let mut out = Vec::with_capacity(self.in_use());
        for locker in self.lockers.iter_mut().filter_map(Option::take) {
            out.push(Released {
                pkt: locker.pkt,
                pa: locker.pa,
                len: locker.len,
                dir: locker.dir,
                class: locker.class,
            });
        }
        self.audit.clear();
        self.free = (1..=self.capacity()).collect();
        out
    }
}
