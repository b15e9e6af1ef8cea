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

//! D2H Completion Sync
//!
//! The device may raise its "new data" interrupt before the DMA that wrote
//! the message into host memory has landed. Before interpreting a D2H slot
//! the host therefore confirms the write finished, using one of three
//! strategies the device advertises at attach time:
//!
//! - [`D2hSync::SeqNum`]: the last 32-bit word of every message carries a
//!   per-ring counter modulo [`EPOCH_MODULO`]. The host re-reads it until it
//!   equals the value it expects next.
//! - [`D2hSync::XorCsum`]: all 32-bit words of the message XOR to zero and
//!   the header's epoch byte equals the expected counter.
//! - [`D2hSync::None`]: the device guarantees ordering itself.
//!
//! Polling is bounded: `steps` rounds of `tries_per_step` reads, round `n`
//! followed by a busy delay of `n * delay_us`. When every round fails the
//! message is a livelock. It is reported as [`Synced::Livelock`] so the
//! caller skips it, and the expected counter moves on anyway so the next
//! message is not stuck behind it.

use log::error;

use crate::access::MemOps;
use crate::config::SyncParams;
use crate::error::MsgbufError;
use crate::ring::MsgRing;
use crate::wire::{CmnMsgHdr, EPOCH_MODULO, MsgType, SharedFlags};

/// D2H completion sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum D2hSync {
    SeqNum,
    XorCsum,
    None,
}

/// Outcome of syncing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synced {
    /// The message landed; carries its raw type byte.
    Ready(u8),
    /// The message never landed and must be skipped.
    Livelock { expected: u32, tries: u32 },
}

impl Synced {
    /// The message type to dispatch; [`MsgType::NOOP`] for a livelock.
    pub fn msg_type(&self) -> u8 {
        match self {
            Synced::Ready(t) => *t,
            Synced::Livelock { .. } => MsgType::NOOP,
        }
    }
}

/// Retry accounting across all rings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Most retries any single message needed.
    pub wait_max: u32,
    /// Retries summed over all messages.
    pub wait_tot: u64,
    pub livelocks: u32,
}

impl SyncStats {
    fn record(&mut self, tries: u32) {
        if tries > self.wait_max {
            self.wait_max = tries;
        }
        self.wait_tot += tries as u64;
    }
}

impl D2hSync {
    /// Strategy advertised by the device. Sequence numbers win if both are
    /// advertised.
    pub fn from_flags(flags: SharedFlags) -> Self {
        if flags.contains(SharedFlags::D2H_SYNC_SEQNUM) {
            D2hSync::SeqNum
        } else if flags.contains(SharedFlags::D2H_SYNC_XORCSUM) {
            D2hSync::XorCsum
        } else {
            D2hSync::None
        }
    }

    /// Waits for the message in slot `idx` of `ring` to land.
    ///
    /// `delay` busy-waits for the given number of microseconds between
    /// rounds.
    pub fn sync<M: MemOps>(
        &self,
        mem: &M,
        ring: &mut MsgRing,
        idx: u16,
        params: &SyncParams,
        stats: &mut SyncStats,
        mut delay: impl FnMut(u32),
    ) -> Result<Synced, MsgbufError> {
        let addr = ring.slot_addr(idx);
        let len = ring.item_len() as usize;

        if *self == D2hSync::None {
            return read_type(mem, addr).map(Synced::Ready);
        }

        let expected = ring.seqnum() % EPOCH_MODULO;
        for step in 1..=params.steps {
            for tries in 0..params.tries_per_step {
                mem.cache_invalidate(addr, len);
                if self.landed(mem, addr, len, expected)? {
                    stats.record((step - 1) * params.tries_per_step + tries);
                    ring.advance_seqnum();
                    return read_type(mem, addr).map(Synced::Ready);
                }
                core::hint::spin_loop();
            }
            delay(params.delay_us * step);
        }

        let tries = params.steps * params.tries_per_step;
        error!(
            "{} ring slot {}: D2H sync livelock, expected epoch {} after {} tries",
            ring.name(),
            idx,
            expected,
            tries
        );
        stats.livelocks += 1;
        ring.advance_seqnum();
        Ok(Synced::Livelock { expected, tries })
    }

    fn landed<M: MemOps>(
        &self,
        mem: &M,
        addr: u64,
        len: usize,
        expected: u32,
    ) -> Result<bool, MsgbufError> {
        match self {
            D2hSync::SeqNum => {
                let marker = mem
                    .load_acquire(addr + (len - 4) as u64)
                    .map_err(|_| MsgbufError::MemAccess)?;
                Ok(marker == expected)
            }
            D2hSync::XorCsum => {
                let mut csum = 0u32;
                for off in (0..len).step_by(4) {
                    csum ^= mem
                        .read_val::<u32>(addr + off as u64)
                        .map_err(|_| MsgbufError::MemAccess)?;
                }
                let hdr: CmnMsgHdr = mem.read_val(addr).map_err(|_| MsgbufError::MemAccess)?;
                Ok(csum == 0 && hdr.epoch as u32 == expected)
            }
            D2hSync::None => Ok(true),
        }
    }
}

fn read_type<M: MemOps>(mem: &M, addr: u64) -> Result<u8, MsgbufError> {
    let hdr: CmnMsgHdr = mem.read_val(addr).map_err(|_| MsgbufError::MemAccess)?;
    Ok(hdr.msg_type)
}
