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

use core::time::Duration;

use crate::wire::{RingId, SharedFlags};

/// One of the four ring index arrays.
///
/// With DMA'd indices the device DMAs the H2D read and D2H write indices
/// into host memory, and reads the H2D write and D2H read indices from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKind {
    H2dWrite,
    H2dRead,
    D2hWrite,
    D2hRead,
}

/// Named fields of the device's shared structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SharedField {
    /// Bus address of a ring's slot memory.
    RingBase(RingId),
    RingMaxItems(RingId),
    RingItemLen(RingId),
    RingReadIndex(RingId),
    RingWriteIndex(RingId),
    /// Receive buffers the device wants posted; 0 means no preference.
    MaxHostRxBufs,
    ScratchBufAddr,
    ScratchBufLen,
    /// Bus address of a host-resident index array.
    IndexArray(IndexKind),
}

/// Bus-transport collaborator.
///
/// The bus owns the shared structure, the doorbell and the waiting side of
/// the ioctl channel. It also decides when completion rings are serviced:
/// on an interrupt (or poll) it calls the protocol's `process_*`
/// functions until they report no more work.
pub trait BusOps {
    /// Capabilities advertised by the device.
    fn shared_flags(&self) -> SharedFlags;

    fn read_shared(&self, field: SharedField) -> u32;

    fn write_shared(&self, field: SharedField, value: u64);

    /// Tells the device that `ring` has new entries up to `write_index`.
    fn ring_doorbell(&self, ring: RingId, write_index: u16);

    /// Busy-waits for `us` microseconds.
    fn delay_us(&self, us: u32);

    /// True when transmit posts go to the common tx ring instead of flow
    /// rings.
    fn tx_push_mode(&self) -> bool {
        false
    }

    /// Blocks until `ready` returns true or `timeout` elapses.
    ///
    /// `ready` services the control completion ring and reports whether the
    /// outstanding ioctl has completed. Implementations call it after each
    /// wakeup from [`BusOps::wake_ioctl_waiter`] or from a polling loop.
    /// Returns the last value `ready` returned.
    fn wait_ioctl_response(&self, timeout: Duration, ready: &mut dyn FnMut() -> bool) -> bool;

    /// Wakes a thread blocked in [`BusOps::wait_ioctl_response`].
    fn wake_ioctl_waiter(&self) {}
}
