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

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::error::ErrorKind;
use crate::pktid::PktIdError;
use crate::wire::RingId;

/// Flow ring lifecycle notifications for the upper layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowRingEvent {
    /// The device accepted the ring; frames may be queued to it.
    Active,
    /// The device rejected the ring; it is back to uncreated.
    CreateFailed { status: u16 },
    Deleted,
    /// The device refused the delete; the ring stays active.
    DeleteFailed { status: u16 },
    Flushed { status: u16 },
}

/// Upward-delivery collaborator.
pub trait HostOps<P> {
    /// Delivers received frames for interface `ifidx`. More than one frame
    /// is a chain of frames of the same flow.
    fn rx_frames(&self, ifidx: u8, frames: Vec<P>);

    /// Returns a transmitted packet.
    fn tx_complete(&self, pkt: P, success: bool);

    fn flow_ring_event(&self, _flow_id: u16, _event: FlowRingEvent) {}

    /// Too many transmits in flight (`stop`), or enough completed to resume.
    fn tx_flow_control(&self, _stop: bool) {}
}

/// A protocol fault. The core only reports these; deciding whether to
/// reset the device belongs to the [`FaultHandler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// A D2H message never completed its DMA; it was dropped.
    Livelock {
        ring: RingId,
        expected: u32,
        tries: u32,
    },
    /// The device advertised an impossible write index.
    RingDesync {
        ring: RingId,
        rd: u16,
        wr: u16,
        max_items: u16,
    },
    /// An index entry the device wrote is not a ring index at all.
    BadIndex { ring: RingId, value: u32 },
    /// A completion referenced a packet id the host cannot release.
    BadPktId { ring: RingId, error: PktIdError },
    /// A message type outside the protocol's table.
    BadMsgType { ring: RingId, msg_type: u8 },
}

impl Fault {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Fault::Livelock { .. } => ErrorKind::Livelock,
            Fault::RingDesync { .. }
            | Fault::BadIndex { .. }
            | Fault::BadPktId { .. }
            | Fault::BadMsgType { .. } => ErrorKind::Desync,
        }
    }
}

/// Fault-handling collaborator.
pub trait FaultHandler {
    fn fault(&self, fault: Fault);
}

/// An upward call recorded under the protocol lock and made after it is
/// released, so collaborators may call back into the protocol.
pub(crate) enum Upcall<P> {
    RxFrames { ifidx: u8, frames: Vec<P> },
    TxComplete { pkt: P, success: bool },
    FlowRing { flow_id: u16, event: FlowRingEvent },
    FlowControl { stop: bool },
    Fault(Fault),
    WakeIoctlWaiter,
}

pub(crate) type Upcalls<P> = SmallVec<[Upcall<P>; 8]>;
