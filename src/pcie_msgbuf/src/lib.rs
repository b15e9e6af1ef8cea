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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(feature = "fuzzing"), no_std)]

//! Host side of the PCIe message-buffer protocol.
//!
//! The host and the wireless co-processor exchange fixed-size messages
//! through circular rings that live in host memory. Three host-to-device
//! (H2D) rings carry control requests, receive buffer posts and transmit
//! posts; three device-to-host (D2H) rings carry their completions. Data
//! for individual traffic flows goes through flow rings which are created
//! and destroyed over the control ring at runtime.
//!
//! ```text
//!        host                                       device
//!   +-------------+   H2D ctrl submit (0)     +---------------+
//!   |             | ------------------------> |               |
//!   |   Msgbuf    |   H2D rxpost submit (1)   |   firmware    |
//!   |             | ------------------------> |               |
//!   |  PktIdMap   |   H2D flow rings (5..)    |               |
//!   |             | ------------------------> |               |
//!   |             |   D2H ctrl complete (2)   |               |
//!   |             | <------------------------ |               |
//!   |             |   D2H tx complete (3)     |               |
//!   |             | <------------------------ |               |
//!   |             |   D2H rx complete (4)     |               |
//!   |             | <------------------------ |               |
//!   +-------------+                           +---------------+
//! ```
//!
//! Native packet buffers never cross the wire. They are parked in the
//! [`pktid::PktIdMap`] and the device only ever sees a small integer id.
//!
//! The crate is `no_std` and talks to its environment through four
//! collaborator traits: [`access::MemOps`] and [`dma::DmaOps`] for memory,
//! [`bus::BusOps`] for the transport and [`host::HostOps`] /
//! [`host::FaultHandler`] for upward delivery and fault escalation.

extern crate alloc;

/// Typed access to host memory shared with the device.
pub mod access;
/// Bus transport collaborator: shared fields, doorbell, ioctl waiting.
pub mod bus;
/// Protocol tunables.
pub mod config;
/// Receive and transmit data path.
pub mod datapath;
/// Decoding of device-to-host messages by message type.
pub mod dispatch;
/// Buffer allocation and DMA mapping collaborator.
pub mod dma;
/// Loopback DMA transfer test.
pub mod dmaxfer;
pub mod error;
/// Flow ring lifecycle state machine.
pub mod flowring;
/// Upward delivery and fault escalation collaborators.
pub mod host;
/// Read/write index publication and ring I/O.
pub mod index;
/// Ioctl control channel.
pub mod ioctl;
pub mod pktid;
/// The protocol object tying everything together.
pub mod proto;
pub mod ring;
pub mod sync;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{ErrorKind, MsgbufError};
pub use datapath::TxRejected;
pub use proto::{Msgbuf, ProtocolStats};
