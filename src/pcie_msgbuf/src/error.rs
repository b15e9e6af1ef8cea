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

//! Crate-wide error type.
//!
//! Every module owns a small error enum describing its own failures;
//! [`MsgbufError`] aggregates them so protocol entry points can use `?`
//! throughout. [`MsgbufError::kind`] sorts an error into the recovery
//! classes the protocol distinguishes: resource exhaustion is plain
//! backpressure, while desynchronization halts the affected ring and is
//! escalated to the [`FaultHandler`](crate::host::FaultHandler).

use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::dmaxfer::DmaXferError;
use crate::flowring::FlowRingError;
use crate::ioctl::IoctlError;
use crate::pktid::PktIdError;
use crate::ring::RingError;

/// Recovery class of an error or fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Ring full, packet-id pool exhausted or a DMA allocation/mapping
    /// failed. Retry later or drop.
    ResourceExhausted,
    /// Host and device disagree about ring or packet-id state.
    Desync,
    /// A D2H message never finished landing in host memory.
    Livelock,
    /// A control request failed or timed out.
    Control,
    /// The link is down; nothing touches the rings until re-init.
    LinkDown,
    /// Invalid configuration or geometry.
    Config,
    /// The caller passed something the protocol cannot carry.
    InvalidInput,
}

#[derive(Error, Debug)]
pub enum MsgbufError {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),
    #[error("Packet id error: {0}")]
    PktId(#[from] PktIdError),
    #[error("Flow ring error: {0}")]
    FlowRing(#[from] FlowRingError),
    #[error("Ioctl error: {0}")]
    Ioctl(#[from] IoctlError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Loopback transfer error: {0}")]
    DmaXfer(#[from] DmaXferError),
    #[error("Frame of {len} bytes is shorter than an Ethernet header")]
    ShortFrame { len: usize },
    #[error("Link is down")]
    LinkDown,
    #[error("Shared memory access failed")]
    MemAccess,
    #[error("Out of {0}")]
    NoResource(&'static str),
}

impl MsgbufError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MsgbufError::Ring(RingError::NoSpace) => ErrorKind::ResourceExhausted,
            MsgbufError::Ring(RingError::InvalidGeometry { .. }) => ErrorKind::Config,
            MsgbufError::Ring(_) => ErrorKind::Desync,
            MsgbufError::PktId(_) => ErrorKind::Desync,
            MsgbufError::Dispatch(_) => ErrorKind::Desync,
            MsgbufError::FlowRing(_) => ErrorKind::Control,
            MsgbufError::Ioctl(IoctlError::LinkDown) => ErrorKind::LinkDown,
            MsgbufError::Ioctl(IoctlError::TooLarge { .. }) => ErrorKind::InvalidInput,
            MsgbufError::Ioctl(_) => ErrorKind::Control,
            MsgbufError::DmaXfer(DmaXferError::TooLong { .. } | DmaXferError::Empty) => {
                ErrorKind::InvalidInput
            }
            MsgbufError::DmaXfer(_) => ErrorKind::Control,
            MsgbufError::ShortFrame { .. } => ErrorKind::InvalidInput,
            MsgbufError::Config(_) => ErrorKind::Config,
            MsgbufError::LinkDown | MsgbufError::MemAccess => ErrorKind::LinkDown,
            MsgbufError::NoResource(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// True for errors the caller should treat as backpressure.
    pub fn is_backpressure(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhausted
    }
}
