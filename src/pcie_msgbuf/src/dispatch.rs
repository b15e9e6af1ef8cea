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

//! Device-to-host messages are decoded through a table indexed by the raw
//! message type. The table is built once, at compile time; every slot
//! without a D2H message (host requests, reserved values) decodes to
//! [`D2hMsg::Noop`].

use bytemuck::Pod;
use thiserror::Error;

use crate::wire::{
    IoctlAck, IoctlCmplt, MsgType, RingStatus, RxCmplt, StatusCmplt, TxStatus, WlEvent,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown message type {0:#x}")]
    UnknownType(u8),
    #[error("Message type {msg_type:#x} needs {needed} bytes, slot has {len}")]
    Truncated {
        msg_type: u8,
        needed: usize,
        len: usize,
    },
}

/// A decoded device-to-host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D2hMsg {
    /// Nothing to do: a skipped slot or a type the host never receives.
    Noop,
    GenStatus(StatusCmplt),
    RingStatus(RingStatus),
    FlowRingCreated(StatusCmplt),
    FlowRingDeleted(StatusCmplt),
    FlowRingFlushed(StatusCmplt),
    IoctlAck(IoctlAck),
    IoctlCmplt(IoctlCmplt),
    Event(WlEvent),
    TxStatus(TxStatus),
    RxCmplt(RxCmplt),
    DmaXferCmplt(StatusCmplt),
}

type Decoder = fn(&[u8]) -> Result<D2hMsg, DispatchError>;

fn pod<T: Pod>(slot: &[u8]) -> Result<T, DispatchError> {
    let needed = core::mem::size_of::<T>();
    match slot.get(..needed) {
        Some(bytes) => Ok(bytemuck::pod_read_unaligned(bytes)),
        None => Err(DispatchError::Truncated {
            msg_type: slot.first().copied().unwrap_or(MsgType::NOOP),
            needed,
            len: slot.len(),
        }),
    }
}

fn noop(_: &[u8]) -> Result<D2hMsg, DispatchError> {
    Ok(D2hMsg::Noop)
}

macro_rules! decoders {
    ($($name:ident: $ty:ty => $variant:ident),* $(,)?) => {
        $(
            fn $name(slot: &[u8]) -> Result<D2hMsg, DispatchError> {
                pod::<$ty>(slot).map(D2hMsg::$variant)
            }
        )*
    };
}

decoders! {
    gen_status: StatusCmplt => GenStatus,
    ring_status: RingStatus => RingStatus,
    flow_created: StatusCmplt => FlowRingCreated,
    flow_deleted: StatusCmplt => FlowRingDeleted,
    flow_flushed: StatusCmplt => FlowRingFlushed,
    ioctl_ack: IoctlAck => IoctlAck,
    ioctl_cmplt: IoctlCmplt => IoctlCmplt,
    wl_event: WlEvent => Event,
    tx_status: TxStatus => TxStatus,
    rx_cmplt: RxCmplt => RxCmplt,
    dmaxfer_cmplt: StatusCmplt => DmaXferCmplt,
}

const fn table() -> [Decoder; MsgType::TABLE_LEN] {
    let mut t: [Decoder; MsgType::TABLE_LEN] = [noop as Decoder; MsgType::TABLE_LEN];
    t[MsgType::GenStatus as usize] = gen_status;
    t[MsgType::RingStatus as usize] = ring_status;
    t[MsgType::FlowRingCreateCmplt as usize] = flow_created;
    t[MsgType::FlowRingDeleteCmplt as usize] = flow_deleted;
    t[MsgType::FlowRingFlushCmplt as usize] = flow_flushed;
    t[MsgType::IoctlAck as usize] = ioctl_ack;
    t[MsgType::IoctlCmplt as usize] = ioctl_cmplt;
    t[MsgType::WlEvent as usize] = wl_event;
    t[MsgType::TxStatus as usize] = tx_status;
    t[MsgType::RxCmplt as usize] = rx_cmplt;
    t[MsgType::LpbkDmaxferCmplt as usize] = dmaxfer_cmplt;
    t
}

static DECODERS: [Decoder; MsgType::TABLE_LEN] = table();

impl D2hMsg {
    /// Decodes the slot contents as a message of `msg_type`.
    ///
    /// `msg_type` comes from completion sync rather than `slot[0]`, since a
    /// livelocked slot must decode as [`D2hMsg::Noop`] whatever it holds.
    pub fn decode(msg_type: u8, slot: &[u8]) -> Result<Self, DispatchError> {
        match DECODERS.get(msg_type as usize) {
            Some(decode) => decode(slot),
            None => Err(DispatchError::UnknownType(msg_type)),
        }
    }
}
