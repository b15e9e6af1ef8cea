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

//! Message Ring Wire Format
//!
//! Every ring slot holds exactly one message. All messages start with the
//! same 8-byte [`CmnMsgHdr`]; device-to-host completions follow it with a
//! 4-byte [`ComplHdr`]. Slot sizes are fixed per ring and are at least the
//! size of the largest message that ring carries.
//!
//! ```text
//!  0        1        2        3        4                                8
//!  +--------+--------+--------+--------+--------------------------------+
//!  |msg_type| if_id  | flags  | epoch  |           request_id           |
//!  +--------+--------+--------+--------+--------------------------------+
//!  |     status      |  flow_ring_id   |   (completions only)
//!  +-----------------+-----------------+
//!  |  message specific payload ...     |
//!  |                  last word: sync marker (D2H, sequence mode)        |
//! ```
//!
//! `request_id` carries a packet id for pool-managed buffers, the control
//! sentinel [`IOCTL_REQ_PKTID`] for ioctl requests, or 0.
//!
//! Fields are little-endian. The layouts are plain `#[repr(C)]` Pod
//! structs, so the host is assumed to be little-endian as well.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// D2H epoch modulus used by both sync strategies.
pub const EPOCH_MODULO: u32 = 253;
/// Initial expected epoch counter of a D2H ring; the first expected
/// marker is therefore `254 % 253 == 1`.
pub const EPOCH_INIT: u32 = 254;

/// Never a valid packet id.
pub const PKTID_INVALID: u32 = 0;
/// Request id of ioctl requests, whose buffer is not pool managed.
pub const IOCTL_REQ_PKTID: u32 = 0xFFFE;
/// Request id of loopback DMA requests.
pub const DMAXFER_REQ_ID: u32 = 0x1234;

/// Largest ioctl payload the device accepts.
pub const IOCTL_MAX_LEN: usize = 8192;
/// Largest ioctl input the device copies from the request buffer.
pub const IOCTL_MAX_INPUT_LEN: usize = 1518;
/// Size of the ioctl request buffer: payload plus a small header.
pub const IOCTL_REQ_BUF_LEN: usize = 8 + IOCTL_MAX_LEN;
/// Size of the D2H scratch buffer whose address is given to the device.
pub const D2H_SCRATCH_LEN: usize = 8;
/// Largest loopback DMA transfer.
pub const DMAXFER_MAX_LEN: u32 = 0x40_0000;

pub const ETHER_ADDR_LEN: usize = 6;
pub const ETHER_HDR_LEN: usize = 14;
pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

/// Identity of a ring: one of the fixed system rings or a flow ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId(pub u16);

impl RingId {
    pub const CTRL_SUBMIT: Self = Self(0);
    pub const RXPOST_SUBMIT: Self = Self(1);
    pub const CTRL_COMPLETE: Self = Self(2);
    pub const TX_COMPLETE: Self = Self(3);
    pub const RX_COMPLETE: Self = Self(4);
    /// Common tx post ring (push mode) and first flow ring.
    pub const TXPOST_SUBMIT: Self = Self(5);

    /// Number of fixed H2D submission rings.
    pub const H2D_COMMON: u16 = 2;
    /// Number of fixed D2H completion rings.
    pub const D2H_COMMON: u16 = 3;
    /// Number of fixed rings preceding the tx rings.
    pub const COMMON: u16 = 5;
    /// Lowest flow id. Flow ids below this name the common rings.
    pub const FIRST_FLOW_ID: u16 = Self::H2D_COMMON;

    /// Ring backing `flow_id`, or `None` for ids below [`Self::FIRST_FLOW_ID`].
    pub fn for_flow(flow_id: u16) -> Option<Self> {
        let off = flow_id.checked_sub(Self::FIRST_FLOW_ID)?;
        Self::TXPOST_SUBMIT.0.checked_add(off).map(Self)
    }

    pub fn is_d2h(self) -> bool {
        (Self::CTRL_COMPLETE.0..=Self::RX_COMPLETE.0).contains(&self.0)
    }

    /// Entry of this ring in the H2D index arrays. The D2H rings are
    /// skipped, so the tx rings follow the two common submission rings.
    pub fn h2d_index_slot(self) -> usize {
        if self.0 < Self::COMMON {
            self.0 as usize
        } else {
            (self.0 - Self::COMMON + Self::H2D_COMMON) as usize
        }
    }

    /// Entry of this ring in the D2H index arrays.
    pub fn d2h_index_slot(self) -> usize {
        self.0.saturating_sub(Self::H2D_COMMON) as usize
    }
}

/// Message type tag, the first byte of every message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum MsgType {
    GenStatus = 0x01,
    RingStatus = 0x02,
    FlowRingCreate = 0x03,
    FlowRingCreateCmplt = 0x04,
    FlowRingDelete = 0x05,
    FlowRingDeleteCmplt = 0x06,
    FlowRingFlush = 0x07,
    FlowRingFlushCmplt = 0x08,
    IoctlReq = 0x09,
    IoctlAck = 0x0A,
    IoctlRespBufPost = 0x0B,
    IoctlCmplt = 0x0C,
    EventBufPost = 0x0D,
    WlEvent = 0x0E,
    TxPost = 0x0F,
    TxStatus = 0x10,
    RxBufPost = 0x11,
    RxCmplt = 0x12,
    LpbkDmaxfer = 0x13,
    LpbkDmaxferCmplt = 0x14,
}

impl MsgType {
    /// Raw type reported for a message that could not be synced.
    pub const NOOP: u8 = 0;
    /// Raw types at or above this value are protocol errors.
    pub const TABLE_LEN: usize = 22;

    /// True for messages the device sends to the host.
    pub fn is_d2h(self) -> bool {
        matches!(
            self,
            MsgType::GenStatus
                | MsgType::RingStatus
                | MsgType::FlowRingCreateCmplt
                | MsgType::FlowRingDeleteCmplt
                | MsgType::FlowRingFlushCmplt
                | MsgType::IoctlAck
                | MsgType::IoctlCmplt
                | MsgType::WlEvent
                | MsgType::TxStatus
                | MsgType::RxCmplt
                | MsgType::LpbkDmaxferCmplt
        )
    }
}

impl TryFrom<u8> for MsgType {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        Ok(match raw {
            0x01 => MsgType::GenStatus,
            0x02 => MsgType::RingStatus,
            0x03 => MsgType::FlowRingCreate,
            0x04 => MsgType::FlowRingCreateCmplt,
            0x05 => MsgType::FlowRingDelete,
            0x06 => MsgType::FlowRingDeleteCmplt,
            0x07 => MsgType::FlowRingFlush,
            0x08 => MsgType::FlowRingFlushCmplt,
            0x09 => MsgType::IoctlReq,
            0x0A => MsgType::IoctlAck,
            0x0B => MsgType::IoctlRespBufPost,
            0x0C => MsgType::IoctlCmplt,
            0x0D => MsgType::EventBufPost,
            0x0E => MsgType::WlEvent,
            0x0F => MsgType::TxPost,
            0x10 => MsgType::TxStatus,
            0x11 => MsgType::RxBufPost,
            0x12 => MsgType::RxCmplt,
            0x13 => MsgType::LpbkDmaxfer,
            0x14 => MsgType::LpbkDmaxferCmplt,
            other => return Err(other),
        })
    }
}

bitflags! {
    /// Capability flags the device advertises in its shared structure.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SharedFlags: u32 {
        /// Ring indices are exchanged through host-resident arrays.
        const DMA_INDEX       = 0x1_0000;
        /// D2H messages carry a sequence marker in their last word.
        const D2H_SYNC_SEQNUM = 0x2_0000;
        /// D2H messages carry an epoch byte and XOR to zero.
        const D2H_SYNC_XORCSUM = 0x4_0000;
    }
}

bitflags! {
    /// Flags byte of a [`TxPost`].
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TxFlags: u8 {
        const FRAME_802_3  = 0x01;
        const FRAME_802_11 = 0x02;
        const PRIO_MASK    = 0xE0;
    }
}

impl TxFlags {
    pub const PRIO_SHIFT: u8 = 5;

    /// Ethernet frame flags carrying 802.1d priority `prio`.
    pub fn ethernet(prio: u8) -> Self {
        Self::FRAME_802_3 | Self::from_bits_truncate((prio & 0x7) << Self::PRIO_SHIFT)
    }

    pub fn priority(self) -> u8 {
        (self & Self::PRIO_MASK).bits() >> Self::PRIO_SHIFT
    }
}

/// 64-bit bus address split into two words.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Addr64 {
    pub low: u32,
    pub high: u32,
}

impl From<u64> for Addr64 {
    fn from(addr: u64) -> Self {
        Self {
            low: addr as u32,
            high: (addr >> 32) as u32,
        }
    }
}

impl From<Addr64> for u64 {
    fn from(addr: Addr64) -> Self {
        ((addr.high as u64) << 32) | addr.low as u64
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct CmnMsgHdr {
    pub msg_type: u8,
    /// Logical interface index.
    pub if_id: u8,
    pub flags: u8,
    /// Epoch byte checked by the checksum sync strategy.
    pub epoch: u8,
    pub request_id: u32,
}

const _: () = assert!(CmnMsgHdr::SIZE == 8);
const _: () = assert!(CmnMsgHdr::EPOCH_OFFSET == 3);

impl CmnMsgHdr {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const EPOCH_OFFSET: usize = core::mem::offset_of!(Self, epoch);

    pub fn new(msg_type: MsgType, if_id: u8, request_id: u32) -> Self {
        Self {
            msg_type: msg_type as u8,
            if_id,
            flags: 0,
            epoch: 0,
            request_id,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct ComplHdr {
    pub status: u16,
    pub flow_ring_id: u16,
}

const _: () = assert!(core::mem::size_of::<ComplHdr>() == 4);

// --- host to device -------------------------------------------------------

/// Transmit post, one per frame on a flow ring (or the common tx ring).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct TxPost {
    pub cmn: CmnMsgHdr,
    /// Ethernet header of the frame; the posted data starts after it.
    pub txhdr: [u8; ETHER_HDR_LEN],
    pub flags: u8,
    pub seg_cnt: u8,
    pub metadata_buf_addr: Addr64,
    pub data_buf_addr: Addr64,
    pub metadata_buf_len: u16,
    pub data_len: u16,
    pub rsvd: u32,
}

const _: () = assert!(TxPost::SIZE == 48);
const _: () = assert!(core::mem::offset_of!(TxPost, flags) == 22);
const _: () = assert!(core::mem::offset_of!(TxPost, metadata_buf_addr) == 24);
const _: () = assert!(core::mem::offset_of!(TxPost, metadata_buf_len) == 40);

impl TxPost {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Receive buffer post.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct RxPost {
    pub cmn: CmnMsgHdr,
    pub metadata_buf_len: u16,
    pub data_buf_len: u16,
    pub rsvd: u32,
    pub metadata_buf_addr: Addr64,
    pub data_buf_addr: Addr64,
}

const _: () = assert!(RxPost::SIZE == 32);
const _: () = assert!(core::mem::offset_of!(RxPost, data_buf_addr) == 24);

impl RxPost {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Event or ioctl response buffer post on the control ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct CtrlBufPost {
    pub cmn: CmnMsgHdr,
    pub host_buf_len: u16,
    pub rsvd: [u16; 3],
    pub host_buf_addr: Addr64,
    pub rsvd2: [u32; 4],
}

const _: () = assert!(CtrlBufPost::SIZE == 40);
const _: () = assert!(core::mem::offset_of!(CtrlBufPost, host_buf_addr) == 16);

impl CtrlBufPost {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct IoctlReq {
    pub cmn: CmnMsgHdr,
    pub cmd: u32,
    /// Bytes the caller is prepared to receive.
    pub output_buf_len: u16,
    pub trans_id: u16,
    /// Bytes of the request buffer the device should read.
    pub input_buf_len: u16,
    pub rsvd: u16,
    pub host_input_buf_addr: Addr64,
    pub rsvd2: [u32; 3],
}

const _: () = assert!(IoctlReq::SIZE == 40);
const _: () = assert!(core::mem::offset_of!(IoctlReq, host_input_buf_addr) == 20);

impl IoctlReq {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct FlowRingCreateReq {
    pub cmn: CmnMsgHdr,
    pub da: [u8; ETHER_ADDR_LEN],
    pub sa: [u8; ETHER_ADDR_LEN],
    pub tid: u8,
    pub if_flags: u8,
    pub flow_ring_id: u16,
    pub tc: u8,
    pub priority: u8,
    pub int_vector: u16,
    pub max_items: u16,
    pub len_item: u16,
    pub flow_ring_addr: Addr64,
}

const _: () = assert!(FlowRingCreateReq::SIZE == 40);
const _: () = assert!(core::mem::offset_of!(FlowRingCreateReq, flow_ring_id) == 22);
const _: () = assert!(core::mem::offset_of!(FlowRingCreateReq, flow_ring_addr) == 32);

impl FlowRingCreateReq {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Flow ring delete or flush request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct FlowRingCtlReq {
    pub cmn: CmnMsgHdr,
    pub flow_ring_id: u16,
    pub reason: u16,
    pub rsvd: [u32; 7],
}

const _: () = assert!(FlowRingCtlReq::SIZE == 40);

impl FlowRingCtlReq {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct DmaXferReq {
    pub cmn: CmnMsgHdr,
    pub host_input_buf_addr: Addr64,
    pub host_output_buf_addr: Addr64,
    pub xfer_len: u32,
    pub src_delay: u32,
    pub dest_delay: u32,
    pub rsvd: u32,
}

const _: () = assert!(DmaXferReq::SIZE == 40);

impl DmaXferReq {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

// --- device to host -------------------------------------------------------

/// Transmit completion. In sequence-sync mode the last word doubles as the
/// sync marker, so the completion status lives in [`ComplHdr::status`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct TxStatus {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub metadata_len: u16,
    pub tx_status: u16,
}

const _: () = assert!(TxStatus::SIZE == 16);

impl TxStatus {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct RxCmplt {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub metadata_len: u16,
    pub data_len: u16,
    /// Offset of the frame in the posted buffer; 0 means "use the host
    /// configured rx data offset".
    pub data_offset: u16,
    pub flags: u16,
    pub rx_status_0: u32,
    pub rx_status_1: u32,
    pub marker: u32,
}

const _: () = assert!(RxCmplt::SIZE == 32);
const _: () = assert!(core::mem::offset_of!(RxCmplt, data_offset) == 16);

impl RxCmplt {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct IoctlCmplt {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub resp_len: u16,
    pub trans_id: u16,
    pub cmd: u32,
    pub marker: u32,
}

const _: () = assert!(IoctlCmplt::SIZE == 24);

impl IoctlCmplt {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct IoctlAck {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub cmd: u32,
    pub rsvd: u32,
    pub marker: u32,
}

const _: () = assert!(IoctlAck::SIZE == 24);

impl IoctlAck {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct WlEvent {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub event_data_len: u16,
    pub seqnum: u16,
    pub rsvd: u32,
    pub marker: u32,
}

const _: () = assert!(WlEvent::SIZE == 24);

impl WlEvent {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Generic status completion: general status, flow ring create/delete/flush
/// responses and loopback DMA completion.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct StatusCmplt {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub rsvd: [u32; 2],
    pub marker: u32,
}

const _: () = assert!(StatusCmplt::SIZE == 24);

impl StatusCmplt {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct RingStatus {
    pub cmn: CmnMsgHdr,
    pub compl: ComplHdr,
    pub write_idx: u16,
    pub rsvd: u16,
    pub rsvd2: u32,
    pub marker: u32,
}

const _: () = assert!(RingStatus::SIZE == 24);

impl RingStatus {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}
