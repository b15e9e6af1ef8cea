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

//! Buffer allocation and DMA mapping.
//!
//! Two kinds of memory are involved. Rings, index arrays and scratch
//! buffers are long-lived coherent [`DmaRegion`]s that the protocol reads
//! and writes through [`MemOps`]. Packets are native network buffers
//! ([`PacketBuf`]) that are mapped for one DMA transfer at a time and are
//! otherwise opaque to the protocol.
//!
//! Allocation and mapping failures are backpressure: every caller treats a
//! `None` as "try again later", never as a fatal error.

use crate::access::MemOps;

/// A coherent DMA region: host address for [`MemOps`], bus address for
/// the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmaRegion {
    pub va: u64,
    pub pa: u64,
    pub len: usize,
}

/// Direction of a streaming DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum DmaDir {
    /// Host writes, device reads (tx data, requests).
    ToDevice,
    /// Device writes, host reads (rx buffers, responses, events).
    FromDevice,
}

/// A native packet buffer with reserved headroom.
///
/// Mirrors the usual socket-buffer model: `data()` is the current frame,
/// `push` grows it into the headroom and `pull` strips bytes from its front.
pub trait PacketBuf {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Bytes available in front of `data()`.
    fn headroom(&self) -> usize;

    /// Prepends `n` bytes of headroom to the frame. False if there is not
    /// enough headroom.
    fn push(&mut self, n: usize) -> bool;

    /// Strips `n` bytes from the front of the frame. False if the frame is
    /// shorter than `n`.
    fn pull(&mut self, n: usize) -> bool;

    /// Sets the frame length, bounded by the buffer's capacity.
    fn set_len(&mut self, len: usize);

    /// 802.1d priority of an outgoing frame.
    fn priority(&self) -> u8 {
        0
    }
}

/// Buffer-allocation collaborator.
pub trait DmaOps: MemOps {
    type Pkt: PacketBuf;

    /// Allocates a zeroed coherent region of at least `len` bytes aligned to
    /// `align`.
    fn alloc_coherent(&self, len: usize, align: usize) -> Option<DmaRegion>;

    fn free_coherent(&self, region: DmaRegion);

    /// Allocates a packet whose frame is `len` bytes long.
    fn alloc_pkt(&self, len: usize) -> Option<Self::Pkt>;

    /// Returns a packet to the allocator.
    fn free_pkt(&self, pkt: Self::Pkt) {
        drop(pkt)
    }

    /// Maps the first `len` bytes of the packet's frame for DMA and returns
    /// their bus address.
    fn map(&self, pkt: &Self::Pkt, len: usize, dir: DmaDir) -> Option<u64>;

    fn unmap(&self, pa: u64, len: usize, dir: DmaDir);
}

/// Frees a coherent region when dropped unless dismissed.
///
/// Used while a multi-step setup can still fail half way through.
pub struct RegionGuard<'a, D: DmaOps> {
    dma: &'a D,
    region: Option<DmaRegion>,
}

impl<'a, D: DmaOps> RegionGuard<'a, D> {
    /// Allocates and wraps a region.
    pub fn alloc(dma: &'a D, len: usize, align: usize) -> Option<Self> {
        dma.alloc_coherent(len, align).map(|region| Self {
            dma,
            region: Some(region),
        })
    }

    pub fn region(&self) -> DmaRegion {
        match self.region {
            Some(region) => region,
            None => DmaRegion {
                va: 0,
                pa: 0,
                len: 0,
            },
        }
    }

    /// Keep the region; the caller now owns it.
    pub fn dismiss(mut self) -> DmaRegion {
        let region = self.region();
        self.region = None;
        region
    }
}

impl<D: DmaOps> Drop for RegionGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.dma.free_coherent(region);
        }
    }
}
