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

//! Memory Access Traits for Ring Operations
//!
//! This module defines the [`MemOps`] trait that abstracts how the protocol
//! touches host memory that is shared with the device: ring slots, DMA'd
//! index arrays and the ioctl scratch buffer. Addresses are host virtual
//! addresses as handed out by [`DmaOps`](crate::dma::DmaOps); the device
//! sees the matching bus address of each region instead.
//!
//! The device writes into this memory behind the CPU's back, so
//! implementations must not let the compiler cache or elide accesses, and
//! on platforms without coherent DMA the cache maintenance hooks must do
//! real work.

use bytemuck::Pod;

/// Backend-provided memory access for rings shared with the device.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Addresses passed to methods are valid for the duration of the call
/// - Memory ordering guarantees are upheld as documented
/// - Reads and writes don't cause undefined behavior (alignment, validity)
pub trait MemOps {
    type Error;

    /// Read bytes from shared memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to shared memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u32 with acquire semantics.
    ///
    /// Used for index array entries and D2H sync markers, both of which the
    /// device updates by DMA.
    ///
    /// # Safety
    ///
    /// `addr` must translate to a valid, aligned `AtomicU32` in shared memory.
    fn load_acquire(&self, addr: u64) -> Result<u32, Self::Error>;

    /// Store a u32 with release semantics.
    ///
    /// # Safety
    ///
    /// `addr` must translate to a valid, aligned `AtomicU32` in shared memory.
    fn store_release(&self, addr: u64, val: u32) -> Result<(), Self::Error>;

    /// Write back CPU caches for `[addr, addr + len)` so the device sees the
    /// host's writes. No-op on cache-coherent platforms.
    fn cache_flush(&self, _addr: u64, _len: usize) {}

    /// Discard CPU cache lines for `[addr, addr + len)` so the next read
    /// observes what the device wrote. No-op on cache-coherent platforms.
    fn cache_invalidate(&self, _addr: u64, _len: usize) {}

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }

    /// Zero `len` bytes starting at `addr`.
    fn zero(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
        const CHUNK: [u8; 64] = [0; 64];
        let mut off = 0;
        while off < len {
            let n = core::cmp::min(CHUNK.len(), len - off);
            self.write(addr + off as u64, &CHUNK[..n])?;
            off += n;
        }
        Ok(())
    }
}
