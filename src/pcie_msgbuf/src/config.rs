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

use core::cmp::{max, min};
use core::time::Duration;

use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::ring::MsgRing;
use crate::wire::{
    CtrlBufPost, IOCTL_MAX_INPUT_LEN, IOCTL_MAX_LEN, IoctlCmplt, RingId, RxCmplt, RxPost,
    StatusCmplt, TxPost, TxStatus,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Ring {ring:?} slot of {item_len} bytes cannot hold a {needed} byte message")]
    SlotTooSmall {
        ring: RingId,
        item_len: u16,
        needed: usize,
    },
    #[error("tx start threshold {start} must be below the stop threshold {stop}")]
    TxThresholds { start: u32, stop: u32 },
}

/// Slot count and slot size of one ring.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingGeometry {
    pub max_items: u16,
    pub item_len: u16,
}

impl RingGeometry {
    pub const fn new(max_items: u16, item_len: u16) -> Self {
        Self {
            max_items,
            item_len,
        }
    }

    /// Bytes of ring memory needed.
    pub fn size(&self) -> usize {
        MsgRing::query_size(self.max_items, self.item_len)
    }
}

/// Geometry of every ring the protocol creates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingLayout {
    pub ctrl_submit: RingGeometry,
    pub rxpost: RingGeometry,
    /// Common tx post ring and every flow ring.
    pub txpost: RingGeometry,
    pub ctrl_complete: RingGeometry,
    pub tx_complete: RingGeometry,
    pub rx_complete: RingGeometry,
}

impl Default for RingLayout {
    fn default() -> Self {
        Self {
            ctrl_submit: RingGeometry::new(64, 40),
            rxpost: RingGeometry::new(512, 32),
            txpost: RingGeometry::new(512, 48),
            ctrl_complete: RingGeometry::new(64, 24),
            tx_complete: RingGeometry::new(1024, 16),
            rx_complete: RingGeometry::new(512, 32),
        }
    }
}

impl RingLayout {
    /// Checks that every ring's slots can hold the messages it carries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (RingId::CTRL_SUBMIT, self.ctrl_submit, CtrlBufPost::SIZE),
            (RingId::RXPOST_SUBMIT, self.rxpost, RxPost::SIZE),
            (RingId::TXPOST_SUBMIT, self.txpost, TxPost::SIZE),
            (RingId::CTRL_COMPLETE, self.ctrl_complete, max(IoctlCmplt::SIZE, StatusCmplt::SIZE)),
            (RingId::TX_COMPLETE, self.tx_complete, TxStatus::SIZE),
            (RingId::RX_COMPLETE, self.rx_complete, RxCmplt::SIZE),
        ];
        for (ring, geom, needed) in checks {
            if (geom.item_len as usize) < needed {
                return Err(ConfigError::SlotTooSmall {
                    ring,
                    item_len: geom.item_len,
                    needed,
                });
            }
        }
        Ok(())
    }
}

/// Retry policy of the D2H completion sync.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyncParams {
    /// Marker reads per step.
    pub tries_per_step: u32,
    /// Steps; step `n` ends with a delay of `n * delay_us`.
    pub steps: u32,
    pub delay_us: u32,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            tries_per_step: MsgbufConfig::DEFAULT_SYNC_TRIES,
            steps: MsgbufConfig::DEFAULT_SYNC_STEPS,
            delay_us: MsgbufConfig::DEFAULT_SYNC_DELAY_US,
        }
    }
}

/// The complete set of configuration needed to attach the protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MsgbufConfig {
    max_pktids: u32,
    rx_buf_size: u16,
    ioctl_resp_buf_size: u16,
    /// Used when the device does not advertise its own limit.
    max_rxbufpost: u16,
    rxbufpost_threshold: u16,
    rx_buf_burst: u16,
    max_event_bufs: u16,
    max_ioctlresp_bufs: u16,
    txp_threshold: u16,
    tx_stop_threshold: u32,
    tx_start_threshold: u32,
    /// Milliseconds.
    ioctl_timeout: u16,
    ioctl_max_len: usize,
    ioctl_max_input_len: usize,
    max_flow_rings: u16,
    rx_chaining: bool,
    rx_chain_max: u16,
    rx_budget: u32,
    tx_budget: u32,
    ctrl_budget: u32,
    use_dma_indices: bool,
    sync: SyncParams,
    rings: RingLayout,
}

impl MsgbufConfig {
    /// The default packet-id pool capacity
    pub const DEFAULT_MAX_PKTIDS: u32 = 8192;
    /// The minimum packet-id pool capacity
    pub const MIN_MAX_PKTIDS: u32 = 4;
    /// The largest pool; id 0xFFFE is the ioctl sentinel and must never be issued
    pub const MAX_MAX_PKTIDS: u32 = 0xFFFD;
    pub const DEFAULT_RX_BUF_SIZE: u16 = 2048;
    pub const DEFAULT_IOCTL_RESP_BUF_SIZE: u16 = 8192;
    pub const DEFAULT_MAX_RXBUFPOST: u16 = 256;
    pub const DEFAULT_RXBUFPOST_THRESHOLD: u16 = 32;
    pub const DEFAULT_RX_BUF_BURST: u16 = 16;
    pub const DEFAULT_MAX_EVENT_BUFS: u16 = 8;
    pub const DEFAULT_MAX_IOCTLRESP_BUFS: u16 = 8;
    /// The default number of tx posts batched before ringing the doorbell
    pub const DEFAULT_TXP_THRESHOLD: u16 = 48;
    pub const DEFAULT_TX_STOP_THRESHOLD: u32 = 200;
    pub const DEFAULT_TX_START_THRESHOLD: u32 = 100;
    /// The default ioctl response timeout in milliseconds
    pub const DEFAULT_IOCTL_TIMEOUT: u16 = 2000;
    /// The minimum ioctl response timeout in milliseconds
    pub const MIN_IOCTL_TIMEOUT: u16 = 1;
    /// The maximum ioctl response timeout in milliseconds
    pub const MAX_IOCTL_TIMEOUT: u16 = u16::MAX;
    pub const DEFAULT_MAX_FLOW_RINGS: u16 = 32;
    pub const DEFAULT_RX_CHAIN_MAX: u16 = 64;
    pub const DEFAULT_RX_BUDGET: u32 = 128;
    pub const DEFAULT_TX_BUDGET: u32 = 256;
    pub const DEFAULT_CTRL_BUDGET: u32 = 64;
    pub const DEFAULT_SYNC_TRIES: u32 = 512;
    pub const DEFAULT_SYNC_STEPS: u32 = 3;
    pub const DEFAULT_SYNC_DELAY_US: u32 = 50;

    pub fn max_pktids(&self) -> u32 {
        self.max_pktids
    }

    /// Sets the packet-id pool capacity, clamped to
    /// [`Self::MIN_MAX_PKTIDS`]..=[`Self::MAX_MAX_PKTIDS`]. 0 selects the default.
    pub fn set_max_pktids(&mut self, max_pktids: u32) -> &mut Self {
        self.max_pktids = match max_pktids {
            0 => Self::DEFAULT_MAX_PKTIDS,
            n => min(Self::MAX_MAX_PKTIDS, max(n, Self::MIN_MAX_PKTIDS)),
        };
        self
    }

    pub fn rx_buf_size(&self) -> u16 {
        self.rx_buf_size
    }

    pub fn set_rx_buf_size(&mut self, size: u16) -> &mut Self {
        self.rx_buf_size = if size == 0 {
            Self::DEFAULT_RX_BUF_SIZE
        } else {
            size
        };
        self
    }

    pub fn ioctl_resp_buf_size(&self) -> u16 {
        self.ioctl_resp_buf_size
    }

    pub fn set_ioctl_resp_buf_size(&mut self, size: u16) -> &mut Self {
        self.ioctl_resp_buf_size = if size == 0 {
            Self::DEFAULT_IOCTL_RESP_BUF_SIZE
        } else {
            size
        };
        self
    }

    pub fn max_rxbufpost(&self) -> u16 {
        self.max_rxbufpost
    }

    pub fn set_max_rxbufpost(&mut self, count: u16) -> &mut Self {
        self.max_rxbufpost = if count == 0 {
            Self::DEFAULT_MAX_RXBUFPOST
        } else {
            count
        };
        self
    }

    pub fn rxbufpost_threshold(&self) -> u16 {
        self.rxbufpost_threshold
    }

    pub fn set_rxbufpost_threshold(&mut self, threshold: u16) -> &mut Self {
        self.rxbufpost_threshold = threshold;
        self
    }

    pub fn rx_buf_burst(&self) -> u16 {
        self.rx_buf_burst
    }

    pub fn set_rx_buf_burst(&mut self, burst: u16) -> &mut Self {
        self.rx_buf_burst = max(burst, 1);
        self
    }

    pub fn max_event_bufs(&self) -> u16 {
        self.max_event_bufs
    }

    pub fn set_max_event_bufs(&mut self, count: u16) -> &mut Self {
        self.max_event_bufs = count;
        self
    }

    pub fn max_ioctlresp_bufs(&self) -> u16 {
        self.max_ioctlresp_bufs
    }

    pub fn set_max_ioctlresp_bufs(&mut self, count: u16) -> &mut Self {
        self.max_ioctlresp_bufs = count;
        self
    }

    pub fn txp_threshold(&self) -> u16 {
        self.txp_threshold
    }

    /// Sets the number of tx posts batched per doorbell. 0 selects the default.
    pub fn set_txp_threshold(&mut self, threshold: u16) -> &mut Self {
        self.txp_threshold = if threshold == 0 {
            Self::DEFAULT_TXP_THRESHOLD
        } else {
            threshold
        };
        self
    }

    pub fn tx_stop_threshold(&self) -> u32 {
        self.tx_stop_threshold
    }

    pub fn tx_start_threshold(&self) -> u32 {
        self.tx_start_threshold
    }

    /// Sets the in-flight tx counts at which the upper layer is told to
    /// stop and to resume its queues.
    pub fn set_tx_flow_thresholds(
        &mut self,
        stop: u32,
        start: u32,
    ) -> Result<&mut Self, ConfigError> {
        if start >= stop {
            return Err(ConfigError::TxThresholds { start, stop });
        }
        self.tx_stop_threshold = stop;
        self.tx_start_threshold = start;
        Ok(self)
    }

    pub fn ioctl_timeout(&self) -> Duration {
        Duration::from_millis(self.ioctl_timeout as u64)
    }

    /// Sets the ioctl response timeout, clamped to
    /// [`Self::MIN_IOCTL_TIMEOUT`]..=[`Self::MAX_IOCTL_TIMEOUT`] milliseconds.
    /// A zero duration selects the default.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn set_ioctl_timeout(&mut self, timeout: Duration) -> &mut Self {
        match timeout.as_millis() {
            0 => self.ioctl_timeout = Self::DEFAULT_IOCTL_TIMEOUT,
            1.. => {
                self.ioctl_timeout = min(
                    Self::MAX_IOCTL_TIMEOUT.into(),
                    max(timeout.as_millis(), Self::MIN_IOCTL_TIMEOUT.into()),
                ) as u16
            }
        }
        self
    }

    pub fn ioctl_max_len(&self) -> usize {
        self.ioctl_max_len
    }

    pub fn ioctl_max_input_len(&self) -> usize {
        self.ioctl_max_input_len
    }

    pub fn max_flow_rings(&self) -> u16 {
        self.max_flow_rings
    }

    pub fn set_max_flow_rings(&mut self, count: u16) -> &mut Self {
        self.max_flow_rings = count;
        self
    }

    pub fn rx_chaining(&self) -> bool {
        self.rx_chaining
    }

    pub fn rx_chain_max(&self) -> u16 {
        self.rx_chain_max
    }

    pub fn set_rx_chaining(&mut self, enabled: bool, max_len: u16) -> &mut Self {
        self.rx_chaining = enabled;
        self.rx_chain_max = max(max_len, 1);
        self
    }

    pub fn rx_budget(&self) -> u32 {
        self.rx_budget
    }

    pub fn tx_budget(&self) -> u32 {
        self.tx_budget
    }

    pub fn ctrl_budget(&self) -> u32 {
        self.ctrl_budget
    }

    /// Sets the per-call item budgets of the completion loops. 0 keeps the
    /// current value.
    pub fn set_budgets(&mut self, rx: u32, tx: u32, ctrl: u32) -> &mut Self {
        if rx != 0 {
            self.rx_budget = rx;
        }
        if tx != 0 {
            self.tx_budget = tx;
        }
        if ctrl != 0 {
            self.ctrl_budget = ctrl;
        }
        self
    }

    pub fn use_dma_indices(&self) -> bool {
        self.use_dma_indices
    }

    /// Allows exchanging ring indices through host memory when the device
    /// supports it.
    pub fn set_use_dma_indices(&mut self, enabled: bool) -> &mut Self {
        self.use_dma_indices = enabled;
        self
    }

    pub fn sync(&self) -> SyncParams {
        self.sync
    }

    pub fn set_sync(&mut self, params: SyncParams) -> &mut Self {
        self.sync = SyncParams {
            tries_per_step: max(params.tries_per_step, 1),
            steps: max(params.steps, 1),
            delay_us: params.delay_us,
        };
        self
    }

    pub fn rings(&self) -> RingLayout {
        self.rings
    }

    pub fn set_rings(&mut self, rings: RingLayout) -> Result<&mut Self, ConfigError> {
        rings.validate()?;
        self.rings = rings;
        Ok(self)
    }
}

impl Default for MsgbufConfig {
    fn default() -> Self {
        Self {
            max_pktids: Self::DEFAULT_MAX_PKTIDS,
            rx_buf_size: Self::DEFAULT_RX_BUF_SIZE,
            ioctl_resp_buf_size: Self::DEFAULT_IOCTL_RESP_BUF_SIZE,
            max_rxbufpost: Self::DEFAULT_MAX_RXBUFPOST,
            rxbufpost_threshold: Self::DEFAULT_RXBUFPOST_THRESHOLD,
            rx_buf_burst: Self::DEFAULT_RX_BUF_BURST,
            max_event_bufs: Self::DEFAULT_MAX_EVENT_BUFS,
            max_ioctlresp_bufs: Self::DEFAULT_MAX_IOCTLRESP_BUFS,
            txp_threshold: Self::DEFAULT_TXP_THRESHOLD,
            tx_stop_threshold: Self::DEFAULT_TX_STOP_THRESHOLD,
            tx_start_threshold: Self::DEFAULT_TX_START_THRESHOLD,
            ioctl_timeout: Self::DEFAULT_IOCTL_TIMEOUT,
            ioctl_max_len: IOCTL_MAX_LEN,
            ioctl_max_input_len: IOCTL_MAX_INPUT_LEN,
            max_flow_rings: Self::DEFAULT_MAX_FLOW_RINGS,
            rx_chaining: true,
            rx_chain_max: Self::DEFAULT_RX_CHAIN_MAX,
            rx_budget: Self::DEFAULT_RX_BUDGET,
            tx_budget: Self::DEFAULT_TX_BUDGET,
            ctrl_budget: Self::DEFAULT_CTRL_BUDGET,
            use_dma_indices: true,
            sync: SyncParams::default(),
            rings: RingLayout::default(),
        }
    }
}
