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

//! Flow Ring Lifecycle
//!
//! Each traffic flow gets its own H2D ring, created and destroyed through
//! control-ring round trips. This module is the per-flow state machine;
//! sending the requests and allocating ring memory is the protocol's job.
//!
//! ```text
//!                 create req              create ok
//!   Uncreated ----------------> CreatePending ----------> Active <--+
//!       ^                            |                    |  |      | flush req/rsp
//!       +------- create failed ------+                    |  +------+
//!                                               delete req|
//!                                                         v
//!   Deleted <-------------- delete ok -------------- DeletePending
//! ```
//!
//! A failed delete puts the flow back to `Active`. At most one request is
//! outstanding per flow: a flush blocks a delete until it completes and
//! vice versa. A `Deleted` flow id may be created again.

use alloc::vec::Vec;

use log::debug;
use thiserror::Error;

use crate::ring::MsgRing;
use crate::wire::{ETHER_ADDR_LEN, RingId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum FlowRingState {
    Uncreated,
    CreatePending,
    Active,
    DeletePending,
    Deleted,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowRingError {
    #[error("Flow id {0} is out of range")]
    UnknownFlow(u16),
    #[error("Flow {flow_id}: cannot {op} while {state:?}")]
    InvalidTransition {
        flow_id: u16,
        state: FlowRingState,
        op: &'static str,
    },
    #[error("Flow {0} already has a request outstanding")]
    Busy(u16),
}

/// Peer addressing of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowInfo {
    pub ifidx: u8,
    pub tid: u8,
    pub sa: [u8; ETHER_ADDR_LEN],
    pub da: [u8; ETHER_ADDR_LEN],
}

#[derive(Debug)]
pub struct FlowRingNode {
    flow_id: u16,
    info: FlowInfo,
    state: FlowRingState,
    flush_pending: bool,
    ring: Option<MsgRing>,
}

impl FlowRingNode {
    fn new(flow_id: u16) -> Self {
        Self {
            flow_id,
            info: FlowInfo::default(),
            state: FlowRingState::Uncreated,
            flush_pending: false,
            ring: None,
        }
    }

    pub fn flow_id(&self) -> u16 {
        self.flow_id
    }

    pub fn info(&self) -> &FlowInfo {
        &self.info
    }

    pub fn state(&self) -> FlowRingState {
        self.state
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub fn ring(&self) -> Option<&MsgRing> {
        self.ring.as_ref()
    }

    fn invalid(&self, op: &'static str) -> FlowRingError {
        FlowRingError::InvalidTransition {
            flow_id: self.flow_id,
            state: self.state,
            op,
        }
    }

    fn set_state(&mut self, state: FlowRingState) {
        debug!("flow {}: {:?} -> {:?}", self.flow_id, self.state, state);
        self.state = state;
    }
}

/// Outcome of a create response.
#[derive(Debug)]
pub enum CreateOutcome {
    Active,
    /// The device refused; the ring must be freed.
    Failed(MsgRing),
}

/// Outcome of a delete response.
#[derive(Debug)]
pub enum DeleteOutcome {
    /// The ring is gone on the device side and must be freed.
    Deleted(MsgRing),
    /// The device refused; the ring stays active.
    Refused,
}

/// All flow rings, indexed by flow id.
#[derive(Debug)]
pub struct FlowRingTable {
    nodes: Vec<FlowRingNode>,
}

impl FlowRingTable {
    /// Table for flow ids `FIRST_FLOW_ID..FIRST_FLOW_ID + max_flows`.
    pub fn new(max_flows: u16) -> Self {
        let first = RingId::FIRST_FLOW_ID;
        Self {
            nodes: (first..first.saturating_add(max_flows))
                .map(FlowRingNode::new)
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, flow_id: u16) -> Result<&FlowRingNode, FlowRingError> {
        flow_id
            .checked_sub(RingId::FIRST_FLOW_ID)
            .and_then(|i| self.nodes.get(i as usize))
            .ok_or(FlowRingError::UnknownFlow(flow_id))
    }

    fn get_mut(&mut self, flow_id: u16) -> Result<&mut FlowRingNode, FlowRingError> {
        flow_id
            .checked_sub(RingId::FIRST_FLOW_ID)
            .and_then(|i| self.nodes.get_mut(i as usize))
            .ok_or(FlowRingError::UnknownFlow(flow_id))
    }

    pub fn state(&self, flow_id: u16) -> Result<FlowRingState, FlowRingError> {
        self.get(flow_id).map(FlowRingNode::state)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowRingNode> {
        self.nodes.iter()
    }

    /// Fails unless `flow_id` may be created.
    pub fn check_create(&self, flow_id: u16) -> Result<(), FlowRingError> {
        let node = self.get(flow_id)?;
        match node.state {
            FlowRingState::Uncreated | FlowRingState::Deleted => Ok(()),
            _ => Err(node.invalid("create")),
        }
    }

    /// `Uncreated | Deleted -> CreatePending`, taking ownership of the ring.
    /// On error the ring is handed back.
    pub fn begin_create(
        &mut self,
        flow_id: u16,
        info: FlowInfo,
        ring: MsgRing,
    ) -> Result<(), (FlowRingError, MsgRing)> {
        if let Err(e) = self.check_create(flow_id) {
            return Err((e, ring));
        }
        let node = match self.get_mut(flow_id) {
            Ok(node) => node,
            Err(e) => return Err((e, ring)),
        };
        node.info = info;
        node.ring = Some(ring);
        node.flush_pending = false;
        node.set_state(FlowRingState::CreatePending);
        Ok(())
    }

    /// Undoes [`begin_create`](Self::begin_create) when the request could
    /// not be sent.
    pub fn abort_create(&mut self, flow_id: u16) -> Option<MsgRing> {
        let node = self.get_mut(flow_id).ok()?;
        if node.state != FlowRingState::CreatePending {
            return None;
        }
        node.set_state(FlowRingState::Uncreated);
        node.ring.take()
    }

    pub fn on_create_response(
        &mut self,
        flow_id: u16,
        status: u16,
    ) -> Result<CreateOutcome, FlowRingError> {
        let node = self.get_mut(flow_id)?;
        if node.state != FlowRingState::CreatePending {
            return Err(node.invalid("complete create"));
        }
        if status == 0 {
            node.set_state(FlowRingState::Active);
            return Ok(CreateOutcome::Active);
        }

        node.set_state(FlowRingState::Uncreated);
        match node.ring.take() {
            Some(ring) => Ok(CreateOutcome::Failed(ring)),
            None => Err(node.invalid("fail create")),
        }
    }

    /// `Active -> DeletePending`.
    pub fn begin_delete(&mut self, flow_id: u16) -> Result<(), FlowRingError> {
        let node = self.get_mut(flow_id)?;
        if node.state != FlowRingState::Active {
            return Err(node.invalid("delete"));
        }
        if node.flush_pending {
            return Err(FlowRingError::Busy(flow_id));
        }
        node.set_state(FlowRingState::DeletePending);
        Ok(())
    }

    pub fn abort_delete(&mut self, flow_id: u16) {
        if let Ok(node) = self.get_mut(flow_id)
            && node.state == FlowRingState::DeletePending
        {
            node.set_state(FlowRingState::Active);
        }
    }

    pub fn on_delete_response(
        &mut self,
        flow_id: u16,
        status: u16,
    ) -> Result<DeleteOutcome, FlowRingError> {
        let node = self.get_mut(flow_id)?;
        if node.state != FlowRingState::DeletePending {
            return Err(node.invalid("complete delete"));
        }
        if status != 0 {
            node.set_state(FlowRingState::Active);
            return Ok(DeleteOutcome::Refused);
        }

        node.set_state(FlowRingState::Deleted);
        match node.ring.take() {
            Some(ring) => Ok(DeleteOutcome::Deleted(ring)),
            None => Err(node.invalid("finish delete")),
        }
    }

    /// Marks a flush outstanding on an active flow.
    pub fn begin_flush(&mut self, flow_id: u16) -> Result<(), FlowRingError> {
        let node = self.get_mut(flow_id)?;
        if node.state != FlowRingState::Active {
            return Err(node.invalid("flush"));
        }
        if node.flush_pending {
            return Err(FlowRingError::Busy(flow_id));
        }
        node.flush_pending = true;
        Ok(())
    }

    pub fn abort_flush(&mut self, flow_id: u16) {
        if let Ok(node) = self.get_mut(flow_id) {
            node.flush_pending = false;
        }
    }

    pub fn on_flush_response(&mut self, flow_id: u16) -> Result<(), FlowRingError> {
        let node = self.get_mut(flow_id)?;
        if node.state != FlowRingState::Active || !node.flush_pending {
            return Err(node.invalid("complete flush"));
        }
        node.flush_pending = false;
        Ok(())
    }

    /// The ring of an active flow, for transmit.
    pub fn active_ring_mut(&mut self, flow_id: u16) -> Result<&mut MsgRing, FlowRingError> {
        let node = self.get_mut(flow_id)?;
        match (node.state, node.ring.as_mut()) {
            (FlowRingState::Active, Some(ring)) => Ok(ring),
            _ => Err(FlowRingError::InvalidTransition {
                flow_id,
                state: node.state,
                op: "transmit",
            }),
        }
    }

    /// Rings of every flow, whatever their state, for flushing pending
    /// transmits.
    pub fn rings_mut(&mut self) -> impl Iterator<Item = &mut MsgRing> {
        self.nodes.iter_mut().filter_map(|n| n.ring.as_mut())
    }

    /// Returns every flow to `Uncreated` and hands back their rings.
    pub fn drain(&mut self) -> Vec<MsgRing> {
        let mut rings = Vec::new();
        for node in &mut self.nodes {
            if let Some(ring) = node.ring.take() {
                rings.push(ring);
            }
            node.state = FlowRingState::Uncreated;
            node.flush_pending = false;
        }
        rings
    }
}
