// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Handler state types.
//!
//! Defines the per-table replication handler state machine and the status
//! snapshots the controller reports.
//!
//! # State Transitions
//!
//! ```text
//!                   all connected
//! Initializing ─────────────────────► AwaitingRendezvous
//!      │                                     │ TABLE_INFO from every master
//!      │                                     ▼
//!      │                              RequestingStream
//!      │                                     │ START_OF_REPLICATION_STREAM
//!      │                                     ▼
//!      │                                HandingOff
//!      │                                     │ writer + sockets accepted
//!      │                                     ▼
//!      │                                 Streaming
//!      │ (remove / failure)                  │
//!      └──────────────► Stopping ◄───────────┘  (any live phase)
//!                           │
//!              ┌────────────┴────────────┐
//!              ▼                         ▼
//!           Stopped                 Distressed
//!     (stop was requested)     (unexpected termination)
//! ```
//!
//! # Phase Descriptions
//!
//! - **Initializing**: Connecting to every master and sending `REQUEST_TABLE_INFO`.
//! - **AwaitingRendezvous**: All connected; waiting for every `TABLE_INFO`.
//! - **RequestingStream**: First connection sent `REQUEST_REPLICATION_STREAM`.
//! - **HandingOff**: Giving the writer and sockets to the multiplexer.
//! - **Streaming**: Multiplexer owns everything; handler waits for disconnects.
//! - **Stopping**: Releasing connections. Terminal once none remain.
//! - **Stopped**: Stopped on request. Dropped by the controller.
//! - **Distressed**: Ended abnormally. Parked for operator attention.

use crate::error::{ReplicationError, Result};
use crate::identity::PeerId;
use std::fmt;

/// Phase of a replication handler.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerPhase {
    Initializing,
    AwaitingRendezvous,
    RequestingStream,
    HandingOff,
    Streaming,
    Stopping,
    Stopped,
    Distressed,
}

impl HandlerPhase {
    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: HandlerPhase) -> bool {
        use HandlerPhase::*;
        matches!(
            (self, next),
            (Initializing, AwaitingRendezvous)
                | (AwaitingRendezvous, RequestingStream)
                | (RequestingStream, HandingOff)
                | (HandingOff, Streaming)
                | (Initializing, Stopping)
                | (AwaitingRendezvous, Stopping)
                | (RequestingStream, Stopping)
                | (HandingOff, Stopping)
                | (Streaming, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Distressed)
        )
    }

    /// Validate `self → next`, returning `next`.
    pub fn transition(self, next: HandlerPhase) -> Result<HandlerPhase> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ReplicationError::InvalidTransition { from: self, to: next })
        }
    }

    /// Still owns or is waiting on resources.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandlerPhase::Stopped | HandlerPhase::Distressed)
    }

    /// Before the multiplexer takes over.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            HandlerPhase::Initializing
                | HandlerPhase::AwaitingRendezvous
                | HandlerPhase::RequestingStream
                | HandlerPhase::HandingOff
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandlerPhase::Initializing => "Initializing",
            HandlerPhase::AwaitingRendezvous => "AwaitingRendezvous",
            HandlerPhase::RequestingStream => "RequestingStream",
            HandlerPhase::HandingOff => "HandingOff",
            HandlerPhase::Streaming => "Streaming",
            HandlerPhase::Stopping => "Stopping",
            HandlerPhase::Stopped => "Stopped",
            HandlerPhase::Distressed => "Distressed",
        }
    }
}

impl fmt::Display for HandlerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerStatus {
    pub table_name: String,
    pub peer_id: PeerId,
    pub phase: HandlerPhase,
    /// Connections not yet closed (owned or transferred).
    pub connections: usize,
    /// 0 until the masters have answered.
    pub master_table_id: u32,
    /// Why the handler stopped, if it failed.
    pub failure: Option<String>,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Handlers still handshaking (or stopping before handoff).
    pub initializing: Vec<HandlerStatus>,
    /// Handlers owned by the multiplexer (or stopping after handoff).
    pub streaming: Vec<HandlerStatus>,
    /// Handlers parked after an unexpected termination.
    pub distressed: Vec<HandlerStatus>,
    pub pending_instructions: usize,
}

impl ControllerStatus {
    /// Find a live handler by table name.
    pub fn handler(&self, table_name: &str) -> Option<&HandlerStatus> {
        self.initializing
            .iter()
            .chain(self.streaming.iter())
            .find(|h| h.table_name == table_name)
    }

    pub fn is_distressed(&self, table_name: &str) -> bool {
        self.distressed.iter().any(|h| h.table_name == table_name)
    }

    pub fn live_count(&self) -> usize {
        self.initializing.len() + self.streaming.len()
    }
}
