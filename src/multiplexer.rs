// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming multiplexer seam.
//!
//! Once a handler's handshake completes, the table writer and every master
//! socket are handed to the multiplexer, which applies the replicated data.
//! All calls are non-blocking and may refuse; a refusal hands ownership
//! back so the handler can offer the same value again on a later tick.
//!
//! ```text
//!  handler ──try_add_writer(peer, writer)─────────►┐
//!  handler ──try_add_connection(peer, socket)─────►│ StreamingMultiplexer
//!  handler ──try_stop_peer(peer)──────────────────►┘        │
//!                                                           │ socket closed
//!  controller ◄──drain── DisconnectNotifier ◄──on_peer_disconnected
//! ```
//!
//! Disconnections are reported from the multiplexer's own threads. The
//! notifier only enqueues; the controller applies them on its tick.

use crate::identity::PeerId;
use crate::storage::BoxedWriter;
use crate::transport::{BoxedSocket, SocketId};
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use std::sync::Arc;

/// A master connection being transferred to the multiplexer.
#[derive(Debug)]
pub struct SocketHandoff {
    pub socket: BoxedSocket,

    /// Bytes already read from the socket past the last handshake frame.
    /// They belong to the replication stream.
    pub buffered: Bytes,
}

impl SocketHandoff {
    pub fn socket_id(&self) -> SocketId {
        self.socket.id()
    }
}

/// Applies replicated data for handed-off peers.
pub trait StreamingMultiplexer: Send + Sync {
    /// Take ownership of the table writer for `peer_id`.
    fn try_add_writer(
        &self,
        peer_id: PeerId,
        master_table_id: u32,
        writer: BoxedWriter,
    ) -> Result<(), BoxedWriter>;

    /// Take ownership of one master socket for `peer_id`.
    fn try_add_connection(
        &self,
        peer_id: PeerId,
        handoff: SocketHandoff,
    ) -> Result<(), SocketHandoff>;

    /// Ask the multiplexer to close every socket it holds for `peer_id`
    /// and release its writer. Returns `false` if it cannot accept the
    /// request right now.
    fn try_stop_peer(&self, peer_id: PeerId) -> bool;
}

/// One socket the multiplexer has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDisconnection {
    pub peer_id: PeerId,
    pub socket_id: SocketId,
}

/// Thread-safe sink for multiplexer disconnection callbacks.
#[derive(Debug, Clone, Default)]
pub struct DisconnectNotifier {
    queue: Arc<SegQueue<PeerDisconnection>>,
}

impl DisconnectNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that the multiplexer closed `socket_id` belonging to `peer_id`.
    ///
    /// Safe to call from any thread. Never blocks.
    pub fn on_peer_disconnected(&self, peer_id: PeerId, socket_id: SocketId) {
        self.queue.push(PeerDisconnection { peer_id, socket_id });
    }

    pub(crate) fn pop(&self) -> Option<PeerDisconnection> {
        self.queue.pop()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
