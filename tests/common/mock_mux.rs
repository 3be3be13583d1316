// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording streaming multiplexer.
//!
//! Keeps every writer and socket it is given, can refuse a configurable
//! number of offers, and reports socket closures back to the controller
//! through the attached [`DisconnectNotifier`].

use bytes::Bytes;
use std::sync::Mutex;
use table_replication::{
    BoxedSocket, BoxedWriter, DisconnectNotifier, PeerId, SocketHandoff, SocketId,
    StreamingMultiplexer,
};

/// One accepted socket.
#[derive(Debug)]
pub struct HeldConnection {
    pub peer_id: PeerId,
    pub socket_id: SocketId,
    pub buffered: Bytes,
    pub socket: Option<BoxedSocket>,
}

/// What the multiplexer saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCall {
    Writer { peer_id: PeerId, master_table_id: u32 },
    Connection { peer_id: PeerId, socket_id: SocketId },
    Stop { peer_id: PeerId },
}

#[derive(Debug)]
struct MuxState {
    writers: Vec<(PeerId, u32, BoxedWriter)>,
    connections: Vec<HeldConnection>,
    calls: Vec<MuxCall>,
    reject_writers: usize,
    reject_connections: usize,
    reject_stops: usize,
    offers: usize,
    auto_disconnect_on_stop: bool,
    notifier: Option<DisconnectNotifier>,
}

#[derive(Debug)]
pub struct RecordingMultiplexer {
    state: Mutex<MuxState>,
}

impl Default for RecordingMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingMultiplexer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MuxState {
                writers: Vec::new(),
                connections: Vec::new(),
                calls: Vec::new(),
                reject_writers: 0,
                reject_connections: 0,
                reject_stops: 0,
                offers: 0,
                auto_disconnect_on_stop: true,
                notifier: None,
            }),
        }
    }

    pub fn attach(&self, notifier: DisconnectNotifier) {
        self.state.lock().unwrap().notifier = Some(notifier);
    }

    /// Refuse the next `n` writer offers.
    pub fn reject_writers(&self, n: usize) {
        self.state.lock().unwrap().reject_writers = n;
    }

    /// Refuse the next `n` socket offers.
    pub fn reject_connections(&self, n: usize) {
        self.state.lock().unwrap().reject_connections = n;
    }

    /// Refuse the next `n` stop requests.
    pub fn reject_stops(&self, n: usize) {
        self.state.lock().unwrap().reject_stops = n;
    }

    /// Whether an accepted stop closes the peer's sockets right away.
    pub fn set_auto_disconnect_on_stop(&self, enabled: bool) {
        self.state.lock().unwrap().auto_disconnect_on_stop = enabled;
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Every offer made, accepted or not.
    pub fn offers(&self) -> usize {
        self.state.lock().unwrap().offers
    }

    pub fn writer_count(&self) -> usize {
        self.state.lock().unwrap().writers.len()
    }

    pub fn writer_table(&self, peer_id: PeerId) -> Option<(u32, String)> {
        self.state
            .lock()
            .unwrap()
            .writers
            .iter()
            .find(|(p, _, _)| *p == peer_id)
            .map(|(_, id, w)| (*id, w.table_name().to_string()))
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn socket_ids(&self, peer_id: PeerId) -> Vec<SocketId> {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| c.peer_id == peer_id && c.socket.is_some())
            .map(|c| c.socket_id)
            .collect()
    }

    pub fn buffered(&self, socket_id: SocketId) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .find(|c| c.socket_id == socket_id)
            .map(|c| c.buffered.clone())
    }

    /// Take a held socket out, e.g. to read from it directly.
    pub fn take_socket(&self, socket_id: SocketId) -> Option<BoxedSocket> {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter_mut()
            .find(|c| c.socket_id == socket_id)
            .and_then(|c| c.socket.take())
    }

    /// Simulate the multiplexer losing one socket.
    pub fn disconnect_socket(&self, peer_id: PeerId, socket_id: SocketId) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.peer_id == peer_id && c.socket_id == socket_id)
        {
            conn.socket = None;
        }
        if let Some(notifier) = &state.notifier {
            notifier.on_peer_disconnected(peer_id, socket_id);
        }
    }

    fn release_peer(state: &mut MuxState, peer_id: PeerId) {
        state.writers.retain(|(p, _, _)| *p != peer_id);
        if !state.auto_disconnect_on_stop {
            return;
        }
        let mut closed = Vec::new();
        for conn in state.connections.iter_mut().filter(|c| c.peer_id == peer_id) {
            if conn.socket.take().is_some() {
                closed.push(conn.socket_id);
            }
        }
        if let Some(notifier) = &state.notifier {
            for socket_id in closed {
                notifier.on_peer_disconnected(peer_id, socket_id);
            }
        }
    }
}

impl StreamingMultiplexer for RecordingMultiplexer {
    fn try_add_writer(
        &self,
        peer_id: PeerId,
        master_table_id: u32,
        writer: BoxedWriter,
    ) -> Result<(), BoxedWriter> {
        let mut state = self.state.lock().unwrap();
        state.offers += 1;
        if state.reject_writers > 0 {
            state.reject_writers -= 1;
            return Err(writer);
        }
        state.calls.push(MuxCall::Writer {
            peer_id,
            master_table_id,
        });
        state.writers.push((peer_id, master_table_id, writer));
        Ok(())
    }

    fn try_add_connection(
        &self,
        peer_id: PeerId,
        handoff: SocketHandoff,
    ) -> Result<(), SocketHandoff> {
        let mut state = self.state.lock().unwrap();
        state.offers += 1;
        if state.reject_connections > 0 {
            state.reject_connections -= 1;
            return Err(handoff);
        }
        let socket_id = handoff.socket_id();
        state.calls.push(MuxCall::Connection { peer_id, socket_id });
        state.connections.push(HeldConnection {
            peer_id,
            socket_id,
            buffered: handoff.buffered,
            socket: Some(handoff.socket),
        });
        Ok(())
    }

    fn try_stop_peer(&self, peer_id: PeerId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.reject_stops > 0 {
            state.reject_stops -= 1;
            return false;
        }
        state.calls.push(MuxCall::Stop { peer_id });
        Self::release_peer(&mut state, peer_id);
        true
    }
}
