// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One handshake connection to one master endpoint.
//!
//! # Connection States
//!
//! ```text
//! Disconnected ──open()──► Connecting ──connected──► AwaitingTableInfo
//!                                                          │ TABLE_INFO
//!                                                          ▼
//!                      AwaitingStreamStart ◄──request──  Ready ──────┐
//!                              │ START_OF_REPLICATION_STREAM         │
//!                              ▼                                     │
//!                        StreamStarted ──────try_transfer()─────────►┴─► Transferred
//!
//!   any state ──close()──► Closed
//! ```
//!
//! Only the first connection of a handler goes through `AwaitingStreamStart`;
//! the others are transferred straight from `Ready`.
//!
//! The connection owns its socket until [`FramedConnection::try_transfer`]
//! succeeds. After that it only remembers the socket id, so a disconnection
//! reported by the multiplexer can be matched back to it.

use crate::config::MasterEndpoint;
use crate::error::{ReplicationError, Result};
use crate::identity::{self, PeerId};
use crate::metrics;
use crate::multiplexer::SocketHandoff;
use crate::protocol::{
    Frame, FrameReader, FrameWriter, ReadOutcome, RequestReplicationStream, RequestTableInfo,
    StartOfReplicationStream, TableInfo, PROTOCOL_VERSION,
};
use crate::transport::{
    classify_connect_error, BoxedSocket, ConnectErrorClass, ConnectStatus, Connector, SocketId,
};
use std::fmt;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingTableInfo,
    /// `TABLE_INFO` received and accepted.
    Ready,
    AwaitingStreamStart,
    StreamStarted,
    Transferred,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::AwaitingTableInfo => "AwaitingTableInfo",
            Self::Ready => "Ready",
            Self::AwaitingStreamStart => "AwaitingStreamStart",
            Self::StreamStarted => "StreamStarted",
            Self::Transferred => "Transferred",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Something the owning handler must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    TableInfo(TableInfo),
    StreamStart(StartOfReplicationStream),
}

/// Result of one [`FramedConnection::poll`].
#[derive(Debug, Default)]
pub struct ConnectionPoll {
    /// Bytes moved or state changed.
    pub busy: bool,
    pub event: Option<ConnectionEvent>,
}

impl ConnectionPoll {
    fn idle() -> Self {
        Self::default()
    }
}

/// Framed, non-blocking handshake connection.
#[derive(Debug)]
pub struct FramedConnection {
    endpoint: MasterEndpoint,
    label: String,
    peer_id: PeerId,
    table_name: String,
    socket: Option<BoxedSocket>,
    socket_id: Option<SocketId>,
    pending_handoff: Option<SocketHandoff>,
    state: ConnectionState,
    reader: FrameReader,
    writer: FrameWriter,
    table_info: Option<TableInfo>,
}

impl FramedConnection {
    pub fn new(
        endpoint: MasterEndpoint,
        peer_id: PeerId,
        table_name: impl Into<String>,
        frame_buffer_size: usize,
    ) -> Self {
        Self {
            label: endpoint.to_string(),
            endpoint,
            peer_id,
            table_name: table_name.into(),
            socket: None,
            socket_id: None,
            pending_handoff: None,
            state: ConnectionState::Disconnected,
            reader: FrameReader::new(frame_buffer_size),
            writer: FrameWriter::new(frame_buffer_size),
            table_info: None,
        }
    }

    pub fn endpoint(&self) -> &MasterEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket_id
    }

    /// `TABLE_INFO` this connection observed, once received.
    pub fn table_info(&self) -> Option<&TableInfo> {
        self.table_info.as_ref()
    }

    pub fn is_transferred(&self) -> bool {
        self.state == ConnectionState::Transferred
    }

    /// Connected and `REQUEST_TABLE_INFO` queued.
    pub fn has_requested_table_info(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitingTableInfo
                | ConnectionState::Ready
                | ConnectionState::AwaitingStreamStart
                | ConnectionState::StreamStarted
                | ConnectionState::Transferred
        )
    }

    /// Start a non-blocking connect.
    pub fn open(&mut self, connector: &dyn Connector) -> Result<()> {
        let socket = connector
            .open(&self.endpoint)
            .map_err(|source| ReplicationError::Connect {
                endpoint: self.label.clone(),
                source,
            })?;
        debug!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            endpoint = %self.label,
            socket_id = %socket.id(),
            "Connecting to master"
        );
        self.socket_id = Some(socket.id());
        self.socket = Some(socket);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Advance the connection by one non-blocking step.
    ///
    /// At most one frame is decoded per call.
    pub fn poll(&mut self) -> Result<ConnectionPoll> {
        match self.state {
            ConnectionState::Connecting => self.poll_connecting(),
            ConnectionState::AwaitingTableInfo
            | ConnectionState::Ready
            | ConnectionState::AwaitingStreamStart => self.poll_io(),
            ConnectionState::Disconnected
            | ConnectionState::StreamStarted
            | ConnectionState::Transferred
            | ConnectionState::Closed => Ok(ConnectionPoll::idle()),
        }
    }

    fn poll_connecting(&mut self) -> Result<ConnectionPoll> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(ConnectionPoll::idle());
        };
        let connected = match socket.poll_connect() {
            Ok(ConnectStatus::Connected) => true,
            Ok(ConnectStatus::InProgress) => false,
            Err(e) => match classify_connect_error(&e) {
                ConnectErrorClass::AlreadyConnected => true,
                ConnectErrorClass::InProgress => false,
                ConnectErrorClass::Failed => {
                    metrics::record_connection_event(&self.table_name, "failed");
                    return Err(ReplicationError::Connect {
                        endpoint: self.label.clone(),
                        source: e,
                    });
                }
            },
        };
        if !connected {
            return Ok(ConnectionPoll::idle());
        }

        if let Err(e) = socket.set_nodelay(true) {
            warn!(endpoint = %self.label, error = %e, "Failed to set TCP_NODELAY");
        }
        info!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            endpoint = %self.label,
            "Connected to master"
        );
        metrics::record_connection_event(&self.table_name, "connected");

        let request = Frame::RequestTableInfo(RequestTableInfo {
            protocol_version: PROTOCOL_VERSION,
            instance_id: identity::instance_id_u128(),
            peer_id: self.peer_id.get(),
            table_name: self.table_name.clone(),
        });
        self.queue_frame(&request)?;
        self.state = ConnectionState::AwaitingTableInfo;

        let mut polled = self.poll_io()?;
        polled.busy = true;
        Ok(polled)
    }

    fn poll_io(&mut self) -> Result<ConnectionPoll> {
        let mut busy = self.flush()?;

        let Some(socket) = self.socket.as_mut() else {
            return Ok(ConnectionPoll::idle());
        };
        let outcome = self
            .reader
            .fill(|buf, max| socket.try_read(buf, max))
            .map_err(|source| ReplicationError::Io {
                endpoint: self.label.clone(),
                source,
            })?;
        match outcome {
            ReadOutcome::Eof => {
                metrics::record_connection_event(&self.table_name, "closed");
                return Err(ReplicationError::ConnectionClosed {
                    endpoint: self.label.clone(),
                });
            }
            ReadOutcome::Data(n) => {
                trace!(endpoint = %self.label, bytes = n, "Read from master");
                busy = true;
            }
            ReadOutcome::WouldBlock | ReadOutcome::Full => {}
        }

        let frame = self
            .reader
            .next_frame()
            .map_err(|source| ReplicationError::Frame {
                endpoint: self.label.clone(),
                source,
            })?;
        let Some(frame) = frame else {
            return Ok(ConnectionPoll { busy, event: None });
        };

        metrics::record_frame_received(frame.frame_type().as_str());
        let event = self.on_frame(frame)?;
        Ok(ConnectionPoll {
            busy: true,
            event: Some(event),
        })
    }

    fn on_frame(&mut self, frame: Frame) -> Result<ConnectionEvent> {
        match frame {
            Frame::TableInfo(info) => self.on_table_info(info),
            Frame::StartOfReplicationStream(start) => self.on_stream_start(start),
            other => Err(ReplicationError::protocol(
                self.label.clone(),
                format!("unexpected {} frame from master", other.frame_type()),
            )),
        }
    }

    fn on_table_info(&mut self, info: TableInfo) -> Result<ConnectionEvent> {
        if self.table_info.is_some() {
            return Err(ReplicationError::protocol(
                self.label.clone(),
                "duplicate TABLE_INFO",
            ));
        }
        if self.state != ConnectionState::AwaitingTableInfo {
            return Err(ReplicationError::protocol(
                self.label.clone(),
                format!("TABLE_INFO received in state {}", self.state),
            ));
        }
        if info.table_name != self.table_name {
            return Err(ReplicationError::protocol(
                self.label.clone(),
                format!(
                    "TABLE_INFO for '{}' while requesting '{}'",
                    info.table_name, self.table_name
                ),
            ));
        }
        if info.master_table_id == 0 {
            return Err(ReplicationError::TableMissingOnMaster {
                table: self.table_name.clone(),
                endpoint: self.label.clone(),
            });
        }

        debug!(
            table = %self.table_name,
            endpoint = %self.label,
            master_table_id = info.master_table_id,
            row_count = info.row_count,
            structure_version = info.structure_version,
            "Received TABLE_INFO"
        );
        self.table_info = Some(info.clone());
        self.state = ConnectionState::Ready;
        Ok(ConnectionEvent::TableInfo(info))
    }

    fn on_stream_start(&mut self, start: StartOfReplicationStream) -> Result<ConnectionEvent> {
        if self.state != ConnectionState::AwaitingStreamStart {
            return Err(ReplicationError::protocol(
                self.label.clone(),
                format!("START_OF_REPLICATION_STREAM received in state {}", self.state),
            ));
        }
        let expected = self.table_info.as_ref().map(|i| i.master_table_id);
        if expected != Some(start.master_table_id) {
            return Err(ReplicationError::protocol(
                self.label.clone(),
                format!(
                    "START_OF_REPLICATION_STREAM for master table {} while expecting {:?}",
                    start.master_table_id, expected
                ),
            ));
        }
        debug!(
            table = %self.table_name,
            endpoint = %self.label,
            metadata_bytes = start.metadata.len(),
            symbol_bytes = start.symbols.len(),
            "Received START_OF_REPLICATION_STREAM"
        );
        self.state = ConnectionState::StreamStarted;
        Ok(ConnectionEvent::StreamStart(start))
    }

    /// Queue `REQUEST_REPLICATION_STREAM`. Only valid once `Ready`.
    pub fn request_replication_stream(&mut self, request: RequestReplicationStream) -> Result<()> {
        if self.state != ConnectionState::Ready {
            return Err(ReplicationError::protocol(
                self.label.clone(),
                format!("cannot request the stream in state {}", self.state),
            ));
        }
        self.queue_frame(&Frame::RequestReplicationStream(request))?;
        self.state = ConnectionState::AwaitingStreamStart;
        debug!(
            table = %self.table_name,
            endpoint = %self.label,
            master_table_id = request.master_table_id,
            structure_version = request.structure_version,
            initial_row_count = request.initial_row_count,
            "Requested replication stream"
        );
        self.flush()?;
        Ok(())
    }

    fn queue_frame(&mut self, frame: &Frame) -> Result<()> {
        self.writer
            .queue(frame)
            .map_err(|source| ReplicationError::Frame {
                endpoint: self.label.clone(),
                source,
            })?;
        metrics::record_frame_sent(frame.frame_type().as_str());
        Ok(())
    }

    /// Returns whether any bytes were written.
    fn flush(&mut self) -> Result<bool> {
        if self.writer.is_empty() {
            return Ok(false);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(false);
        };
        let before = self.writer.pending();
        self.writer
            .flush(|data| socket.try_write(data))
            .map_err(|source| ReplicationError::Io {
                endpoint: self.label.clone(),
                source,
            })?;
        Ok(self.writer.pending() < before)
    }

    /// Offer the socket to `offer`. A rejected offer is kept and offered
    /// again on the next call. Returns `true` once transferred.
    ///
    /// Only `Ready` and `StreamStarted` connections can be transferred, and
    /// only after their outbound frames are fully written.
    pub fn try_transfer<F>(&mut self, offer: F) -> Result<bool>
    where
        F: FnOnce(SocketHandoff) -> std::result::Result<(), SocketHandoff>,
    {
        match self.state {
            ConnectionState::Transferred => return Ok(true),
            ConnectionState::Ready | ConnectionState::StreamStarted => {}
            _ => return Ok(false),
        }
        // The multiplexer must never see a half-written handshake frame.
        self.flush()?;
        if !self.writer.is_empty() {
            return Ok(false);
        }

        let handoff = match self.pending_handoff.take() {
            Some(handoff) => handoff,
            None => match self.socket.take() {
                Some(socket) => SocketHandoff {
                    socket,
                    buffered: self.reader.take_buffered(),
                },
                None => return Ok(false),
            },
        };
        match offer(handoff) {
            Ok(()) => {
                debug!(
                    table = %self.table_name,
                    peer_id = %self.peer_id,
                    endpoint = %self.label,
                    "Socket handed to multiplexer"
                );
                self.state = ConnectionState::Transferred;
                Ok(true)
            }
            Err(rejected) => {
                self.pending_handoff = Some(rejected);
                Ok(false)
            }
        }
    }

    /// Drop the socket if this connection still owns it.
    ///
    /// Returns `true` if a socket was closed. A transferred socket is left
    /// to the multiplexer.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Transferred {
            return false;
        }
        let had_socket = self.socket.take().is_some();
        let had_pending = self.pending_handoff.take().is_some();
        let owned = had_socket || had_pending;
        if owned {
            debug!(
                table = %self.table_name,
                endpoint = %self.label,
                state = %self.state,
                "Closing master connection"
            );
            metrics::record_connection_event(&self.table_name, "closed");
        }
        self.state = ConnectionState::Closed;
        owned
    }
}
