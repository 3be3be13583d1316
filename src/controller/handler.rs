// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table replication handler.
//!
//! A handler owns one [`FramedConnection`] per configured master, the local
//! table writer (once resolved) and its [`HandlerPhase`]. It is driven by
//! the controller through [`ReplicationHandler::poll`] and never blocks.
//!
//! # Rendezvous
//!
//! Every master must answer `TABLE_INFO` with the same master table id and
//! structure version before anything else happens. Only then is the local
//! table resolved and `REQUEST_REPLICATION_STREAM` sent, once, on the first
//! connection. From that point only the first connection is polled.
//!
//! # Failure Path
//!
//! Any error from a connection or from storage lands in
//! [`ReplicationHandler::fail`], which records the reason and enters
//! `Stopping`. Whether the handler then ends `Stopped` or `Distressed` is
//! decided by the controller, depending on whether a stop was requested.

use super::types::{HandlerPhase, HandlerStatus};
use crate::config::TableReplicationConfig;
use crate::connection::{ConnectionEvent, FramedConnection};
use crate::error::{ReplicationError, Result};
use crate::identity::PeerId;
use crate::metrics;
use crate::multiplexer::StreamingMultiplexer;
use crate::protocol::{RequestReplicationStream, StartOfReplicationStream, TableInfo};
use crate::storage::{BoxedWriter, StorageError, TableStore};
use crate::transport::{Connector, SocketId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Collaborators a handler needs while polling.
pub(crate) struct HandlerContext<'a> {
    pub store: &'a dyn TableStore,
    pub multiplexer: &'a dyn StreamingMultiplexer,
}

pub(crate) struct ReplicationHandler {
    peer_id: PeerId,
    table_name: String,
    connections: Vec<FramedConnection>,
    writer: Option<BoxedWriter>,
    writer_transferred: bool,
    master_table_id: u32,
    structure_version: u64,
    /// Connections that answered `TABLE_INFO`.
    ready: usize,
    phase: HandlerPhase,
    started_at: Instant,
    handshake_timeout: Duration,
    /// Multiplexer holds something of ours and must be told to stop.
    needs_peer_stop: bool,
    peer_stop_accepted: bool,
    failure: Option<String>,
}

impl ReplicationHandler {
    pub fn new(
        config: &TableReplicationConfig,
        frame_buffer_size: usize,
        handshake_timeout: Duration,
        now: Instant,
    ) -> Self {
        let peer_id = PeerId::next();
        let connections = config
            .masters
            .iter()
            .map(|endpoint| {
                FramedConnection::new(
                    endpoint.clone(),
                    peer_id,
                    config.table_name.clone(),
                    frame_buffer_size,
                )
            })
            .collect();
        Self {
            peer_id,
            table_name: config.table_name.clone(),
            connections,
            writer: None,
            writer_transferred: false,
            master_table_id: 0,
            structure_version: 0,
            ready: 0,
            phase: HandlerPhase::Initializing,
            started_at: now,
            handshake_timeout,
            needs_peer_stop: false,
            peer_stop_accepted: false,
            failure: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn phase(&self) -> HandlerPhase {
        self.phase
    }

    pub fn status(&self) -> HandlerStatus {
        HandlerStatus {
            table_name: self.table_name.clone(),
            peer_id: self.peer_id,
            phase: self.phase,
            connections: self.connections.len(),
            master_table_id: self.master_table_id,
            failure: self.failure.clone(),
        }
    }

    /// Open every master connection.
    pub fn start(&mut self, connector: &dyn Connector) {
        info!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            masters = self.connections.len(),
            "Starting table replication"
        );
        metrics::record_phase_transition(self.phase.as_str());
        for i in 0..self.connections.len() {
            if let Err(e) = self.connections[i].open(connector) {
                self.fail(e);
                return;
            }
        }
    }

    /// One non-blocking step. Returns whether anything happened.
    pub fn poll(&mut self, ctx: &HandlerContext<'_>, now: Instant) -> bool {
        let result = match self.phase {
            phase if phase.is_handshaking() => self.poll_handshake(ctx, now),
            HandlerPhase::Stopping => Ok(self.poll_stopping(ctx)),
            _ => Ok(false),
        };
        match result {
            Ok(busy) => busy,
            Err(e) => {
                self.fail(e);
                true
            }
        }
    }

    fn barrier_satisfied(&self) -> bool {
        self.ready == self.connections.len()
    }

    fn poll_handshake(&mut self, ctx: &HandlerContext<'_>, now: Instant) -> Result<bool> {
        if self.phase == HandlerPhase::HandingOff {
            return self.poll_handoff(ctx, now);
        }

        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed >= self.handshake_timeout {
            return Err(ReplicationError::HandshakeTimeout {
                table: self.table_name.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        // After the barrier only the first connection carries handshake traffic.
        let polled = if self.barrier_satisfied() { 1 } else { self.connections.len() };
        let mut busy = false;
        for i in 0..polled {
            let outcome = self.connections[i].poll()?;
            busy |= outcome.busy;
            if let Some(event) = outcome.event {
                self.on_event(i, event, ctx)?;
            }
        }

        if self.phase == HandlerPhase::Initializing
            && self.connections.iter().all(|c| c.has_requested_table_info())
        {
            self.enter(HandlerPhase::AwaitingRendezvous)?;
            info!(
                table = %self.table_name,
                peer_id = %self.peer_id,
                "All master connections established"
            );
            busy = true;
        }

        if self.phase == HandlerPhase::AwaitingRendezvous && self.barrier_satisfied() {
            self.on_rendezvous(ctx)?;
            busy = true;
        }

        if self.phase == HandlerPhase::HandingOff {
            busy |= self.poll_handoff(ctx, now)?;
        }
        Ok(busy)
    }

    fn on_event(&mut self, index: usize, event: ConnectionEvent, ctx: &HandlerContext<'_>) -> Result<()> {
        match event {
            ConnectionEvent::TableInfo(info) => self.on_table_info(index, info),
            ConnectionEvent::StreamStart(start) => self.on_stream_start(start, ctx),
        }
    }

    fn on_table_info(&mut self, index: usize, info: TableInfo) -> Result<()> {
        if self.ready == 0 {
            self.master_table_id = info.master_table_id;
            self.structure_version = info.structure_version;
        } else if info.master_table_id != self.master_table_id
            || info.structure_version != self.structure_version
        {
            return Err(ReplicationError::MasterDivergence {
                table: self.table_name.clone(),
                message: format!(
                    "{} reports table id {} version {}, others report table id {} version {}",
                    self.connections[index].endpoint(),
                    info.master_table_id,
                    info.structure_version,
                    self.master_table_id,
                    self.structure_version
                ),
            });
        }
        self.ready += 1;
        debug!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            ready = self.ready,
            masters = self.connections.len(),
            master_row_count = info.row_count,
            "Master answered TABLE_INFO"
        );
        Ok(())
    }

    /// Every master has answered: resolve the local table and ask the first
    /// master for the stream.
    fn on_rendezvous(&mut self, ctx: &HandlerContext<'_>) -> Result<()> {
        let initial_row_count = self.resolve_table(ctx)?;
        let request = RequestReplicationStream {
            master_table_id: self.master_table_id,
            structure_version: self.structure_version,
            initial_row_count,
        };
        let Some(first) = self.connections.first_mut() else {
            return Err(ReplicationError::Config(format!(
                "table '{}' has no master endpoints",
                self.table_name
            )));
        };
        first.request_replication_stream(request)?;
        self.enter(HandlerPhase::RequestingStream)?;
        info!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            master_table_id = self.master_table_id,
            structure_version = self.structure_version,
            initial_row_count,
            "Requested replication stream"
        );
        Ok(())
    }

    /// Open the local writer if the table exists. Returns the row count
    /// replication should resume from.
    fn resolve_table(&mut self, ctx: &HandlerContext<'_>) -> Result<u64> {
        let exists = ctx
            .store
            .table_exists(&self.table_name)
            .map_err(|e| ReplicationError::storage(&self.table_name, "table_exists", e))?;
        if !exists {
            debug!(
                table = %self.table_name,
                "Table absent locally, will create it from stream metadata"
            );
            return Ok(0);
        }

        let writer = ctx
            .store
            .open_writer(&self.table_name)
            .map_err(|e| ReplicationError::storage(&self.table_name, "open_writer", e))?;
        let local = writer.structure_version();
        if local != self.structure_version {
            return Err(ReplicationError::StructureVersionMismatch {
                table: self.table_name.clone(),
                local,
                master: self.structure_version,
            });
        }
        let rows = writer.row_count();
        self.writer = Some(writer);
        Ok(rows)
    }

    fn on_stream_start(&mut self, start: StartOfReplicationStream, ctx: &HandlerContext<'_>) -> Result<()> {
        if self.writer.is_none() {
            let writer = ctx
                .store
                .create_table(&self.table_name, &start.metadata, &start.symbols)
                .map_err(|e| ReplicationError::storage(&self.table_name, "create_table", e))?;
            info!(
                table = %self.table_name,
                peer_id = %self.peer_id,
                structure_version = writer.structure_version(),
                "Created table from master metadata"
            );
            metrics::record_table_created(&self.table_name);
            self.writer = Some(writer);
        }
        self.enter(HandlerPhase::HandingOff)
    }

    /// Give the writer, then each socket in order, to the multiplexer.
    /// Safe to call repeatedly; anything already transferred is skipped.
    fn poll_handoff(&mut self, ctx: &HandlerContext<'_>, now: Instant) -> Result<bool> {
        let mut busy = false;

        if !self.writer_transferred {
            let Some(writer) = self.writer.take() else {
                return Err(ReplicationError::storage(
                    &self.table_name,
                    "open_writer",
                    StorageError::new("no writer at handoff"),
                ));
            };
            match ctx
                .multiplexer
                .try_add_writer(self.peer_id, self.master_table_id, writer)
            {
                Ok(()) => {
                    self.writer_transferred = true;
                    busy = true;
                    debug!(table = %self.table_name, peer_id = %self.peer_id, "Writer handed to multiplexer");
                }
                Err(writer) => {
                    self.writer = Some(writer);
                    metrics::record_handoff_retry("writer");
                    trace!(table = %self.table_name, "Multiplexer refused writer, will retry");
                    return Ok(false);
                }
            }
        }

        let peer_id = self.peer_id;
        let multiplexer = ctx.multiplexer;
        for conn in self.connections.iter_mut() {
            if conn.is_transferred() {
                continue;
            }
            if conn.try_transfer(|handoff| multiplexer.try_add_connection(peer_id, handoff))? {
                busy = true;
            } else {
                metrics::record_handoff_retry("connection");
                trace!(
                    table = %self.table_name,
                    endpoint = %conn.endpoint(),
                    "Multiplexer refused socket, will retry"
                );
                return Ok(busy);
            }
        }

        self.enter(HandlerPhase::Streaming)?;
        let elapsed = now.saturating_duration_since(self.started_at);
        metrics::record_handshake_duration(&self.table_name, elapsed);
        info!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            master_table_id = self.master_table_id,
            handshake_ms = elapsed.as_millis() as u64,
            "Table replication streaming"
        );
        Ok(true)
    }

    /// Enter `Stopping`. Owned sockets and an untransferred writer are
    /// released immediately; anything the multiplexer holds is released
    /// through `try_stop_peer` on later polls.
    pub fn stop(&mut self) {
        if !self.phase.is_live() || self.phase == HandlerPhase::Stopping {
            return;
        }
        if let Err(e) = self.enter(HandlerPhase::Stopping) {
            error!(table = %self.table_name, error = %e, "Cannot stop handler");
            return;
        }

        let mut closed = 0;
        for conn in self.connections.iter_mut() {
            if conn.close() {
                closed += 1;
            }
        }
        self.connections.retain(|c| c.is_transferred());
        if !self.writer_transferred {
            self.writer = None;
        }
        self.needs_peer_stop = self.writer_transferred || !self.connections.is_empty();

        info!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            closed,
            transferred = self.connections.len(),
            "Stopping table replication"
        );
    }

    fn poll_stopping(&mut self, ctx: &HandlerContext<'_>) -> bool {
        if !self.needs_peer_stop || self.peer_stop_accepted {
            return false;
        }
        if ctx.multiplexer.try_stop_peer(self.peer_id) {
            self.peer_stop_accepted = true;
            debug!(table = %self.table_name, peer_id = %self.peer_id, "Multiplexer accepted stop");
            true
        } else {
            metrics::record_handoff_retry("stop");
            false
        }
    }

    /// Stopping, with nothing left open and the multiplexer told to stop.
    pub fn is_drained(&self) -> bool {
        self.phase == HandlerPhase::Stopping
            && self.connections.is_empty()
            && (!self.needs_peer_stop || self.peer_stop_accepted)
    }

    /// Record `err` and start stopping.
    pub fn fail(&mut self, err: ReplicationError) {
        error!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            phase = %self.phase,
            kind = err.kind(),
            retryable = err.is_retryable(),
            error = %err,
            "Table replication failed"
        );
        metrics::record_failure(err.kind());
        if self.failure.is_none() {
            self.failure = Some(err.to_string());
        }
        self.stop();
    }

    /// The multiplexer closed one of our transferred sockets. Returns
    /// `false` if the socket is not one of ours.
    pub fn on_disconnect(&mut self, socket_id: SocketId) -> bool {
        let Some(pos) = self
            .connections
            .iter()
            .position(|c| c.is_transferred() && c.socket_id() == Some(socket_id))
        else {
            return false;
        };
        let conn = self.connections.remove(pos);

        if self.phase == HandlerPhase::Stopping {
            debug!(
                table = %self.table_name,
                peer_id = %self.peer_id,
                socket_id = %socket_id,
                remaining = self.connections.len(),
                "Master connection released"
            );
            return true;
        }

        warn!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            endpoint = %conn.endpoint(),
            socket_id = %socket_id,
            phase = %self.phase,
            "Master connection dropped"
        );
        metrics::record_failure("connection_closed");
        if self.failure.is_none() {
            self.failure = Some(format!("connection to {} dropped", conn.endpoint()));
        }
        self.stop();
        true
    }

    /// Leave `Stopping` for a terminal phase.
    pub fn finish(&mut self, voluntary: bool) -> HandlerPhase {
        let next = if voluntary {
            HandlerPhase::Stopped
        } else {
            HandlerPhase::Distressed
        };
        if let Err(e) = self.enter(next) {
            error!(table = %self.table_name, error = %e, "Cannot finish handler");
        }
        self.phase
    }

    fn enter(&mut self, next: HandlerPhase) -> Result<()> {
        let from = self.phase;
        self.phase = from.transition(next)?;
        debug!(
            table = %self.table_name,
            peer_id = %self.peer_id,
            from = %from,
            to = %next,
            "Handler phase change"
        );
        metrics::record_phase_transition(next.as_str());
        Ok(())
    }
}
