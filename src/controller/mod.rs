// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slave replication controller.
//!
//! The single cooperative unit that owns every replication handler. Each
//! [`tick()`](ReplicationController::tick) performs a bounded, non-blocking
//! slice of work and reports whether it did anything:
//!
//! 1. Drain the instruction queue (add/remove tables)
//! 2. Drain disconnection notifications from the multiplexer
//! 3. Poll every live handler once
//! 4. Move handlers that finished handing off into the streaming set
//! 5. Resolve drained handlers to `Stopped` or `Distressed`
//!
//! All handler state is mutated on the thread calling `tick()`. Other threads
//! only touch the two lock-free queues: [`ReplicationAdmin`] for instructions
//! and [`DisconnectNotifier`] for disconnections.
//!
//! # Running
//!
//! [`run()`](ReplicationController::run) drives ticks on a tokio task until a
//! shutdown signal arrives, yielding between busy ticks and sleeping
//! `idle_interval` after idle ones.

mod handler;
mod registry;
mod types;

pub use types::{ControllerStatus, HandlerPhase, HandlerStatus};

use crate::config::{SlaveReplicationConfig, TableReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::instruction::{InstructionQueue, ReplicationAdmin, ReplicationInstruction};
use crate::metrics;
use crate::multiplexer::{DisconnectNotifier, StreamingMultiplexer};
use crate::storage::TableStore;
use crate::transport::Connector;
use handler::{HandlerContext, ReplicationHandler};
use registry::HandlerRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Owns and drives every table replication handler.
pub struct ReplicationController {
    config: SlaveReplicationConfig,

    /// Add/remove instructions from any thread
    queue: Arc<InstructionQueue>,

    /// Disconnections reported by the multiplexer
    disconnects: DisconnectNotifier,

    registry: HandlerRegistry,

    store: Arc<dyn TableStore>,
    multiplexer: Arc<dyn StreamingMultiplexer>,
    connector: Arc<dyn Connector>,

    handshake_timeout: Duration,
}

impl ReplicationController {
    /// Create a controller. Tables listed in `config.tables` are queued as
    /// `Add` instructions and start on the first tick.
    pub fn new(
        config: SlaveReplicationConfig,
        store: Arc<dyn TableStore>,
        multiplexer: Arc<dyn StreamingMultiplexer>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(InstructionQueue::new(config.instruction_queue_capacity));
        for table in &config.tables {
            if !queue.push(ReplicationInstruction::Add(table.clone())) {
                return Err(ReplicationError::Config(format!(
                    "{} initial tables exceed instruction_queue_capacity {}",
                    config.tables.len(),
                    config.instruction_queue_capacity
                )));
            }
        }

        Ok(Self {
            handshake_timeout: config.handshake_timeout_duration(),
            config,
            queue,
            disconnects: DisconnectNotifier::new(),
            registry: HandlerRegistry::default(),
            store,
            multiplexer,
            connector,
        })
    }

    /// Handle for submitting add/remove instructions from any thread.
    pub fn admin(&self) -> ReplicationAdmin {
        ReplicationAdmin::new(self.queue.clone())
    }

    /// Sink the multiplexer reports socket disconnections to.
    pub fn disconnect_notifier(&self) -> DisconnectNotifier {
        self.disconnects.clone()
    }

    pub fn config(&self) -> &SlaveReplicationConfig {
        &self.config
    }

    /// Snapshot of every handler the controller knows about.
    pub fn status(&self) -> ControllerStatus {
        self.registry.status(self.queue.len())
    }

    /// Run one slice of work. Returns `true` if anything happened.
    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    /// [`tick()`](Self::tick) with an explicit clock, for handshake timeouts.
    pub fn tick_at(&mut self, now: Instant) -> bool {
        let mut busy = self.drain_instructions(now);
        busy |= self.drain_disconnections();
        busy |= self.poll_handlers(now);
        busy |= self.registry.promote_streaming() > 0;
        busy |= self.registry.reap() > 0;

        self.registry.record_counts();
        metrics::set_pending_instructions(self.queue.len());
        busy
    }

    fn drain_instructions(&mut self, now: Instant) -> bool {
        let mut busy = false;
        while let Some(instruction) = self.queue.pop() {
            busy = true;
            let kind = instruction.kind();
            let applied = match instruction {
                ReplicationInstruction::Add(table) => self.add_table(table, now),
                ReplicationInstruction::Remove { table_name } => self.remove_table(&table_name),
            };
            metrics::record_instruction(kind, if applied { "applied" } else { "ignored" });
        }
        busy
    }

    fn add_table(&mut self, table: TableReplicationConfig, now: Instant) -> bool {
        if let Err(e) = table.validate() {
            warn!(table = %table.table_name, error = %e, "Ignoring invalid replication request");
            return false;
        }
        if self.registry.is_active(&table.table_name) {
            info!(table = %table.table_name, "Table already replicating, ignoring add");
            return false;
        }
        if self.registry.clear_distressed(&table.table_name) {
            info!(table = %table.table_name, "Discarding distressed handler before restart");
        }

        let mut handler = ReplicationHandler::new(
            &table,
            self.config.frame_buffer_size,
            self.handshake_timeout,
            now,
        );
        handler.start(self.connector.as_ref());
        self.registry.insert(handler);
        true
    }

    fn remove_table(&mut self, table_name: &str) -> bool {
        let Some(handler) = self.registry.find_by_table_mut(table_name) else {
            if self.registry.clear_distressed(table_name) {
                info!(table = %table_name, "Cleared distressed table");
                return true;
            }
            info!(table = %table_name, "Table not replicating, ignoring remove");
            return false;
        };
        let peer_id = handler.peer_id();
        handler.stop();
        self.registry.mark_voluntary_stop(peer_id);
        true
    }

    fn drain_disconnections(&mut self) -> bool {
        let mut busy = false;
        while let Some(event) = self.disconnects.pop() {
            busy = true;
            let matched = self
                .registry
                .find_by_peer_mut(event.peer_id)
                .map(|handler| handler.on_disconnect(event.socket_id))
                .unwrap_or(false);
            if !matched {
                debug!(
                    peer_id = %event.peer_id,
                    socket_id = %event.socket_id,
                    "Disconnect for unknown peer or socket"
                );
            }
        }
        busy
    }

    fn poll_handlers(&mut self, now: Instant) -> bool {
        let ctx = HandlerContext {
            store: self.store.as_ref(),
            multiplexer: self.multiplexer.as_ref(),
        };
        let mut busy = false;
        for handler in self.registry.live_mut() {
            busy |= handler.poll(&ctx, now);
        }
        busy
    }

    /// Stop every handler, ask the multiplexer to release anything it holds,
    /// and drop all remaining sockets and writers.
    pub fn close(&mut self) {
        self.registry.stop_all();
        let ctx = HandlerContext {
            store: self.store.as_ref(),
            multiplexer: self.multiplexer.as_ref(),
        };
        for handler in self.registry.live_mut() {
            handler.poll(&ctx, Instant::now());
        }
        self.registry.reap();
        self.registry = HandlerRegistry::default();
        info!("Slave replication controller closed");
    }

    /// Tick until `shutdown_rx` turns `true`, then [`close()`](Self::close).
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let idle = self.config.idle_interval_duration();
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();
        info!(idle_ms = idle.as_millis() as u64, "Slave replication controller running");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if self.tick() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutdown signal received, closing replication handlers");
        self.close();
    }

    /// Spawn [`run()`](Self::run) on the current tokio runtime.
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }
}
