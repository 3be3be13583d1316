// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Handler bookkeeping for the controller.
//!
//! A table name is in `active_tables` exactly while a handler for it sits
//! in `initializing` or `streaming`. Terminal handlers leave both sets:
//! stopped ones are dropped, distressed ones are parked in `distressed`.

use super::handler::ReplicationHandler;
use super::types::{ControllerStatus, HandlerPhase};
use crate::identity::PeerId;
use crate::metrics;
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    active_tables: HashSet<String>,
    initializing: Vec<ReplicationHandler>,
    streaming: Vec<ReplicationHandler>,
    distressed: Vec<ReplicationHandler>,
    /// Peers whose stop was requested by a `Remove`.
    stopping_peer_ids: HashSet<PeerId>,
}

impl HandlerRegistry {
    pub fn is_active(&self, table_name: &str) -> bool {
        self.active_tables.contains(table_name)
    }

    pub fn insert(&mut self, handler: ReplicationHandler) {
        self.active_tables.insert(handler.table_name().to_string());
        self.initializing.push(handler);
    }

    pub fn find_by_table_mut(&mut self, table_name: &str) -> Option<&mut ReplicationHandler> {
        self.initializing
            .iter_mut()
            .chain(self.streaming.iter_mut())
            .find(|h| h.table_name() == table_name)
    }

    pub fn find_by_peer_mut(&mut self, peer_id: PeerId) -> Option<&mut ReplicationHandler> {
        self.initializing
            .iter_mut()
            .chain(self.streaming.iter_mut())
            .find(|h| h.peer_id() == peer_id)
    }

    /// Remember that `peer_id` is stopping on request.
    pub fn mark_voluntary_stop(&mut self, peer_id: PeerId) {
        self.stopping_peer_ids.insert(peer_id);
    }

    /// Discard a parked distressed handler. Returns whether one existed.
    pub fn clear_distressed(&mut self, table_name: &str) -> bool {
        let before = self.distressed.len();
        self.distressed.retain(|h| h.table_name() != table_name);
        self.distressed.len() != before
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut ReplicationHandler> {
        self.initializing.iter_mut().chain(self.streaming.iter_mut())
    }

    /// Move handlers that finished handing off into the streaming set.
    pub fn promote_streaming(&mut self) -> usize {
        let promoted = drain_where(&mut self.initializing, |h| h.phase() == HandlerPhase::Streaming);
        let count = promoted.len();
        self.streaming.extend(promoted);
        count
    }

    /// Resolve drained handlers to a terminal phase and unregister them.
    pub fn reap(&mut self) -> usize {
        let mut drained = drain_where(&mut self.initializing, ReplicationHandler::is_drained);
        drained.extend(drain_where(&mut self.streaming, ReplicationHandler::is_drained));
        let count = drained.len();

        for mut handler in drained {
            let voluntary = self.stopping_peer_ids.remove(&handler.peer_id());
            self.active_tables.remove(handler.table_name());
            match handler.finish(voluntary) {
                HandlerPhase::Distressed => {
                    warn!(
                        table = %handler.table_name(),
                        peer_id = %handler.peer_id(),
                        reason = handler.status().failure.as_deref().unwrap_or("unknown"),
                        "Table replication distressed, operator attention required"
                    );
                    metrics::record_handler_outcome(handler.table_name(), "distressed");
                    self.distressed.push(handler);
                }
                _ => {
                    info!(
                        table = %handler.table_name(),
                        peer_id = %handler.peer_id(),
                        "Table replication stopped"
                    );
                    metrics::record_handler_outcome(handler.table_name(), "stopped");
                }
            }
        }
        count
    }

    /// Stop every live handler as if removed.
    pub fn stop_all(&mut self) {
        let peers: Vec<PeerId> = self.live_mut().map(|h| h.peer_id()).collect();
        self.stopping_peer_ids.extend(peers);
        for handler in self.live_mut() {
            handler.stop();
        }
    }

    pub fn status(&self, pending_instructions: usize) -> ControllerStatus {
        ControllerStatus {
            initializing: self.initializing.iter().map(|h| h.status()).collect(),
            streaming: self.streaming.iter().map(|h| h.status()).collect(),
            distressed: self.distressed.iter().map(|h| h.status()).collect(),
            pending_instructions,
        }
    }

    pub fn record_counts(&self) {
        metrics::set_handler_counts(self.initializing.len(), self.streaming.len(), self.distressed.len());
    }
}

/// Remove and return the elements matching `pred`, keeping the order of both.
fn drain_where<T>(items: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> Vec<T> {
    let mut taken = Vec::new();
    let mut i = 0;
    while i < items.len() {
        if pred(&items[i]) {
            taken.push(items.remove(i));
        } else {
            i += 1;
        }
    }
    taken
}
