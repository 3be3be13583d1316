// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for scenario and integration tests.
//!
//! This module provides:
//! - Scripted in-memory master sockets (`mock_net`)
//! - In-memory table store (`mock_store`)
//! - Recording streaming multiplexer (`mock_mux`)
//! - A `Harness` wiring them into a `ReplicationController`

#![allow(dead_code)]

pub mod mock_mux;
pub mod mock_net;
pub mod mock_store;

pub use mock_mux::*;
pub use mock_net::*;
pub use mock_store::*;

use std::sync::Arc;
use table_replication::{
    HandlerPhase, HandlerStatus, ReplicationAdmin, ReplicationController, SlaveReplicationConfig,
    TableReplicationConfig,
};

/// Install a tracing subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Controller wired to mock collaborators.
pub struct Harness {
    pub controller: ReplicationController,
    pub admin: ReplicationAdmin,
    pub net: Arc<MockConnector>,
    pub store: Arc<MockStore>,
    pub mux: Arc<RecordingMultiplexer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SlaveReplicationConfig::for_testing())
    }

    pub fn with_config(config: SlaveReplicationConfig) -> Self {
        init_tracing();
        let net = Arc::new(MockConnector::new());
        let store = Arc::new(MockStore::new());
        let mux = Arc::new(RecordingMultiplexer::new());
        let controller =
            ReplicationController::new(config, store.clone(), mux.clone(), net.clone()).unwrap();
        mux.attach(controller.disconnect_notifier());
        let admin = controller.admin();
        Self {
            controller,
            admin,
            net,
            store,
            mux,
        }
    }

    pub fn tick(&mut self) -> bool {
        self.controller.tick()
    }

    pub fn tick_n(&mut self, n: usize) {
        for _ in 0..n {
            self.controller.tick();
        }
    }

    /// Tick until a tick does nothing (at most 64 ticks).
    pub fn settle(&mut self) {
        for _ in 0..64 {
            if !self.controller.tick() {
                return;
            }
        }
    }

    pub fn add(&self, table: &str, ports: &[u16]) {
        assert!(self.admin.try_add(TableReplicationConfig::for_testing(table, ports)));
    }

    pub fn remove(&self, table: &str) {
        assert!(self.admin.try_remove(table));
    }

    pub fn handler(&self, table: &str) -> Option<HandlerStatus> {
        self.controller.status().handler(table).cloned()
    }

    pub fn phase(&self, table: &str) -> Option<HandlerPhase> {
        self.handler(table).map(|h| h.phase)
    }

    pub fn is_distressed(&self, table: &str) -> bool {
        self.controller.status().is_distressed(table)
    }

    pub fn distressed(&self, table: &str) -> Option<HandlerStatus> {
        self.controller
            .status()
            .distressed
            .into_iter()
            .find(|h| h.table_name == table)
    }
}
