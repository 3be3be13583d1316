// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Table Replication
//!
//! Slave-side table replication for an embedded time-series database.
//!
//! For each replicated table the slave connects to every configured master,
//! agrees with all of them on the table's identity and schema, creates the
//! table locally if needed, and hands the writer and sockets to a streaming
//! multiplexer that applies the row data.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                            table-replication                               │
//! │                                                                            │
//! │  any thread                     controller thread                          │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌───────────────────────┐   │
//! │  │ ReplicationAdmin │──►│ InstructionQueue │──►│ ReplicationController │   │
//! │  │ try_add/remove   │   │ (bounded MPSC)   │   │ tick()                │   │
//! │  └──────────────────┘   └──────────────────┘   └───────────┬───────────┘   │
//! │                                                            │ per table     │
//! │                                                            ▼               │
//! │                                              ┌──────────────────────────┐  │
//! │                                              │ ReplicationHandler       │  │
//! │                                              │  FramedConnection × N ───┼──┼──► masters
//! │                                              │  TableWriter             │  │
//! │                                              └────────────┬─────────────┘  │
//! │                                                handoff    │                │
//! │                                                           ▼                │
//! │  ┌───────────────────┐  on_peer_disconnected  ┌──────────────────────────┐ │
//! │  │DisconnectNotifier │◄───────────────────────│ StreamingMultiplexer     │ │
//! │  └───────────────────┘                        │ (external)               │ │
//! │                                               └──────────────────────────┘ │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use table_replication::{
//!     ReplicationController, SlaveReplicationConfig, TableReplicationConfig, TcpConnector,
//! };
//! use tokio::sync::watch;
//!
//! let controller = ReplicationController::new(
//!     SlaveReplicationConfig::default(),
//!     store,        // Arc<dyn TableStore>
//!     multiplexer,  // Arc<dyn StreamingMultiplexer>
//!     Arc::new(TcpConnector),
//! )?;
//! let admin = controller.admin();
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let task = controller.spawn(shutdown_rx);
//!
//! admin.try_add(TableReplicationConfig::for_testing("trades", &[9001, 9002]));
//! // ...
//! shutdown_tx.send(true)?;
//! task.await?;
//! ```

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod identity;
pub mod instruction;
pub mod metrics;
pub mod multiplexer;
pub mod protocol;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use config::{MasterEndpoint, SlaveReplicationConfig, TableReplicationConfig};
pub use controller::{ControllerStatus, HandlerPhase, HandlerStatus, ReplicationController};
pub use error::{ReplicationError, Result};
pub use identity::PeerId;
pub use instruction::{ReplicationAdmin, ReplicationInstruction};
pub use multiplexer::{DisconnectNotifier, PeerDisconnection, SocketHandoff, StreamingMultiplexer};
pub use storage::{BoxedWriter, StorageError, TableStore, TableWriter};
pub use transport::{BoxedSocket, ConnectStatus, Connector, ReplicationSocket, SocketId, TcpConnector};
