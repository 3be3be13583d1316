// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for slave-side table replication.
//!
//! Every failure a replication handler can hit during its handshake with the
//! master replicas is expressed as a [`ReplicationError`]. A handler that
//! observes one of these stops and, unless an operator asked for the stop,
//! ends up distressed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connect` | Yes | Master unreachable, connection refused |
//! | `Io` | Yes | Socket read/write failure after connecting |
//! | `ConnectionClosed` | Yes | Master closed the socket mid-handshake |
//! | `HandshakeTimeout` | Yes | Masters did not answer in time |
//! | `Frame` | No | Malformed frame on the wire |
//! | `Protocol` | No | Well-formed but unexpected frame |
//! | `TableMissingOnMaster` | No | Master does not have the table |
//! | `MasterDivergence` | No | Masters disagree about the table |
//! | `StructureVersionMismatch` | No | Local schema differs from the master's |
//! | `Storage` | No | Local storage engine refused an operation |
//! | `Config` | No | Configuration invalid |
//! | `InvalidTransition` | No | Handler state machine violation |
//!
//! # Retry Behavior
//!
//! Handlers never retry on their own. [`ReplicationError::is_retryable()`]
//! tells an operator (or a supervising process) whether re-adding the table
//! is likely to succeed without intervention.

use crate::controller::HandlerPhase;
use crate::protocol::FrameError;
use crate::storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while bringing a table into replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Non-blocking connect to a master failed.
    #[error("Connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Socket read or write failed on an established connection.
    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The master closed the connection before the handshake completed.
    #[error("Connection to {endpoint} closed by master")]
    ConnectionClosed { endpoint: String },

    /// Bytes on the wire could not be decoded into a frame.
    #[error("Malformed frame from {endpoint}: {source}")]
    Frame {
        endpoint: String,
        #[source]
        source: FrameError,
    },

    /// A decodable frame arrived that the handshake does not allow here.
    #[error("Protocol violation from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },

    /// The master answered `TABLE_INFO` with table id 0.
    #[error("Table '{table}' does not exist on master {endpoint}")]
    TableMissingOnMaster { table: String, endpoint: String },

    /// Two masters described the same table differently.
    #[error("Masters disagree about table '{table}': {message}")]
    MasterDivergence { table: String, message: String },

    /// The local table's structure version differs from the master's.
    ///
    /// Not retryable - the local schema must be reconciled first.
    #[error("Structure version mismatch for table '{table}': local {local}, master {master}")]
    StructureVersionMismatch { table: String, local: u64, master: u64 },

    /// The local storage engine failed to check, open or create the table.
    #[error("Storage error ({operation}) for table '{table}': {source}")]
    Storage {
        table: String,
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    /// Handshake did not reach handoff within the configured timeout.
    #[error("Handshake for table '{table}' timed out after {elapsed_ms}ms")]
    HandshakeTimeout { table: String, elapsed_ms: u64 },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handler asked to move between phases that are not connected.
    #[error("Invalid handler transition: {from} -> {to}")]
    InvalidTransition { from: HandlerPhase, to: HandlerPhase },
}

impl ReplicationError {
    /// Create a protocol violation error.
    pub fn protocol(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a storage error for the given table and operation.
    pub fn storage(table: impl Into<String>, operation: &'static str, source: StorageError) -> Self {
        Self::Storage {
            table: table.into(),
            operation,
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::Io { .. } => true,
            Self::ConnectionClosed { .. } => true,
            Self::HandshakeTimeout { .. } => true,
            Self::Frame { .. } => false,
            Self::Protocol { .. } => false,
            Self::TableMissingOnMaster { .. } => false,
            Self::MasterDivergence { .. } => false,
            Self::StructureVersionMismatch { .. } => false,
            Self::Storage { .. } => false, // Local storage needs attention
            Self::Config(_) => false,
            Self::InvalidTransition { .. } => false,
        }
    }

    /// Stable short label, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Io { .. } => "io",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::Frame { .. } => "frame",
            Self::Protocol { .. } => "protocol",
            Self::TableMissingOnMaster { .. } => "table_missing",
            Self::MasterDivergence { .. } => "master_divergence",
            Self::StructureVersionMismatch { .. } => "structure_version",
            Self::Storage { .. } => "storage",
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::Config(_) => "config",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }
}
