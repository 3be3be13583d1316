// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for slave-side table replication.
//!
//! Configuration is passed to
//! [`ReplicationController::new()`](crate::ReplicationController::new) and can
//! be constructed programmatically or deserialized from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use table_replication::config::{SlaveReplicationConfig, TableReplicationConfig};
//!
//! let config = SlaveReplicationConfig {
//!     tables: vec![TableReplicationConfig::for_testing("trades", &[9001, 9002])],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SlaveReplicationConfig
//! ├── instruction_queue_capacity: usize  # Bounded add/remove queue
//! ├── frame_buffer_size: usize           # Per-connection inbound/outbound buffer
//! ├── handshake_timeout: String          # humantime, e.g. "30s"
//! ├── idle_interval: String              # run() sleep when a tick did no work
//! └── tables: Vec<TableReplicationConfig>
//!     ├── table_name: String
//!     └── masters: Vec<MasterEndpoint>   # Ordered; the first one is primary
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! instruction_queue_capacity: 64
//! handshake_timeout: "30s"
//! tables:
//!   - table_name: "trades"
//!     masters:
//!       - address: "10.0.0.11"
//!         port: 9001
//!       - address: "10.0.0.12"
//!         port: 9001
//! ```

use crate::error::{ReplicationError, Result};
use crate::protocol::MIN_FRAME_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationController::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationController::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveReplicationConfig {
    /// Maximum number of pending add/remove instructions.
    /// `try_add`/`try_remove` return `false` once this many are queued.
    #[serde(default = "default_instruction_queue_capacity")]
    pub instruction_queue_capacity: usize,

    /// Size of each connection's inbound and outbound frame buffer (bytes).
    /// A frame larger than this is rejected as malformed.
    #[serde(default = "default_frame_buffer_size")]
    pub frame_buffer_size: usize,

    /// How long a handler may spend before handing off to the multiplexer
    /// (e.g., "30s", "2m").
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: String,

    /// How long `run()` sleeps after a tick that did no work (e.g., "10ms").
    #[serde(default = "default_idle_interval")]
    pub idle_interval: String,

    /// Tables to start replicating as soon as the controller is built.
    #[serde(default)]
    pub tables: Vec<TableReplicationConfig>,
}

fn default_instruction_queue_capacity() -> usize {
    64
}

fn default_frame_buffer_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_handshake_timeout() -> String {
    "30s".to_string()
}

fn default_idle_interval() -> String {
    "10ms".to_string()
}

impl Default for SlaveReplicationConfig {
    fn default() -> Self {
        Self {
            instruction_queue_capacity: default_instruction_queue_capacity(),
            frame_buffer_size: default_frame_buffer_size(),
            handshake_timeout: default_handshake_timeout(),
            idle_interval: default_idle_interval(),
            tables: Vec::new(),
        }
    }
}

impl SlaveReplicationConfig {
    /// Create a small config for testing.
    pub fn for_testing() -> Self {
        Self {
            instruction_queue_capacity: 8,
            frame_buffer_size: 64 * 1024,
            handshake_timeout: "5s".to_string(),
            idle_interval: "1ms".to_string(),
            tables: Vec::new(),
        }
    }

    /// Parse handshake_timeout string to Duration.
    pub fn handshake_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.handshake_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Parse idle_interval string to Duration.
    pub fn idle_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_interval).unwrap_or(Duration::from_millis(10))
    }

    /// Check the config for values the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.instruction_queue_capacity == 0 {
            return Err(ReplicationError::Config(
                "instruction_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.frame_buffer_size < MIN_FRAME_BUFFER_SIZE {
            return Err(ReplicationError::Config(format!(
                "frame_buffer_size must be at least {} bytes, got {}",
                MIN_FRAME_BUFFER_SIZE, self.frame_buffer_size
            )));
        }
        if self.frame_buffer_size > u32::MAX as usize {
            return Err(ReplicationError::Config(format!(
                "frame_buffer_size must fit a u32 frame length, got {}",
                self.frame_buffer_size
            )));
        }
        for table in &self.tables {
            table.validate()?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-table config: the payload of an Add instruction
// ═══════════════════════════════════════════════════════════════════════════════

/// One table to replicate and the masters that serve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReplicationConfig {
    /// Table name, identical on slave and masters.
    pub table_name: String,

    /// Ordered master endpoints. The first one negotiates the stream.
    pub masters: Vec<MasterEndpoint>,
}

impl TableReplicationConfig {
    pub fn new(table_name: impl Into<String>, masters: Vec<MasterEndpoint>) -> Self {
        Self {
            table_name: table_name.into(),
            masters,
        }
    }

    /// Create a table config with loopback masters on the given ports.
    pub fn for_testing(table_name: &str, ports: &[u16]) -> Self {
        Self {
            table_name: table_name.to_string(),
            masters: ports
                .iter()
                .map(|port| MasterEndpoint::new("127.0.0.1", *port))
                .collect(),
        }
    }

    /// Reject empty names, empty master lists and unparseable addresses.
    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(ReplicationError::Config("table_name must not be empty".to_string()));
        }
        if self.masters.is_empty() {
            return Err(ReplicationError::Config(format!(
                "table '{}' has no master endpoints",
                self.table_name
            )));
        }
        for master in &self.masters {
            master.socket_addr()?;
        }
        Ok(())
    }
}

/// Network address of one master replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterEndpoint {
    /// IP literal (v4 or v6). Hostnames are not resolved.
    pub address: String,
    pub port: u16,
}

impl MasterEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.address.parse().map_err(|_| {
            ReplicationError::Config(format!(
                "master address '{}' is not an IP literal",
                self.address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for MasterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
