// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local storage engine seam.
//!
//! Replication needs three things from the storage engine: whether a table
//! exists, an exclusive writer for it, and the ability to create it from
//! metadata shipped by the master. Everything else about storage is the
//! engine's business.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Failure reported by the storage engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}{}", errno.map(|e| format!(" (errno {})", e)).unwrap_or_default())]
pub struct StorageError {
    /// OS error number, when the failure came from a system call.
    pub errno: Option<i32>,
    pub message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            errno: None,
            message: message.into(),
        }
    }

    pub fn with_errno(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno: Some(errno),
            message: message.into(),
        }
    }
}

/// Exclusive write access to one local table.
pub trait TableWriter: Send + fmt::Debug {
    fn table_name(&self) -> &str;

    /// Schema version; must equal the master's before streaming.
    fn structure_version(&self) -> u64;

    /// Rows already present locally. Replication resumes after them.
    fn row_count(&self) -> u64;
}

pub type BoxedWriter = Box<dyn TableWriter>;

/// The storage engine as seen by replication.
pub trait TableStore: Send + Sync {
    fn table_exists(&self, table_name: &str) -> Result<bool, StorageError>;

    /// Open the table's writer. Fails if another writer holds it.
    fn open_writer(&self, table_name: &str) -> Result<BoxedWriter, StorageError>;

    /// Create the table from the master's metadata and symbol tables, then
    /// return its writer.
    fn create_table(
        &self,
        table_name: &str,
        metadata: &Bytes,
        symbols: &Bytes,
    ) -> Result<BoxedWriter, StorageError>;
}
