// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory table store.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use table_replication::{BoxedWriter, StorageError, TableStore, TableWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredTable {
    pub structure_version: u64,
    pub row_count: u64,
}

/// One `create_table` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTable {
    pub table_name: String,
    pub metadata: Bytes,
    pub symbols: Bytes,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<String, StoredTable>,
    created: Vec<CreatedTable>,
    writers_opened: usize,
    fail_open: Option<StorageError>,
    fail_create: Option<StorageError>,
    fail_exists: Option<StorageError>,
}

#[derive(Debug, Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table_name: &str, structure_version: u64, row_count: u64) -> Self {
        self.insert(table_name, structure_version, row_count);
        self
    }

    pub fn insert(&self, table_name: &str, structure_version: u64, row_count: u64) {
        self.state.lock().unwrap().tables.insert(
            table_name.to_string(),
            StoredTable {
                structure_version,
                row_count,
            },
        );
    }

    pub fn table(&self, table_name: &str) -> Option<StoredTable> {
        self.state.lock().unwrap().tables.get(table_name).copied()
    }

    pub fn created(&self) -> Vec<CreatedTable> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn writers_opened(&self) -> usize {
        self.state.lock().unwrap().writers_opened
    }

    pub fn fail_open(&self, err: StorageError) {
        self.state.lock().unwrap().fail_open = Some(err);
    }

    pub fn fail_create(&self, err: StorageError) {
        self.state.lock().unwrap().fail_create = Some(err);
    }

    pub fn fail_exists(&self, err: StorageError) {
        self.state.lock().unwrap().fail_exists = Some(err);
    }
}

impl TableStore for MockStore {
    fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.fail_exists {
            return Err(err.clone());
        }
        Ok(state.tables.contains_key(table_name))
    }

    fn open_writer(&self, table_name: &str) -> Result<BoxedWriter, StorageError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.fail_open {
            return Err(err.clone());
        }
        let table = state
            .tables
            .get(table_name)
            .copied()
            .ok_or_else(|| StorageError::new(format!("table {table_name} does not exist")))?;
        state.writers_opened += 1;
        Ok(Box::new(MockWriter {
            table_name: table_name.to_string(),
            table,
        }))
    }

    fn create_table(
        &self,
        table_name: &str,
        metadata: &Bytes,
        symbols: &Bytes,
    ) -> Result<BoxedWriter, StorageError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.fail_create {
            return Err(err.clone());
        }
        state.created.push(CreatedTable {
            table_name: table_name.to_string(),
            metadata: metadata.clone(),
            symbols: symbols.clone(),
        });
        // Version is carried as the first 8 metadata bytes when present.
        let structure_version = metadata
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0);
        let table = StoredTable {
            structure_version,
            row_count: 0,
        };
        state.tables.insert(table_name.to_string(), table);
        state.writers_opened += 1;
        Ok(Box::new(MockWriter {
            table_name: table_name.to_string(),
            table,
        }))
    }
}

#[derive(Debug)]
pub struct MockWriter {
    table_name: String,
    table: StoredTable,
}

impl TableWriter for MockWriter {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn structure_version(&self) -> u64 {
        self.table.structure_version
    }

    fn row_count(&self) -> u64 {
        self.table.row_count
    }
}
