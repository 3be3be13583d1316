// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Add/remove instructions and the bounded queue that carries them.
//!
//! Any thread may enqueue; only the controller dequeues. The queue is a
//! fixed-capacity lock-free ring (`crossbeam_queue::ArrayQueue`), so a full
//! queue is reported to the caller instead of blocking or growing.
//!
//! ```text
//!   admin thread A ──try_add────┐
//!   admin thread B ──try_remove─┼──► [ ArrayQueue ] ──pop──► controller tick
//!   admin thread C ──try_add────┘       (bounded)
//! ```

use crate::config::TableReplicationConfig;
use crate::metrics;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// A request to start or stop replicating one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationInstruction {
    Add(TableReplicationConfig),
    Remove { table_name: String },
}

impl ReplicationInstruction {
    pub fn table_name(&self) -> &str {
        match self {
            Self::Add(config) => &config.table_name,
            Self::Remove { table_name } => table_name,
        }
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Remove { .. } => "remove",
        }
    }
}

/// Bounded multi-producer queue of [`ReplicationInstruction`]s.
#[derive(Debug)]
pub struct InstructionQueue {
    inner: ArrayQueue<ReplicationInstruction>,
}

impl InstructionQueue {
    /// Create a queue holding at most `capacity` instructions.
    ///
    /// `capacity` must be non-zero; the config layer validates this.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueue without blocking. Returns `false` when full, leaving the
    /// queue unchanged.
    pub fn push(&self, instruction: ReplicationInstruction) -> bool {
        let kind = instruction.kind();
        match self.inner.push(instruction) {
            Ok(()) => {
                metrics::record_instruction(kind, "accepted");
                true
            }
            Err(_rejected) => {
                metrics::record_instruction(kind, "rejected");
                false
            }
        }
    }

    /// Dequeue the oldest instruction, if any.
    pub fn pop(&self) -> Option<ReplicationInstruction> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Cloneable handle used to request replication changes from any thread.
///
/// Obtained from [`ReplicationController::admin()`](crate::ReplicationController::admin).
#[derive(Debug, Clone)]
pub struct ReplicationAdmin {
    queue: Arc<InstructionQueue>,
}

impl ReplicationAdmin {
    pub(crate) fn new(queue: Arc<InstructionQueue>) -> Self {
        Self { queue }
    }

    /// Ask for `config.table_name` to be replicated from `config.masters`.
    ///
    /// Returns `false` if the instruction queue is full; the caller decides
    /// whether to retry. `true` only means the request was queued.
    pub fn try_add(&self, config: TableReplicationConfig) -> bool {
        self.queue.push(ReplicationInstruction::Add(config))
    }

    /// Ask for replication of `table_name` to stop.
    pub fn try_remove(&self, table_name: impl Into<String>) -> bool {
        self.queue.push(ReplicationInstruction::Remove {
            table_name: table_name.into(),
        })
    }

    /// Number of instructions waiting for the controller.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
