// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide identifiers.
//!
//! - [`PeerId`]: one per replication handler, drawn from a monotonic counter
//!   starting at 1. Ids are never reused for the lifetime of the process, so
//!   a master can tell a restarted handler apart from a stale one.
//! - [`instance_id()`]: a random 128-bit id generated once per process and
//!   sent in every `REQUEST_TABLE_INFO`, so masters can distinguish slaves
//!   that happen to reuse peer ids across restarts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use uuid::Uuid;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

static INSTANCE_ID: OnceLock<Uuid> = OnceLock::new();

/// Identifier a slave handler presents to its masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate the next unused peer id.
    pub fn next() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id received from elsewhere (e.g. a multiplexer callback).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// This process's instance id.
pub fn instance_id() -> Uuid {
    *INSTANCE_ID.get_or_init(Uuid::new_v4)
}

/// Instance id as a `u128`, the form it takes on the wire.
pub fn instance_id_u128() -> u128 {
    instance_id().as_u128()
}
