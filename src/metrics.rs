// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Instruction queue traffic
//! - Master connections and handshake frames
//! - Handler phase transitions and outcomes
//! - Handoff retries against the streaming multiplexer
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `slave_replication_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use table_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_instruction("add", "accepted");
//! metrics::record_handshake_duration("trades", Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an add/remove instruction and what happened to it.
///
/// `outcome` is one of `accepted`, `rejected` (queue full), `applied`, `ignored`.
pub fn record_instruction(kind: &str, outcome: &str) {
    counter!(
        "slave_replication_instructions_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a master connection event (`connected`, `failed`, `closed`).
pub fn record_connection_event(table: &str, event: &str) {
    counter!(
        "slave_replication_connection_events_total",
        "table" => table.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a handshake frame written to a master.
pub fn record_frame_sent(frame_type: &str) {
    counter!("slave_replication_frames_sent_total", "frame_type" => frame_type.to_string()).increment(1);
}

/// Record a handshake frame decoded from a master.
pub fn record_frame_received(frame_type: &str) {
    counter!("slave_replication_frames_received_total", "frame_type" => frame_type.to_string())
        .increment(1);
}

/// Record a handler entering `phase`.
pub fn record_phase_transition(phase: &str) {
    counter!("slave_replication_phase_transitions_total", "phase" => phase.to_string()).increment(1);
}

/// Record a handler reaching a terminal outcome (`stopped` or `distressed`).
pub fn record_handler_outcome(table: &str, outcome: &str) {
    counter!(
        "slave_replication_handler_outcomes_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a handler failure by error kind.
pub fn record_failure(kind: &str) {
    counter!("slave_replication_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record the multiplexer refusing a handoff (`writer`, `connection`, `stop`).
pub fn record_handoff_retry(target: &str) {
    counter!("slave_replication_handoff_retries_total", "target" => target.to_string()).increment(1);
}

/// Record a table being created locally from master metadata.
pub fn record_table_created(table: &str) {
    counter!("slave_replication_tables_created_total", "table" => table.to_string()).increment(1);
}

/// Record time from handler start to handoff.
pub fn record_handshake_duration(table: &str, duration: Duration) {
    histogram!("slave_replication_handshake_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Set handler population gauges.
pub fn set_handler_counts(initializing: usize, streaming: usize, distressed: usize) {
    gauge!("slave_replication_handlers", "set" => "initializing").set(initializing as f64);
    gauge!("slave_replication_handlers", "set" => "streaming").set(streaming as f64);
    gauge!("slave_replication_handlers", "set" => "distressed").set(distressed as f64);
}

/// Set the number of instructions waiting in the queue.
pub fn set_pending_instructions(pending: usize) {
    gauge!("slave_replication_pending_instructions").set(pending as f64);
}
