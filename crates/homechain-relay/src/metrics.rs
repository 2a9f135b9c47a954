//! Relay metrics.
//!
//! Counters complement the structured logs: every publish attempt, success,
//! and terminal failure is both logged and counted here.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Ingestion
// ============================================================================

/// Events read from the ledger.
pub const EVENTS_INGESTED: &str = "homechain_events_ingested_total";

/// Events skipped before reaching a worker (foreign emitter, unknown kind, decode failure).
pub const EVENTS_SKIPPED: &str = "homechain_events_skipped_total";

/// Cursor rewinds caused by ledger reorganizations.
pub const REORG_REWINDS: &str = "homechain_reorg_rewinds_total";

/// Ledger reconnects after a lost subscription.
pub const LEDGER_RECONNECTS: &str = "homechain_ledger_reconnects_total";

/// Block height of the last persisted cursor.
pub const CURSOR_HEIGHT: &str = "homechain_cursor_height";

/// Cursor writes that failed.
pub const CURSOR_WRITE_FAILURES: &str = "homechain_cursor_write_failures_total";

// ============================================================================
// Pipeline
// ============================================================================

/// Events dropped after reconciliation retries ran out.
pub const RECONCILE_FAILURES: &str = "homechain_reconcile_failures_total";

/// Publish attempts, including retries.
pub const PUBLISH_ATTEMPTS: &str = "homechain_publish_attempts_total";

/// Commands acknowledged by the bus.
pub const PUBLISH_SUCCESS: &str = "homechain_publish_success_total";

/// Commands dropped after publish retries ran out.
pub const PUBLISH_FAILURES: &str = "homechain_publish_failures_total";

/// Dispatches that found their worker's queue full and had to wait.
pub const WORKER_QUEUE_FULL: &str = "homechain_worker_queue_full_total";

/// End-to-end latency of one event through resolve, reconcile, and publish.
pub const PIPELINE_DURATION: &str = "homechain_pipeline_duration_seconds";

/// Registers all relay metric descriptions.
///
/// Call this once at startup after installing a metrics recorder.
pub fn register_metrics() {
    describe_counter!(EVENTS_INGESTED, "Ledger events read by the ingestor");
    describe_counter!(EVENTS_SKIPPED, "Ledger events skipped before processing");
    describe_counter!(REORG_REWINDS, "Cursor rewinds caused by reorganizations");
    describe_counter!(LEDGER_RECONNECTS, "Ledger subscription reconnects");
    describe_gauge!(CURSOR_HEIGHT, "Block height of the persisted cursor");
    describe_counter!(CURSOR_WRITE_FAILURES, "Failed cursor writes");
    describe_counter!(RECONCILE_FAILURES, "Events dropped after reconciliation retries");
    describe_counter!(PUBLISH_ATTEMPTS, "Device bus publish attempts");
    describe_counter!(PUBLISH_SUCCESS, "Commands acknowledged by the device bus");
    describe_counter!(PUBLISH_FAILURES, "Commands dropped after publish retries");
    describe_counter!(WORKER_QUEUE_FULL, "Dispatches that waited on a full worker queue");
    describe_histogram!(PIPELINE_DURATION, "Per-event pipeline duration in seconds");
}

pub fn record_ingested() {
    counter!(EVENTS_INGESTED).increment(1);
}

pub fn record_skipped(reason: &'static str) {
    counter!(EVENTS_SKIPPED, "reason" => reason).increment(1);
}

pub fn record_reorg_rewind() {
    counter!(REORG_REWINDS).increment(1);
}

pub fn record_reconnect() {
    counter!(LEDGER_RECONNECTS).increment(1);
}

pub fn record_cursor(height: u64) {
    gauge!(CURSOR_HEIGHT).set(height as f64);
}

pub fn record_cursor_write_failure() {
    counter!(CURSOR_WRITE_FAILURES).increment(1);
}

pub fn record_reconcile_failure(kind: &'static str) {
    counter!(RECONCILE_FAILURES, "kind" => kind).increment(1);
}

pub fn record_publish_attempt(room_id: u32) {
    counter!(PUBLISH_ATTEMPTS, "room" => room_id.to_string()).increment(1);
}

pub fn record_publish_success(room_id: u32) {
    counter!(PUBLISH_SUCCESS, "room" => room_id.to_string()).increment(1);
}

pub fn record_publish_failure(room_id: u32) {
    counter!(PUBLISH_FAILURES, "room" => room_id.to_string()).increment(1);
}

pub fn record_pipeline_duration(kind: &'static str, secs: f64) {
    histogram!(PIPELINE_DURATION, "kind" => kind).record(secs);
}

pub fn record_queue_full(worker: usize) {
    counter!(WORKER_QUEUE_FULL, "worker" => worker.to_string()).increment(1);
}
