//! Metrics definitions for the reconciliation engine.
//!
//! This module defines all metrics used throughout the reconciler.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "deposits_credited_total",
        "Total number of deposits credited to user balances"
    );
    describe_counter!(
        "deposits_unassociated_total",
        "Total number of inbound transfers from unknown senders"
    );
    describe_counter!(
        "withdrawals_settled_total",
        "Total number of withdrawals matched to a pending request and settled"
    );
    describe_counter!(
        "transfers_duplicate_total",
        "Total number of transfers absorbed by the idempotency check"
    );
    describe_counter!(
        "transfers_discarded_total",
        "Total number of transfers discarded during classification or matching"
    );
    describe_counter!(
        "scan_cycles_total",
        "Total number of catch-up scan cycles started"
    );
    describe_counter!(
        "scan_cycles_skipped_total",
        "Total number of scan cycles skipped because the previous one was still running"
    );
    describe_counter!(
        "scan_pages_total",
        "Total number of transfer pages fetched from chain adapters"
    );
    describe_histogram!(
        "reconcile_duration_seconds",
        "Time taken to apply one classified transfer in seconds"
    );
}

/// Record a credited deposit.
pub fn record_deposit_credited(token: &str) {
    counter!("deposits_credited_total", "token" => token.to_string()).increment(1);
}

/// Record an inbound transfer from a sender with no platform user.
pub fn record_deposit_unassociated(token: &str) {
    counter!("deposits_unassociated_total", "token" => token.to_string()).increment(1);
}

/// Record a settled withdrawal.
pub fn record_withdrawal_settled(token: &str) {
    counter!("withdrawals_settled_total", "token" => token.to_string()).increment(1);
}

/// Record a transfer absorbed by the idempotency check.
pub fn record_duplicate_absorbed() {
    counter!("transfers_duplicate_total").increment(1);
}

/// Record a discarded transfer.
///
/// # Arguments
/// * `reason` - Why the transfer was discarded (e.g. "self_transfer",
///   "unsupported_token", "no_matching_request")
pub fn record_transfer_discarded(reason: &str) {
    counter!("transfers_discarded_total", "reason" => reason.to_string()).increment(1);
}

/// Record the start of a catch-up scan cycle.
pub fn record_scan_cycle(family: &str) {
    counter!("scan_cycles_total", "family" => family.to_string()).increment(1);
}

/// Record a skipped scan cycle (previous cycle still in flight).
pub fn record_scan_cycle_skipped(family: &str) {
    counter!("scan_cycles_skipped_total", "family" => family.to_string()).increment(1);
}

/// Record a fetched transfer page.
pub fn record_scan_page(family: &str) {
    counter!("scan_pages_total", "family" => family.to_string()).increment(1);
}

/// Record the duration of one reconcile application.
pub fn record_reconcile_duration(duration_secs: f64) {
    histogram!("reconcile_duration_seconds").record(duration_secs);
}

/// A timer that automatically records duration when dropped.
pub struct ReconcileTimer {
    start: Instant,
}

impl ReconcileTimer {
    /// Start a new reconcile timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ReconcileTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReconcileTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_reconcile_duration(duration);
    }
}
