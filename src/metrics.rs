//! Bus activity counters.
//!
//! A single [`Metrics`] instance is shared between the server and the broker
//! adapters. Counters are plain atomics so callers (and tests) can read them
//! back without an exporter in the loop.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for connection, call, result, and event activity.
///
/// All methods are cheap and lock-free; share the struct behind an `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    calls_submitted: AtomicU64,
    calls_expired: AtomicU64,
    results_delivered: AtomicU64,
    results_dropped: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
}

impl Metrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_call_submitted(&self) {
        self.calls_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_expired(&self) {
        self.calls_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_dropped(&self) {
        self.results_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections currently open on the server.
    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Calls accepted and handed to the broker.
    pub fn calls_submitted(&self) -> u64 {
        self.calls_submitted.load(Ordering::Relaxed)
    }

    /// Calls whose deadline passed before a result arrived.
    pub fn calls_expired(&self) -> u64 {
        self.calls_expired.load(Ordering::Relaxed)
    }

    /// Results written back to a caller connection.
    pub fn results_delivered(&self) -> u64 {
        self.results_delivered.load(Ordering::Relaxed)
    }

    /// Results lost to expiry, double-claims, or queue overflow.
    pub fn results_dropped(&self) -> u64 {
        self.results_dropped.load(Ordering::Relaxed)
    }

    /// Events accepted for publication.
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Events written out to subscriber connections.
    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    /// Events dropped because a subscriber queue overflowed.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}
