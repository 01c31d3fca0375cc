//! Process-wide proxy metrics
//!
//! Four counters exposed over the management channel: sessions alive
//! right now, sessions ever accepted, mail bytes delivered to clients,
//! and complete RETR deliveries. Sessions run as independent tasks, so
//! the counters are atomics behind an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    concurrent_connections: AtomicU64,
    historical_accesses: AtomicU64,
    transferred_bytes: AtomicU64,
    retrieved_messages: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub concurrent_connections: u64,
    pub historical_accesses: u64,
    pub transferred_bytes: u64,
    pub retrieved_messages: u64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per accepted client connection.
    pub fn connection_opened(&self) {
        self.concurrent_connections.fetch_add(1, Ordering::Relaxed);
        self.historical_accesses.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per session teardown.
    pub fn connection_closed(&self) {
        self.concurrent_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Mail bytes written to a client (RETR relay and transformation
    /// output).
    pub fn add_transferred(&self, bytes: u64) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A RETR response (transformed or not) was fully delivered.
    pub fn message_retrieved(&self) {
        self.retrieved_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            concurrent_connections: self.concurrent_connections.load(Ordering::Relaxed),
            historical_accesses: self.historical_accesses.load(Ordering::Relaxed),
            transferred_bytes: self.transferred_bytes.load(Ordering::Relaxed),
            retrieved_messages: self.retrieved_messages.load(Ordering::Relaxed),
        }
    }
}
