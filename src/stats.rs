//! Process-wide traffic counters
//!
//! Counts are taken on the client leg of every connection: `received` is what
//! clients sent us, `sent` is what we delivered back to them. Readers take a
//! snapshot without locking; the totals only ever grow.

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate byte counters
#[derive(Debug, Default)]
pub struct TrafficCounters {
    received: AtomicU64,
    sent: AtomicU64,
    connections: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSnapshot {
    /// Bytes read from clients
    pub received: u64,
    /// Bytes written to clients
    pub sent: u64,
    /// Connections accepted since start
    pub connections: u64,
}

impl TrafficCounters {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` bytes read from a client
    pub fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    /// Add `n` bytes written to a client
    pub fn record_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one accepted connection
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

lazy_static! {
    static ref TRAFFIC: TrafficCounters = TrafficCounters::new();
}

/// The process-wide counters
pub fn global() -> &'static TrafficCounters {
    &TRAFFIC
}

/// Add `n` to the received total
pub fn record_received(n: u64) {
    TRAFFIC.record_received(n);
}

/// Add `n` to the sent total
pub fn record_sent(n: u64) {
    TRAFFIC.record_sent(n);
}

/// Count one accepted connection
pub fn record_connection() {
    TRAFFIC.record_connection();
}

/// Total bytes received so far
pub fn total_received() -> u64 {
    TRAFFIC.received.load(Ordering::Relaxed)
}

/// Total bytes sent so far
pub fn total_sent() -> u64 {
    TRAFFIC.sent.load(Ordering::Relaxed)
}

/// Read the process-wide counters
pub fn snapshot() -> TrafficSnapshot {
    TRAFFIC.snapshot()
}
