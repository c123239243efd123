//! Process-lifetime activity counters.
//!
//! Counters are plain atomics bumped from the ingest and fan-out paths and
//! read back as a [`CounterSnapshot`] for status replies and the shutdown
//! summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Broker activity counters.
#[derive(Debug)]
pub struct BrokerCounters {
    /// Datagrams read from the ingest socket
    datagrams_received: AtomicU64,
    /// Datagrams dropped as malformed
    datagrams_rejected: AtomicU64,
    /// Readings handed to the broadcaster
    readings_broadcast: AtomicU64,
    /// Per-subscriber deliveries dropped because the queue was full
    deliveries_dropped: AtomicU64,
    /// Subscribers removed after their connection went away
    subscribers_pruned: AtomicU64,
    /// Subscriber connections accepted
    connections_accepted: AtomicU64,
    started_at: DateTime<Utc>,
}

impl BrokerCounters {
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            datagrams_rejected: AtomicU64::new(0),
            readings_broadcast: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            subscribers_pruned: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.datagrams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.readings_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_deliveries(&self, count: u64) {
        self.deliveries_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, count: u64) {
        self.subscribers_pruned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_rejected: self.datagrams_rejected.load(Ordering::Relaxed),
            readings_broadcast: self.readings_broadcast.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            subscribers_pruned: self.subscribers_pruned.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Broker Statistics:\n\
             - Datagrams received: {}\n\
             - Datagrams rejected: {}\n\
             - Readings broadcast: {}\n\
             - Deliveries dropped: {}\n\
             - Subscribers pruned: {}\n\
             - Connections accepted: {}\n\
             - Uptime: {} seconds",
            stats.datagrams_received,
            stats.datagrams_rejected,
            stats.readings_broadcast,
            stats.deliveries_dropped,
            stats.subscribers_pruned,
            stats.connections_accepted,
            stats.uptime_secs
        )
    }
}

impl Default for BrokerCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub datagrams_received: u64,
    pub datagrams_rejected: u64,
    pub readings_broadcast: u64,
    pub deliveries_dropped: u64,
    pub subscribers_pruned: u64,
    pub connections_accepted: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Thread-safe shared counters.
pub type SharedCounters = Arc<BrokerCounters>;
