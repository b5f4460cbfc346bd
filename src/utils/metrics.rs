//! Relay Metrics
//!
//! Atomic counters for connections, envelope traffic and failures.
//! A process-wide instance is reachable through [`global_metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for relay activity
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Connections refused at the connection cap
    pub connections_refused: AtomicU64,
    /// Successful subscriptions
    pub subscriptions_total: AtomicU64,
    /// Envelopes that passed verification
    pub envelopes_accepted: AtomicU64,
    /// Envelopes that failed MAC or serial checks
    pub envelopes_rejected: AtomicU64,
    /// Payloads sealed for emission
    pub envelopes_emitted: AtomicU64,
    /// Envelopes handed to a connection's outbound queue
    pub deliveries: AtomicU64,
    /// Envelopes dropped because an outbound queue was full
    pub deliveries_dropped: AtomicU64,
    /// Bytes read from peers
    pub bytes_received: AtomicU64,
    /// Bytes written to peers
    pub bytes_sent: AtomicU64,
    /// Connection-level I/O errors
    pub connection_errors: AtomicU64,
    /// Malformed or rejected commands
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            subscriptions_total: AtomicU64::new(0),
            envelopes_accepted: AtomicU64::new(0),
            envelopes_rejected: AtomicU64::new(0),
            envelopes_emitted: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_added(&self) {
        self.subscriptions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_accepted(&self) {
        self.envelopes_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_rejected(&self) {
        self.envelopes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_emitted(&self) {
        self.envelopes_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery attempt to one subscriber
    pub fn delivery(&self, accepted: bool) {
        if accepted {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn bytes_in(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_out(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            subscriptions_total: self.subscriptions_total.load(Ordering::Relaxed),
            envelopes_accepted: self.envelopes_accepted.load(Ordering::Relaxed),
            envelopes_rejected: self.envelopes_rejected.load(Ordering::Relaxed),
            envelopes_emitted: self.envelopes_emitted.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_refused = snapshot.connections_refused,
            subscriptions_total = snapshot.subscriptions_total,
            envelopes_accepted = snapshot.envelopes_accepted,
            envelopes_rejected = snapshot.envelopes_rejected,
            envelopes_emitted = snapshot.envelopes_emitted,
            deliveries = snapshot.deliveries,
            deliveries_dropped = snapshot.deliveries_dropped,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            connection_errors = snapshot.connection_errors,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Relay metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_refused: u64,
    pub subscriptions_total: u64,
    pub envelopes_accepted: u64,
    pub envelopes_rejected: u64,
    pub envelopes_emitted: u64,
    pub deliveries: u64,
    pub deliveries_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
