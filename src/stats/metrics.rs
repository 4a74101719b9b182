//! Statistics and metrics for the relay

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::registry::NotifyReport;

/// Relay-wide counters
///
/// Shared between the supervisor and the consumer loop via `Arc`. All counters
/// are monotonic.
#[derive(Debug)]
pub struct RelayStats {
    started_at: Instant,
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    invalid_keys: AtomicU64,
    envelopes_dispatched: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    connections_opened: AtomicU64,
    reconnects_scheduled: AtomicU64,
}

impl RelayStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            invalid_keys: AtomicU64::new(0),
            envelopes_dispatched: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_key(&self) {
        self.invalid_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, report: &NotifyReport) {
        self.envelopes_dispatched.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.started_at.elapsed(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            invalid_keys: self.invalid_keys.load(Ordering::Relaxed),
            envelopes_dispatched: self.envelopes_dispatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`RelayStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Time since the counters were created
    pub uptime: Duration,
    /// Raw messages taken off the broker
    pub messages_received: u64,
    /// Messages dropped because the body was not JSON
    pub decode_failures: u64,
    /// Messages dropped because the routing key was rejected
    pub invalid_keys: u64,
    /// Envelopes handed to the registry
    pub envelopes_dispatched: u64,
    /// Successful per-subscriber deliveries
    pub deliveries: u64,
    /// Failed per-subscriber deliveries
    pub delivery_failures: u64,
    /// Broker connections that reached the open state
    pub connections_opened: u64,
    /// Reconnects scheduled after an unexpected close
    pub reconnects_scheduled: u64,
}

impl StatsSnapshot {
    /// Messages dropped before fan-out
    pub fn dropped(&self) -> u64 {
        self.decode_failures + self.invalid_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_stats_new() {
        let stats = RelayStats::new().snapshot();
        assert_eq!(stats.messages_received, 0);
        assert_eq!(stats.deliveries, 0);
        assert_eq!(stats.connections_opened, 0);
        assert_eq!(stats.dropped(), 0);
    }

    #[test]
    fn test_record_dispatch() {
        let stats = RelayStats::new();
        stats.record_dispatch(&NotifyReport {
            considered: 4,
            delivered: 3,
            failed: 1,
        });
        stats.record_dispatch(&NotifyReport {
            considered: 4,
            delivered: 2,
            failed: 0,
        });

        let snap = stats.snapshot();
        assert_eq!(snap.envelopes_dispatched, 2);
        assert_eq!(snap.deliveries, 5);
        assert_eq!(snap.delivery_failures, 1);
    }

    #[test]
    fn test_dropped_counts_both_reasons() {
        let stats = RelayStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_decode_failure();
        stats.record_invalid_key();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.dropped(), 2);
    }

    #[test]
    fn test_connection_counters() {
        let stats = RelayStats::new();
        stats.record_connection_opened();
        stats.record_reconnect_scheduled();
        stats.record_connection_opened();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_opened, 2);
        assert_eq!(snap.reconnects_scheduled, 1);
    }
}
