//! Process-wide monotonic counters.
//!
//! Each field is an independent atomic; cross-field consistency of a single
//! [`Counters::snapshot`] call is not guaranteed or required. Every
//! increment here is mirrored through the `metrics` crate so an external
//! Prometheus scraper sees the same totals as `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
}

/// A point-in-time read of [`Counters`], suitable for JSON serialization on
/// the `/metrics` surface.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `datagrams` physical datagrams and `bytes` wire bytes to the
    /// sent-side totals. `send_chunked` can write several datagrams for one
    /// logical forward, so `datagrams` is not always 1 — callers must pass
    /// the actual count rather than assuming one call means one datagram.
    pub fn record_sent(&self, datagrams: u64, bytes: usize) {
        self.messages_sent.fetch_add(datagrams, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("meshctl_messages_sent_total").increment(datagrams);
        metrics::counter!("meshctl_bytes_sent_total").increment(bytes as u64);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("meshctl_messages_received_total").increment(1);
        metrics::counter!("meshctl_bytes_received_total").increment(bytes as u64);
    }

    pub fn record_task_processed(&self) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("meshctl_tasks_processed_total").increment(1);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("meshctl_tasks_failed_total").increment(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let counters = Counters::new();
        counters.record_sent(1, 10);
        counters.record_received(20);
        counters.record_task_processed();
        counters.record_task_failed();

        let snap = counters.snapshot();
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 20);
        assert_eq!(snap.tasks_processed, 1);
        assert_eq!(snap.tasks_failed, 1);

        counters.record_sent(1, 5);
        let snap2 = counters.snapshot();
        assert_eq!(snap2.messages_sent, 2);
        assert_eq!(snap2.bytes_sent, 15);
    }

    #[test]
    fn record_sent_credits_multiple_datagrams_at_once() {
        let counters = Counters::new();
        // A single chunked forward can write several physical datagrams;
        // messages_sent must track datagrams, not logical send() calls.
        counters.record_sent(4, 5600);
        let snap = counters.snapshot();
        assert_eq!(snap.messages_sent, 4);
        assert_eq!(snap.bytes_sent, 5600);
    }
}
