//! The pending-request tracker: in-flight `(client, worker, deadline)` per
//! sequence, with TTL-based expiry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::registry::WorkerAddr;

/// A task dispatched to a worker, awaiting its `RESULT`/`ERROR`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub client_address: SocketAddr,
    pub worker_address: Option<WorkerAddr>,
    pub created_at: Instant,
    pub payload_size: usize,
}

impl PendingRequest {
    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > timeout
    }
}

/// Tracker-wide snapshot for the observability surface.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub pending: usize,
    pub capacity: usize,
}

struct Inner {
    pending: HashMap<u32, PendingRequest>,
}

/// Thread-safe request tracker. Cheaply cloneable (wraps an `Arc`).
#[derive(Clone)]
pub struct Tracker {
    inner: std::sync::Arc<Mutex<Inner>>,
    timeout: Duration,
    max_pending: usize,
}

impl Tracker {
    #[must_use]
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
            })),
            timeout,
            max_pending,
        }
    }

    /// Record an in-flight request. Rejects (returns `false`) if the
    /// tracker is at capacity, or if `sequence` already has an entry — the
    /// at-most-one-per-sequence invariant is preserved by refusing the
    /// collision rather than overwriting it.
    pub fn add(
        &self,
        sequence: u32,
        client: SocketAddr,
        worker: Option<WorkerAddr>,
        payload_size: usize,
    ) -> bool {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.pending.len() >= self.max_pending {
            return false;
        }
        if inner.pending.contains_key(&sequence) {
            return false;
        }
        inner.pending.insert(
            sequence,
            PendingRequest {
                client_address: client,
                worker_address: worker,
                created_at: Instant::now(),
                payload_size,
            },
        );
        true
    }

    /// Atomically remove and return the pending record for `sequence`, if
    /// any. This is the `add -> complete` happens-before edge the
    /// controller relies on per-sequence.
    pub fn complete(&self, sequence: u32) -> Option<PendingRequest> {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.pending.remove(&sequence)
    }

    /// Remove every record whose age exceeds `REQUEST_TIMEOUT`. Returns the
    /// number removed.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let timeout = self.timeout;
        let before = inner.pending.len();
        inner.pending.retain(|_, req| !req.is_expired(now, timeout));
        before - inner.pending.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        TrackerSnapshot {
            pending: inner.pending.len(),
            capacity: self.max_pending,
        }
    }
}
