//! The worker registry: liveness tracking, busyness, and load-aware
//! selection.
//!
//! Workers are identified by `(source_ip, announced_port)`, not by the
//! source port of their heartbeat datagram. All public operations acquire
//! the registry's single mutex; snapshots never observe a partial update.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// `(source IP, announced listen port)`. Ordered so the registry's
/// internal map gives a stable iteration order for round-robin and
/// `prefer_idle` selection.
pub type WorkerAddr = (IpAddr, u16);

#[derive(Debug, Clone)]
struct WorkerInfo {
    last_heartbeat: Instant,
    tasks_completed: u64,
    tasks_failed: u64,
    avg_latency_ms: f64,
    current_task: Option<u32>,
}

impl WorkerInfo {
    fn new(now: Instant) -> Self {
        Self {
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_latency_ms: 0.0,
            current_task: None,
        }
    }

    fn is_healthy(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < timeout
    }
}

/// A single worker's stats, as exposed by [`Registry::snapshot`].
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct WorkerStats {
    pub address: String,
    pub healthy: bool,
    pub busy: bool,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_latency_ms: f64,
}

/// Registry-wide snapshot for the observability surface.
#[derive(Debug, Serialize, Clone, PartialEq, Default)]
pub struct RegistrySnapshot {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub busy_workers: usize,
    pub workers: Vec<WorkerStats>,
}

struct Inner {
    workers: BTreeMap<WorkerAddr, WorkerInfo>,
    rr_index: u64,
}

/// Thread-safe worker registry. Cheaply cloneable (wraps an `Arc`) so every
/// task that needs it — dispatcher, maintenance, observability — can hold
/// its own handle.
#[derive(Clone)]
pub struct Registry {
    inner: std::sync::Arc<Mutex<Inner>>,
    timeout: Duration,
}

impl Registry {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                workers: BTreeMap::new(),
                rr_index: 0,
            })),
            timeout,
        }
    }

    /// Register a heartbeat from `addr`. Returns `true` if this created a
    /// new [`WorkerInfo`], `false` if it only refreshed an existing one.
    pub fn register(&self, addr: WorkerAddr) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner.workers.get_mut(&addr) {
            Some(info) => {
                info.last_heartbeat = now;
                false
            }
            None => {
                inner.workers.insert(addr, WorkerInfo::new(now));
                true
            }
        }
    }

    /// Select the next worker to dispatch a task to. Filters to healthy
    /// workers; if `prefer_idle` and at least one healthy worker has no
    /// `current_task`, returns the first such in iteration order. Otherwise
    /// advances a monotonic round-robin counter, reduced modulo the
    /// healthy set at lookup time so churn doesn't desynchronize it badly.
    /// Returns `None` iff no healthy worker exists.
    pub fn pick(&self, prefer_idle: bool) -> Option<WorkerAddr> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let healthy: Vec<WorkerAddr> = inner
            .workers
            .iter()
            .filter(|(_, info)| info.is_healthy(now, self.timeout))
            .map(|(addr, _)| *addr)
            .collect();
        if healthy.is_empty() {
            return None;
        }
        if prefer_idle {
            if let Some(addr) = healthy.iter().find(|addr| {
                inner
                    .workers
                    .get(*addr)
                    .map(|info| info.current_task.is_none())
                    .unwrap_or(false)
            }) {
                return Some(*addr);
            }
        }
        inner.rr_index = inner.rr_index.wrapping_add(1);
        let idx = (inner.rr_index as usize) % healthy.len();
        Some(healthy[idx])
    }

    /// Mark `addr` as working on `sequence`. No-op if the worker is gone
    /// (e.g. pruned between `pick` and `assign`).
    pub fn assign(&self, addr: WorkerAddr, sequence: u32) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(info) = inner.workers.get_mut(&addr) {
            info.current_task = Some(sequence);
        }
    }

    /// Clear `addr`'s current task. On success, increments `tasks_completed`
    /// and updates the cumulative mean latency; on failure, increments only
    /// `tasks_failed`. No-op if the worker is gone.
    pub fn complete(&self, addr: WorkerAddr, latency_ms: f64, success: bool) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(info) = inner.workers.get_mut(&addr) {
            info.current_task = None;
            if success {
                info.tasks_completed += 1;
                let n = info.tasks_completed as f64;
                info.avg_latency_ms = ((n - 1.0) * info.avg_latency_ms + latency_ms) / n;
            } else {
                info.tasks_failed += 1;
            }
        }
    }

    /// Remove every worker failing [`WorkerInfo::is_healthy`]. Returns the
    /// number removed.
    pub fn prune_stale(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let timeout = self.timeout;
        let before = inner.workers.len();
        inner.workers.retain(|_, info| info.is_healthy(now, timeout));
        before - inner.workers.len()
    }

    /// Totals and a per-worker dump, for the observability surface.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let now = Instant::now();
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut healthy_workers = 0;
        let mut busy_workers = 0;
        let workers = inner
            .workers
            .iter()
            .map(|(addr, info)| {
                let healthy = info.is_healthy(now, self.timeout);
                let busy = info.current_task.is_some();
                if healthy {
                    healthy_workers += 1;
                }
                if busy {
                    busy_workers += 1;
                }
                WorkerStats {
                    address: format!("{}:{}", addr.0, addr.1),
                    healthy,
                    busy,
                    tasks_completed: info.tasks_completed,
                    tasks_failed: info.tasks_failed,
                    avg_latency_ms: info.avg_latency_ms,
                }
            })
            .collect();
        RegistrySnapshot {
            total_workers: inner.workers.len(),
            healthy_workers,
            busy_workers,
            workers,
        }
    }
}
