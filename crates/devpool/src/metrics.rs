//! Metrics collaborator
//!
//! The pool reports worker counts keyed by worker labels, and the dispatcher
//! reports request outcomes and per-phase durations. Exporters implement
//! [`PoolMetrics`]; [`InMemoryMetrics`] keeps everything in process.

use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Label set derived from worker metadata
pub type WorkerLabels = BTreeMap<String, String>;

/// Phase of a dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Waiting while the pool had no workers at all
    Attach,
    /// Waiting for a busy worker
    Queue,
    /// Running on a worker
    Process,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach => write!(f, "attach"),
            Self::Queue => write!(f, "queue"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Receiver of pool and dispatcher measurements
pub trait PoolMetrics: Send + Sync {
    fn worker_added(&self, labels: &WorkerLabels);

    fn worker_removed(&self, labels: &WorkerLabels);

    fn request_completed(&self, status: u16, request_type: &str);

    fn observe_duration(&self, status: u16, request_type: &str, phase: RequestPhase, duration: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl PoolMetrics for NoopMetrics {
    fn worker_added(&self, _labels: &WorkerLabels) {}

    fn worker_removed(&self, _labels: &WorkerLabels) {}

    fn request_completed(&self, _status: u16, _request_type: &str) {}

    fn observe_duration(&self, _: u16, _: &str, _: RequestPhase, _: Duration) {}
}

/// Accumulated duration for one (status, type, phase) key
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DurationTotal {
    pub count: u64,
    pub total: Duration,
}

/// In-process metrics store
///
/// Used by tests and by embedders that render their own exposition format.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    workers: DashMap<WorkerLabels, i64>,
    requests: DashMap<(u16, String), u64>,
    durations: DashMap<(u16, String, RequestPhase), DurationTotal>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current worker gauge for a label set
    pub fn workers(&self, labels: &WorkerLabels) -> i64 {
        self.workers.get(labels).map(|v| *v).unwrap_or(0)
    }

    /// Sum of the worker gauge over all label sets
    pub fn total_workers(&self) -> i64 {
        self.workers.iter().map(|entry| *entry.value()).sum()
    }

    pub fn requests(&self, status: u16, request_type: &str) -> u64 {
        self.requests
            .get(&(status, request_type.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn duration(&self, status: u16, request_type: &str, phase: RequestPhase) -> DurationTotal {
        self.durations
            .get(&(status, request_type.to_string(), phase))
            .map(|v| *v)
            .unwrap_or_default()
    }
}

impl PoolMetrics for InMemoryMetrics {
    fn worker_added(&self, labels: &WorkerLabels) {
        *self.workers.entry(labels.clone()).or_insert(0) += 1;
    }

    fn worker_removed(&self, labels: &WorkerLabels) {
        *self.workers.entry(labels.clone()).or_insert(0) -= 1;
    }

    fn request_completed(&self, status: u16, request_type: &str) {
        *self
            .requests
            .entry((status, request_type.to_string()))
            .or_insert(0) += 1;
    }

    fn observe_duration(&self, status: u16, request_type: &str, phase: RequestPhase, duration: Duration) {
        let mut entry = self
            .durations
            .entry((status, request_type.to_string(), phase))
            .or_default();
        entry.count += 1;
        entry.total += duration;
    }
}
