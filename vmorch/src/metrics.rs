//! Runtime-wide counters.
//!
//! Storage is lock-free (`AtomicU64`) and shared by every instance of one
//! runtime. `RuntimeMetrics` is the read-only view handed to callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters, incremented with `Relaxed` ordering.
#[derive(Debug, Default)]
pub struct RuntimeMetricsStorage {
    pub(crate) instances_created: AtomicU64,
    pub(crate) instances_started: AtomicU64,
    pub(crate) instances_failed: AtomicU64,
    pub(crate) instances_stopped: AtomicU64,
}

impl RuntimeMetricsStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Snapshot view over the runtime counters.
#[derive(Debug, Clone)]
pub struct RuntimeMetrics {
    storage: Arc<RuntimeMetricsStorage>,
}

impl RuntimeMetrics {
    pub(crate) fn new(storage: Arc<RuntimeMetricsStorage>) -> Self {
        Self { storage }
    }

    pub fn instances_created(&self) -> u64 {
        self.storage.instances_created.load(Ordering::Relaxed)
    }

    /// Instances that reached `Running`.
    pub fn instances_started(&self) -> u64 {
        self.storage.instances_started.load(Ordering::Relaxed)
    }

    pub fn instances_failed(&self) -> u64 {
        self.storage.instances_failed.load(Ordering::Relaxed)
    }

    pub fn instances_stopped(&self) -> u64 {
        self.storage.instances_stopped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instances_created: self.instances_created(),
            instances_started: self.instances_started(),
            instances_failed: self.instances_failed(),
            instances_stopped: self.instances_stopped(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub instances_created: u64,
    pub instances_started: u64,
    pub instances_failed: u64,
    pub instances_stopped: u64,
}
