use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters of one broker instance.
#[derive(Debug, Default)]
pub struct BrokerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    vanished: AtomicU64,
    restarts: AtomicU64,
    watcher_faults: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub vanished: u64,
    pub restarts: u64,
    pub watcher_faults: u64,
}

impl BrokerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vanished(&self) {
        self.vanished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Fault counts are owned by the watcher; this keeps the total across
    /// watcher generations.
    pub fn add_watcher_faults(&self, count: u64) {
        self.watcher_faults.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            vanished: self.vanished.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            watcher_faults: self.watcher_faults.load(Ordering::Relaxed),
        }
    }
}
