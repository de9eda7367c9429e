//! Shared health state for the /health endpoint.
//! Updated by the ingest handler after every batch.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ingest::IngestStats;

#[derive(Default)]
pub struct HealthState {
    /// Unix seconds of the last successful batch (0 = none yet).
    pub last_batch_at_secs: AtomicU64,
    /// Batches that completed persistence.
    pub batches_ingested: AtomicU64,
    /// Batches aborted by a storage error.
    pub batches_failed: AtomicU64,
    /// Markets skipped for validation or diff errors, across all batches.
    pub markets_failed_total: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, at_secs: u64, stats: &IngestStats) {
        self.last_batch_at_secs.store(at_secs, Ordering::Relaxed);
        self.batches_ingested.fetch_add(1, Ordering::Relaxed);
        self.markets_failed_total
            .fetch_add(stats.markets_failed as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_batch_at_secs(&self) -> u64 {
        self.last_batch_at_secs.load(Ordering::Relaxed)
    }

    pub fn batches_ingested(&self) -> u64 {
        self.batches_ingested.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn markets_failed_total(&self) -> u64 {
        self.markets_failed_total.load(Ordering::Relaxed)
    }
}
