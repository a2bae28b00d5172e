//! Per-queue delivery counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Live counters for one queue, updated by the dispatcher.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    in_flight: AtomicUsize,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub in_flight: usize,
}

impl QueueStats {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_finished(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Anything that can report per-queue counters (used by the stats endpoint).
pub trait StatsSource: Send + Sync + 'static {
    fn stats(&self) -> BTreeMap<String, QueueStatsSnapshot>;
}

impl<S> StatsSource for std::sync::Arc<S>
where
    S: StatsSource + ?Sized,
{
    fn stats(&self) -> BTreeMap<String, QueueStatsSnapshot> {
        (**self).stats()
    }
}
