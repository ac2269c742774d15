//! Counters owned by one plumber.
//!
//! These sit alongside the global `metrics` recorder: the recorder feeds Prometheus, these give
//! callers and tests an exact per-plumber view.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PlumberMetrics {
    processed: AtomicU64,
    thrown_away: AtomicU64,
    unparseable: AtomicU64,
    rows_persisted: AtomicU64,
    chunks_persisted: AtomicU64,
    persist_failures: AtomicU64,
    segments_pushed: AtomicU64,
    handed_off: AtomicU64,
}

/// Point-in-time copy of [`PlumberMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub thrown_away: u64,
    pub unparseable: u64,
    pub rows_persisted: u64,
    pub chunks_persisted: u64,
    pub persist_failures: u64,
    pub segments_pushed: u64,
    pub handed_off: u64,
}

impl PlumberMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counted by the row source for input that never became a row.
    pub fn record_unparseable(&self, count: u64) {
        self.unparseable.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_thrown_away(&self, count: u64) {
        self.thrown_away.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_persisted(&self, rows: u64) {
        self.chunks_persisted.fetch_add(1, Ordering::Relaxed);
        self.rows_persisted.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_pushed(&self) {
        self.segments_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handed_off(&self) {
        self.handed_off.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            thrown_away: self.thrown_away.load(Ordering::Relaxed),
            unparseable: self.unparseable.load(Ordering::Relaxed),
            rows_persisted: self.rows_persisted.load(Ordering::Relaxed),
            chunks_persisted: self.chunks_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            segments_pushed: self.segments_pushed.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
        }
    }
}
