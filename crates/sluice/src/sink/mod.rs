//! Per-bucket in-memory store.
//!
//! A sink holds an ordered list of immutable chunks plus one mutable head. Appends take a
//! shared lock on the chunk list and the head's own mutex; `swap` takes the exclusive lock for
//! the instant it moves the head into a new chunk, so a reader sees either the pre- or
//! post-swap state and every appended row is in exactly one place.

mod chunk;
mod index;
mod view;

pub use chunk::Chunk;
pub use index::{InMemoryIndex, RolledUpRow, merge_rows};
pub use view::SinkView;

use parking_lot::{Mutex, RwLock};
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ClosedSnafu, NotFinalizedSnafu, SinkError};
use crate::row::InputRow;
use crate::schema::Schema;
use crate::segment::DataSegment;
use crate::time::Interval;

/// Where a sink is in its life after creation.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Writable,
    /// Interval elapsed; the close sequence has not finished yet.
    Closing,
    /// Pushed, published and announced; waiting for a replica to serve it.
    AwaitingHandoff { segment: DataSegment, since: Instant },
}

struct SinkState {
    chunks: Vec<Arc<Chunk>>,
    head: Mutex<InMemoryIndex>,
    next_sequence: u32,
}

/// Retry bookkeeping for the interval-close sequence.
#[derive(Debug, Default)]
pub(crate) struct CloseAttempts {
    failures: u32,
    retry_at: Option<Instant>,
}

impl CloseAttempts {
    pub(crate) fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Record a failure and return the delay before the next attempt.
    pub(crate) fn record_failure(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        let exponent = self.failures.min(16);
        let delay = base.saturating_mul(1 << exponent).min(max);
        self.failures += 1;
        self.retry_at = Some(now + delay);
        delay
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

/// All data for one time bucket.
pub struct Sink {
    schema: Arc<Schema>,
    segment: DataSegment,
    writable: AtomicBool,
    state: RwLock<SinkState>,
    lifecycle: Mutex<Lifecycle>,
    pub(crate) close: tokio::sync::Mutex<CloseAttempts>,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("interval", &self.segment.interval)
            .field("version", &self.segment.version)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Sink {
    pub fn new(schema: Arc<Schema>, interval: Interval, version: impl Into<String>) -> Self {
        let segment = DataSegment::template(&schema, interval, version);
        Self::with_state(schema, segment, Vec::new(), 0, true, Lifecycle::Writable)
    }

    /// Rebuild a sink from chunks already on local disk. The version comes from `segment`
    /// and is never re-derived.
    pub fn recover(
        schema: Arc<Schema>,
        segment: DataSegment,
        chunks: Vec<(u32, Vec<RolledUpRow>)>,
        pushed: Option<DataSegment>,
    ) -> Self {
        let next_sequence = chunks.iter().map(|(seq, _)| seq + 1).max().unwrap_or(0);
        let chunks = chunks
            .into_iter()
            .map(|(seq, rows)| Arc::new(Chunk::recovered(seq, rows)))
            .collect();
        let (writable, lifecycle) = match pushed {
            Some(segment) => (
                false,
                Lifecycle::AwaitingHandoff {
                    segment,
                    since: Instant::now(),
                },
            ),
            None => (true, Lifecycle::Writable),
        };
        Self::with_state(schema, segment, chunks, next_sequence, writable, lifecycle)
    }

    /// Attach chunks recovered from disk to a sink created before recovery ran.
    ///
    /// Only possible while the sink has no chunks of its own; returns false otherwise.
    pub(crate) fn adopt_recovered(&self, recovered: Vec<(u32, Vec<RolledUpRow>)>) -> bool {
        let mut state = self.state.write();
        if !state.chunks.is_empty() {
            return false;
        }
        state.next_sequence = recovered
            .iter()
            .map(|(seq, _)| seq + 1)
            .max()
            .unwrap_or(0)
            .max(state.next_sequence);
        state.chunks = recovered
            .into_iter()
            .map(|(seq, rows)| Arc::new(Chunk::recovered(seq, rows)))
            .collect();
        true
    }

    fn with_state(
        schema: Arc<Schema>,
        segment: DataSegment,
        chunks: Vec<Arc<Chunk>>,
        next_sequence: u32,
        writable: bool,
        lifecycle: Lifecycle,
    ) -> Self {
        let head = InMemoryIndex::new(schema.clone(), segment.interval.start_millis());
        Self {
            schema,
            segment,
            writable: AtomicBool::new(writable),
            state: RwLock::new(SinkState {
                chunks,
                head: Mutex::new(head),
                next_sequence,
            }),
            lifecycle: Mutex::new(lifecycle),
            close: tokio::sync::Mutex::new(CloseAttempts::default()),
        }
    }

    pub fn interval(&self) -> &Interval {
        &self.segment.interval
    }

    pub fn version(&self) -> &str {
        &self.segment.version
    }

    /// Identity template: data source, interval, version, shard spec.
    pub fn segment(&self) -> &DataSegment {
        &self.segment
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Append a row to the head and return the head's rolled-up row count.
    pub fn add(&self, row: &InputRow) -> Result<usize, SinkError> {
        let state = self.state.read();
        // checked under the read lock so no add can slip in after the final swap
        ensure!(
            self.is_writable(),
            ClosedSnafu {
                interval: self.segment.interval,
            }
        );
        let count = state.head.lock().add(row);
        Ok(count)
    }

    /// Detach the head as a new immutable chunk. Returns `None` if the head was empty.
    pub fn swap(&self) -> Option<Arc<Chunk>> {
        let mut state = self.state.write();
        if state.head.get_mut().is_empty() {
            return None;
        }

        let fresh = InMemoryIndex::new(self.schema.clone(), self.segment.interval.start_millis());
        let head = std::mem::replace(state.head.get_mut(), fresh);
        let chunk = Arc::new(Chunk::new(state.next_sequence, head.into_rows()));
        state.next_sequence += 1;
        state.chunks.push(chunk.clone());
        Some(chunk)
    }

    /// Chunks that have not reached local durable storage yet, in creation order.
    pub fn unpersisted_chunks(&self) -> Vec<Arc<Chunk>> {
        self.state
            .read()
            .chunks
            .iter()
            .filter(|c| !c.is_persisted())
            .cloned()
            .collect()
    }

    pub fn current_view(&self) -> SinkView {
        let state = self.state.read();
        let chunks = state.chunks.clone();
        let head = state.head.lock().snapshot();
        SinkView::new(
            self.segment.interval,
            self.segment.version.clone(),
            chunks,
            head,
        )
    }

    /// Rolled-up rows across chunks and head.
    pub fn num_rows(&self) -> usize {
        let state = self.state.read();
        state.chunks.iter().map(|c| c.len()).sum::<usize>() + state.head.lock().len()
    }

    /// Rolled-up rows still in the mutable head.
    pub fn head_rows(&self) -> usize {
        self.state.read().head.lock().len()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Merge every chunk into the final row set. Only valid once the sink is closed to
    /// writes, its head is empty and every chunk is persisted.
    pub fn merged_immutable(&self) -> Result<Vec<RolledUpRow>, SinkError> {
        let interval = self.segment.interval;
        ensure!(
            !self.is_writable(),
            NotFinalizedSnafu {
                interval,
                reason: "sink still accepts writes",
            }
        );

        let state = self.state.read();
        ensure!(
            state.head.lock().is_empty(),
            NotFinalizedSnafu {
                interval,
                reason: "head has not been swapped",
            }
        );
        ensure!(
            state.chunks.iter().all(|c| c.is_persisted()),
            NotFinalizedSnafu {
                interval,
                reason: "chunks are not persisted",
            }
        );

        Ok(merge_rows(
            &self.schema,
            state.chunks.iter().map(|c| c.rows()),
        ))
    }

    /// Stop accepting rows. Idempotent.
    pub fn finish_writing(&self) {
        self.writable.store(false, Ordering::Release);
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Writable {
            *lifecycle = Lifecycle::Closing;
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.lock().clone()
    }

    pub(crate) fn mark_awaiting_handoff(&self, segment: DataSegment) {
        *self.lifecycle.lock() = Lifecycle::AwaitingHandoff {
            segment,
            since: Instant::now(),
        };
    }

    /// The pushed descriptor, once the close sequence has completed.
    pub fn pushed_segment(&self) -> Option<DataSegment> {
        match &*self.lifecycle.lock() {
            Lifecycle::AwaitingHandoff { segment, .. } => Some(segment.clone()),
            _ => None,
        }
    }

    pub(crate) fn awaiting_handoff_since(&self) -> Option<Instant> {
        match &*self.lifecycle.lock() {
            Lifecycle::AwaitingHandoff { since, .. } => Some(*since),
            _ => None,
        }
    }
}
