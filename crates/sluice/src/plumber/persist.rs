//! Background persist worker.
//!
//! One task writes chunk files in the order jobs arrive. Callers never wait on disk I/O unless
//! they ask to via a `done` channel.
//!
//! # Commit callbacks
//!
//! A job's commit callback depends on the chunks the job carried. If any of them fails to
//! write, the callback is parked; a later job that persists the remaining chunks (the next
//! scheduler tick gathers every unpersisted chunk) releases it. Each callback runs at most once.
//! A callback that panics is logged and does not take the worker down.
//!
//! # Shutdown
//!
//! The worker exits when every sender is dropped, after finishing the job in hand.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use sluice_core::emit;
use sluice_core::metrics::events::{ChunkPersisted, PersistDuration, PersistFailed};

use super::metrics::PlumberMetrics;
use crate::error::PlumberError;
use crate::persist::LocalSinkStore;
use crate::sink::{Chunk, Sink};

/// Caller-supplied action run once the data it covers is durable.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// Result of one job, reported on its `done` channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PersistOutcome {
    pub persisted: usize,
    pub failed: usize,
}

pub(crate) struct PersistJob {
    pub chunks: Vec<(Arc<Sink>, Arc<Chunk>)>,
    pub commit: Option<CommitCallback>,
    pub done: Option<oneshot::Sender<PersistOutcome>>,
}

struct ParkedCommit {
    chunks: Vec<Arc<Chunk>>,
    commit: CommitCallback,
}

/// Handle to the background persist task.
pub(crate) struct PersistWorker {
    tx: mpsc::UnboundedSender<PersistJob>,
    handle: JoinHandle<()>,
}

impl PersistWorker {
    pub fn spawn(store: Arc<LocalSinkStore>, metrics: Arc<PlumberMetrics>, target: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(rx, store, metrics, target));
        Self { tx, handle }
    }

    pub fn submit(&self, job: PersistJob) -> Result<(), PlumberError> {
        self.tx
            .send(job)
            .map_err(|_| PlumberError::PersistWorkerGone)
    }

    /// Close the queue. The returned handle resolves once queued jobs are done.
    pub fn shutdown(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<PersistJob>,
        store: Arc<LocalSinkStore>,
        metrics: Arc<PlumberMetrics>,
        target: String,
    ) {
        let mut parked: Vec<ParkedCommit> = Vec::new();

        while let Some(job) = rx.recv().await {
            let start = Instant::now();
            let mut outcome = PersistOutcome::default();

            for (sink, chunk) in &job.chunks {
                if chunk.is_persisted() {
                    continue;
                }
                match store.write_chunk(sink.segment(), chunk).await {
                    Ok(bytes) => {
                        chunk.mark_persisted();
                        outcome.persisted += 1;
                        metrics.record_chunk_persisted(chunk.len() as u64);
                        emit!(ChunkPersisted {
                            rows: chunk.len() as u64,
                            target: target.clone(),
                        });
                        debug!(
                            interval = %sink.interval(),
                            sequence = chunk.sequence(),
                            bytes,
                            "Persisted chunk"
                        );
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        metrics.record_persist_failure();
                        emit!(PersistFailed {
                            target: target.clone(),
                        });
                        warn!(
                            interval = %sink.interval(),
                            sequence = chunk.sequence(),
                            error = %e,
                            "Failed to persist chunk, will retry next cycle"
                        );
                    }
                }
            }

            emit!(PersistDuration {
                duration: start.elapsed(),
                target: target.clone(),
            });

            if let Some(commit) = job.commit {
                parked.push(ParkedCommit {
                    chunks: job.chunks.iter().map(|(_, c)| c.clone()).collect(),
                    commit,
                });
            }
            let (ready, waiting): (Vec<_>, Vec<_>) = parked
                .into_iter()
                .partition(|p| p.chunks.iter().all(|c| c.is_persisted()));
            parked = waiting;
            for p in ready {
                if catch_unwind(AssertUnwindSafe(p.commit)).is_err() {
                    error!(target = %target, "Commit callback panicked");
                }
            }

            if let Some(done) = job.done {
                let _ = done.send(outcome);
            }
        }

        if !parked.is_empty() {
            warn!(
                target = %target,
                callbacks = parked.len(),
                "Persist worker stopped with commit callbacks whose data never reached disk"
            );
        }
    }
}
