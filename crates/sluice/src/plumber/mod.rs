//! The realtime plumber.
//!
//! Owns the live sinks of one data source and drives them from creation to handoff:
//!
//! ```text
//! row ─> rejection policy ─> bucket lookup/create ─> Sink::add
//!                                                       │
//! persist tick ─> swap every head ─> persist worker ─> chunks/NNNNN.json
//!                                                       │
//! close tick (end + window) ─> final flush ─> merge ─> push ─> publish ─> announce
//!                                                       │
//! handoff coordinator <─ server view ──── confirmed ─> unannounce, delete, drop
//! ```
//!
//! States move `Created -> Running -> Draining -> Stopped`. Rows may be routed while
//! `Created` so callers can warm up sinks before the job starts; persistence and interval
//! close only happen while `Running`.

mod handoff;
mod merge;
mod metrics;
mod persist;

pub use metrics::{MetricsSnapshot, PlumberMetrics};
pub use persist::CommitCallback;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::emit;
use sluice_core::metrics::events::{LiveSinks, RowsProcessed, RowsRejected, SinksAwaitingHandoff};
pub use sluice_core::metrics::events::RejectReason;

use crate::coordination::{
    SegmentAnnouncerRef, SegmentPublisherRef, SegmentPusherRef, ServerViewRef,
};
use crate::error::{PlumberError, SinkError};
use crate::persist::LocalSinkStore;
use crate::policy::{RejectionPolicy, VersioningPolicy};
use crate::row::InputRow;
use crate::schema::Schema;
use crate::school::PlumberConfig;
use crate::sink::{Sink, SinkView};
use crate::time::{ClockRef, Interval};
use handoff::HandoffHandle;
use persist::{PersistJob, PersistOutcome, PersistWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlumberState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl PlumberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlumberState::Created => "created",
            PlumberState::Running => "running",
            PlumberState::Draining => "draining",
            PlumberState::Stopped => "stopped",
        }
    }
}

/// What happened to one row handed to [`RealtimePlumber::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended; `head_rows` is the sink head's rolled-up row count afterwards.
    Added { head_rows: usize },
    Rejected(RejectReason),
}

/// External services the plumber talks to.
#[derive(Debug, Clone)]
pub(crate) struct Collaborators {
    pub announcer: SegmentAnnouncerRef,
    pub publisher: SegmentPublisherRef,
    pub pusher: SegmentPusherRef,
    pub server_view: ServerViewRef,
}

struct Maintenance {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Resolution {
    Sink(Arc<Sink>),
    Rejected(RejectReason),
}

pub(crate) struct Inner {
    pub(crate) schema: Arc<Schema>,
    pub(crate) config: PlumberConfig,
    rejection: RejectionPolicy,
    versioning: VersioningPolicy,
    clock: ClockRef,
    pub(crate) store: Arc<LocalSinkStore>,
    pub(crate) collaborators: Collaborators,
    pub(crate) metrics: Arc<PlumberMetrics>,
    sinks: DashMap<i64, Arc<Sink>>,
    /// Buckets released after handoff, with whether a replay warning was logged.
    handed_off: Mutex<HashMap<i64, bool>>,
    state: Mutex<PlumberState>,
    persister: Mutex<Option<PersistWorker>>,
    handoff: Mutex<Option<HandoffHandle>>,
    maintenance: Mutex<Option<Maintenance>>,
}

/// Manages every sink of one data source. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RealtimePlumber {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RealtimePlumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimePlumber")
            .field("data_source", &self.inner.schema.data_source)
            .field("state", &self.state())
            .field("sinks", &self.inner.sinks.len())
            .finish()
    }
}

impl RealtimePlumber {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        schema: Arc<Schema>,
        config: PlumberConfig,
        rejection: RejectionPolicy,
        versioning: VersioningPolicy,
        clock: ClockRef,
        collaborators: Collaborators,
        metrics: Arc<PlumberMetrics>,
    ) -> Self {
        let store = Arc::new(LocalSinkStore::new(
            config.base_persist_directory.clone(),
            schema.data_source.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                schema,
                config,
                rejection,
                versioning,
                clock,
                store,
                collaborators,
                metrics,
                sinks: DashMap::new(),
                handed_off: Mutex::new(HashMap::new()),
                state: Mutex::new(PlumberState::Created),
                persister: Mutex::new(None),
                handoff: Mutex::new(None),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> PlumberState {
        *self.inner.state.lock()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn metrics(&self) -> &Arc<PlumberMetrics> {
        &self.inner.metrics
    }

    /// Snapshot of the live sinks, ordered by interval start.
    pub fn sinks(&self) -> Vec<Arc<Sink>> {
        self.inner.live_sinks()
    }

    pub fn sink_count(&self) -> usize {
        self.inner.sinks.len()
    }

    /// Sink for the bucket containing `timestamp`, created on first use.
    ///
    /// `None` means the row must be counted as rejected: either the rejection policy vetoed
    /// the timestamp or the bucket was already handed off by this plumber.
    pub fn get_sink(&self, timestamp: DateTime<Utc>) -> Result<Option<Arc<Sink>>, PlumberError> {
        Ok(match self.inner.resolve(timestamp)? {
            Resolution::Sink(sink) => Some(sink),
            Resolution::Rejected(_) => None,
        })
    }

    /// Gate, route and append one row, keeping the processed and rejected counts.
    pub fn add(&self, row: &InputRow) -> Result<AddOutcome, PlumberError> {
        let sink = match self.inner.resolve(row.timestamp)? {
            Resolution::Sink(sink) => sink,
            Resolution::Rejected(reason) => return Ok(self.inner.reject(reason)),
        };

        match sink.add(row) {
            Ok(head_rows) => {
                self.inner.metrics.record_processed();
                emit!(RowsProcessed {
                    count: 1,
                    target: self.inner.schema.data_source.clone(),
                });
                if head_rows == self.inner.config.max_rows_in_memory
                    && self.state() == PlumberState::Running
                {
                    debug!(interval = %sink.interval(), head_rows, "Head is full, persisting early");
                    if let Err(e) = self.inner.persist_sinks(vec![sink], None, None) {
                        warn!(error = %e, "Failed to schedule early persist");
                    }
                }
                Ok(AddOutcome::Added { head_rows })
            }
            Err(SinkError::Closed { .. }) => Ok(self.inner.reject(RejectReason::SinkClosed)),
            Err(e) => {
                warn!(error = %e, "Unexpected sink error on add");
                Ok(self.inner.reject(RejectReason::SinkClosed))
            }
        }
    }

    /// Swap and flush every sink's head in the background, then run `commit` once all the
    /// data present at call time is on local disk. Returns without waiting for I/O.
    pub fn persist<F>(&self, commit: F) -> Result<(), PlumberError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.ensure_state(&[PlumberState::Running], "persist")?;
        self.inner
            .persist_sinks(self.inner.live_sinks(), Some(Box::new(commit)), None)
    }

    /// Views of every live sink overlapping `interval`, ordered by interval start.
    pub fn query_views(&self, interval: &Interval) -> Vec<SinkView> {
        self.inner
            .live_sinks()
            .into_iter()
            .filter(|sink| sink.interval().overlaps(interval))
            .map(|sink| sink.current_view())
            .collect()
    }

    /// Recover local sinks, start the persist worker, the handoff coordinator and the
    /// periodic scheduler.
    pub async fn start_job(&self) -> Result<(), PlumberError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                PlumberState::Created => *state = PlumberState::Running,
                PlumberState::Running => return Err(PlumberError::AlreadyStarted),
                other => {
                    return Err(PlumberError::NotRunning {
                        state: other.as_str(),
                        operation: "start",
                    });
                }
            }
        }

        let recovered = match self.inner.store.recover().await {
            Ok(recovered) => recovered,
            Err(e) => {
                *self.inner.state.lock() = PlumberState::Created;
                return Err(e.into());
            }
        };

        let target = self.inner.schema.data_source.clone();
        let worker = PersistWorker::spawn(
            self.inner.store.clone(),
            self.inner.metrics.clone(),
            target.clone(),
        );
        *self.inner.persister.lock() = Some(worker);

        let coordinator = HandoffHandle::spawn(
            Arc::downgrade(&self.inner),
            self.inner.collaborators.server_view.subscribe(),
            target.clone(),
            self.inner.config.handoff_check_period,
            self.inner.config.handoff_warn_after,
        );
        *self.inner.handoff.lock() = Some(coordinator);

        let recovered_count = recovered.len();
        for sink in recovered {
            self.inner.restore(sink).await;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_maintenance(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            self.inner.config.persist_period,
            self.inner.config.handoff_check_period,
        ));
        *self.inner.maintenance.lock() = Some(Maintenance { cancel, handle });

        self.inner.emit_gauges();
        info!(
            target = %target,
            recovered = recovered_count,
            persist_period_secs = self.inner.config.persist_period.as_secs(),
            "Plumber started"
        );
        Ok(())
    }

    /// Stop the scheduler, flush every sink and wait (bounded) for the flush to land.
    ///
    /// Buckets that have not closed yet stay on local disk for the next start to recover.
    pub async fn finish_job(&self) -> Result<(), PlumberError> {
        {
            let mut state = self.inner.state.lock();
            if *state != PlumberState::Running {
                return Err(PlumberError::NotRunning {
                    state: state.as_str(),
                    operation: "finish",
                });
            }
            *state = PlumberState::Draining;
        }
        let target = self.inner.schema.data_source.clone();
        info!(target = %target, sinks = self.inner.sinks.len(), "Draining plumber");

        let maintenance = self.inner.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.cancel.cancel();
            let _ = maintenance.handle.await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let submitted = self
            .inner
            .persist_sinks(self.inner.live_sinks(), None, Some(done_tx));
        let worker = self.inner.persister.lock().take();

        let drain = async {
            if submitted.is_ok() {
                let _ = done_rx.await;
            }
            match worker {
                Some(worker) => worker.shutdown().await,
                None => Ok(()),
            }
        };
        let timeout = self.inner.config.finish_timeout;
        let drained = tokio::time::timeout(timeout, drain).await;

        self.inner.stop_handoff().await;
        *self.inner.state.lock() = PlumberState::Stopped;

        match drained {
            Err(_) => {
                error!(
                    target = %target,
                    timeout_secs = timeout.as_secs(),
                    "Timed out draining plumber, buffered rows may not be on disk"
                );
                return Err(PlumberError::DrainTimeout { timeout });
            }
            Ok(Err(source)) => return Err(PlumberError::TaskJoin { source }),
            Ok(Ok(())) => {}
        }
        submitted?;

        // an add that passed the state check before Draining may land after the final swap
        let sinks = self.inner.live_sinks();
        let unpersisted: usize = sinks.iter().map(|s| s.unpersisted_chunks().len()).sum();
        let buffered_rows: usize = sinks.iter().map(|s| s.head_rows()).sum();
        if unpersisted > 0 || buffered_rows > 0 {
            error!(
                target = %target,
                unpersisted,
                buffered_rows,
                "Final flush left data off disk"
            );
            return Err(PlumberError::FlushIncomplete {
                unpersisted,
                buffered_rows,
            });
        }

        info!(target = %target, "Plumber stopped");
        Ok(())
    }
}

impl Inner {
    fn ensure_state(
        &self,
        allowed: &[PlumberState],
        operation: &'static str,
    ) -> Result<(), PlumberError> {
        let state = *self.state.lock();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(PlumberError::NotRunning {
                state: state.as_str(),
                operation,
            })
        }
    }

    fn resolve(&self, timestamp: DateTime<Utc>) -> Result<Resolution, PlumberError> {
        self.ensure_state(&[PlumberState::Created, PlumberState::Running], "route rows")?;

        if !self.rejection.accept(timestamp, self.clock.now()) {
            return Ok(Resolution::Rejected(RejectReason::Policy));
        }

        let interval = self.config.segment_granularity.bucket(timestamp);
        let key = interval.start_millis();
        let created = match self.sinks.entry(key) {
            Entry::Occupied(entry) => return Ok(Resolution::Sink(entry.get().clone())),
            Entry::Vacant(entry) => {
                if self.was_handed_off(key, &interval) {
                    return Ok(Resolution::Rejected(RejectReason::HandedOff));
                }
                let version = self.versioning.version_for(&interval);
                let sink = Arc::new(Sink::new(self.schema.clone(), interval, version));
                entry.insert(sink.clone());
                sink
            }
        };

        info!(
            target = %self.schema.data_source,
            interval = %created.interval(),
            version = %created.version(),
            "Created sink"
        );
        self.emit_gauges();
        Ok(Resolution::Sink(created))
    }

    fn was_handed_off(&self, key: i64, interval: &Interval) -> bool {
        let mut handed_off = self.handed_off.lock();
        match handed_off.get_mut(&key) {
            Some(warned) => {
                if !*warned {
                    warn!(
                        target = %self.schema.data_source,
                        interval = %interval,
                        "Rejecting rows for a bucket this plumber already handed off"
                    );
                    *warned = true;
                }
                true
            }
            None => false,
        }
    }

    fn reject(&self, reason: RejectReason) -> AddOutcome {
        self.metrics.record_thrown_away(1);
        emit!(RowsRejected {
            count: 1,
            reason,
            target: self.schema.data_source.clone(),
        });
        AddOutcome::Rejected(reason)
    }

    pub(crate) fn live_sinks(&self) -> Vec<Arc<Sink>> {
        let mut sinks: Vec<Arc<Sink>> = self.sinks.iter().map(|e| e.value().clone()).collect();
        sinks.sort_by_key(|sink| sink.interval().start_millis());
        sinks
    }

    /// Swap the given sinks and queue every chunk not yet on disk.
    ///
    /// A job is queued even when there is nothing to write so `commit` and `done` still fire.
    fn persist_sinks(
        &self,
        sinks: Vec<Arc<Sink>>,
        commit: Option<CommitCallback>,
        done: Option<oneshot::Sender<PersistOutcome>>,
    ) -> Result<(), PlumberError> {
        let mut chunks = Vec::new();
        for sink in sinks {
            sink.swap();
            for chunk in sink.unpersisted_chunks() {
                chunks.push((sink.clone(), chunk));
            }
        }

        let persister = self.persister.lock();
        let worker = persister.as_ref().ok_or(PlumberError::PersistWorkerGone)?;
        worker.submit(PersistJob {
            chunks,
            commit,
            done,
        })
    }

    /// Flush one sink and wait. True when every chunk of the sink is on disk afterwards.
    pub(crate) async fn persist_sink_and_wait(
        &self,
        sink: &Arc<Sink>,
    ) -> Result<bool, PlumberError> {
        let (tx, rx) = oneshot::channel();
        self.persist_sinks(vec![sink.clone()], None, Some(tx))?;
        rx.await.map_err(|_| PlumberError::PersistWorkerGone)?;
        Ok(sink.unpersisted_chunks().is_empty())
    }

    /// Hand a sink that finished its close sequence to the coordinator.
    pub(crate) fn await_handoff(&self, sink: Arc<Sink>) {
        let interval = *sink.interval();
        let registered = self
            .handoff
            .lock()
            .as_ref()
            .is_some_and(|coordinator| coordinator.await_handoff(sink));
        if !registered {
            warn!(interval = %interval, "Handoff coordinator is not running, segment stays local");
        }
        self.emit_gauges();
    }

    /// Forget a sink that a replica now serves. Later rows for its bucket are rejected.
    pub(crate) fn release_handed_off(&self, key: i64, sink: &Arc<Sink>) {
        self.handed_off.lock().insert(key, false);
        self.sinks
            .remove_if(&key, |_, current| Arc::ptr_eq(current, sink));
        self.metrics.record_handed_off();
        self.emit_gauges();
    }

    /// Whether some live sink's interval contains `interval`.
    pub(crate) fn covers_interval(&self, interval: &Interval) -> bool {
        self.sinks
            .iter()
            .any(|e| e.value().interval().contains_interval(interval))
    }

    /// Forget handed-off buckets the rejection policy would now refuse anyway.
    fn prune_handed_off(&self) {
        let now = self.clock.now();
        let width = self.config.segment_granularity.millis();
        self.handed_off.lock().retain(|start, _| {
            match DateTime::from_timestamp_millis(start + width - 1) {
                Some(last) => last >= now || self.rejection.accept(last, now),
                None => true,
            }
        });
    }

    /// Drop a closed sink that never held a row.
    pub(crate) fn release_empty(&self, sink: &Arc<Sink>) {
        let key = sink.interval().start_millis();
        self.sinks
            .remove_if(&key, |_, current| Arc::ptr_eq(current, sink));
        self.emit_gauges();
    }

    /// Rebuild a sink read back from local disk.
    async fn restore(&self, recovered: crate::persist::RecoveredSink) {
        let key = recovered.segment.interval.start_millis();
        let pushed = recovered.pushed.clone();
        let sink = match self.sinks.entry(key) {
            Entry::Vacant(entry) => {
                let sink = Arc::new(Sink::recover(
                    self.schema.clone(),
                    recovered.segment,
                    recovered.chunks,
                    recovered.pushed,
                ));
                entry.insert(sink.clone());
                sink
            }
            Entry::Occupied(entry) => {
                let live = entry.get().clone();
                drop(entry);
                if pushed.is_some()
                    || live.version() != recovered.segment.version
                    || !live.adopt_recovered(recovered.chunks)
                {
                    warn!(
                        target = %self.schema.data_source,
                        interval = %recovered.segment.interval,
                        version = %recovered.segment.version,
                        live_version = %live.version(),
                        "Recovered sink conflicts with a sink created before start, leaving it on disk"
                    );
                    return;
                }
                live
            }
        };

        if let Some(pushed) = pushed {
            if let Err(e) = self.collaborators.announcer.announce_segment(&pushed).await {
                warn!(
                    segment = %pushed.identifier(),
                    error = %e,
                    "Failed to re-announce recovered segment"
                );
            }
            self.await_handoff(sink);
        }
    }

    async fn stop_handoff(&self) {
        let coordinator = self.handoff.lock().take();
        if let Some(coordinator) = coordinator {
            let _ = coordinator.shutdown().await;
        }
    }

    fn emit_gauges(&self) {
        let awaiting = self
            .sinks
            .iter()
            .filter(|e| e.value().pushed_segment().is_some())
            .count();
        emit!(LiveSinks {
            count: self.sinks.len(),
            target: self.schema.data_source.clone(),
        });
        emit!(SinksAwaitingHandoff {
            count: awaiting,
            target: self.schema.data_source.clone(),
        });
    }

    /// Sinks whose interval plus the window period has elapsed and that still need closing.
    fn sinks_due_for_close(&self) -> Vec<Arc<Sink>> {
        let now = self.clock.now();
        let grace = TimeDelta::from_std(self.config.window_period).unwrap_or(TimeDelta::MAX);
        self.live_sinks()
            .into_iter()
            .filter(|sink| sink.pushed_segment().is_none())
            .filter(|sink| {
                sink.interval()
                    .end()
                    .checked_add_signed(grace)
                    .is_some_and(|due| now >= due)
            })
            .collect()
    }
}

/// Periodic persist and interval-close checks.
async fn run_maintenance(
    inner: Weak<Inner>,
    cancel: CancellationToken,
    persist_period: Duration,
    check_period: Duration,
) {
    let start = Instant::now();
    let mut persist_tick = tokio::time::interval_at(start + persist_period, persist_period);
    persist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut check_tick = tokio::time::interval_at(start + check_period, check_period);
    check_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closes: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = persist_tick.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.persist_sinks(inner.live_sinks(), None, None) {
                    warn!(error = %e, "Failed to schedule periodic persist");
                }
            }
            _ = check_tick.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                for sink in inner.sinks_due_for_close() {
                    closes.spawn(merge::close_sink(inner.clone(), sink));
                }
                inner.prune_handed_off();
                inner.emit_gauges();
            }
            Some(result) = closes.join_next(), if !closes.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "Segment close task failed");
                }
            }
        }
    }

    closes.abort_all();
    while closes.join_next().await.is_some() {}
    debug!("Plumber maintenance stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{
        InMemorySegmentAnnouncer, InMemorySegmentPublisher, InMemoryServerView,
        NoopSegmentPusher,
    };
    use crate::schema::AggregatorSpec;
    use crate::time::{ManualClock, SegmentGranularity, parse_timestamp};
    use tempfile::TempDir;

    fn plumber(dir: &TempDir, rejection: RejectionPolicy) -> RealtimePlumber {
        let clock = Arc::new(ManualClock::new(
            parse_timestamp("2013-01-01T00:30:00Z").unwrap(),
        ));
        plumber_at(dir, rejection, clock)
    }

    fn plumber_at(
        dir: &TempDir,
        rejection: RejectionPolicy,
        clock: Arc<ManualClock>,
    ) -> RealtimePlumber {
        let schema = Arc::new(Schema::new(
            "wikipedia",
            vec![AggregatorSpec::Count {
                name: "rows".into(),
            }],
        ));
        let config = PlumberConfig::default()
            .with_base_persist_directory(dir.path())
            .with_segment_granularity(SegmentGranularity::Hour);
        RealtimePlumber::new(
            schema,
            config,
            rejection,
            VersioningPolicy::IntervalStart,
            clock,
            Collaborators {
                announcer: Arc::new(InMemorySegmentAnnouncer::new()),
                publisher: Arc::new(InMemorySegmentPublisher::new()),
                pusher: Arc::new(NoopSegmentPusher::new()),
                server_view: Arc::new(InMemoryServerView::new()),
            },
            Arc::new(PlumberMetrics::new()),
        )
    }

    #[test]
    fn test_same_bucket_shares_sink() {
        let dir = TempDir::new().unwrap();
        let plumber = plumber(&dir, RejectionPolicy::Noop);

        let a = plumber
            .get_sink(parse_timestamp("2013-01-01T00:01:00Z").unwrap())
            .unwrap()
            .unwrap();
        let b = plumber
            .get_sink(parse_timestamp("2013-01-01T00:59:59Z").unwrap())
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(plumber.sink_count(), 1);
    }

    #[test]
    fn test_policy_rejection_creates_no_sink() {
        let dir = TempDir::new().unwrap();
        let plumber = plumber(&dir, RejectionPolicy::server_time(Duration::from_secs(600)));

        let row = InputRow::new(parse_timestamp("2012-12-31T00:00:00Z").unwrap());
        assert_eq!(
            plumber.add(&row).unwrap(),
            AddOutcome::Rejected(RejectReason::Policy)
        );
        assert_eq!(plumber.sink_count(), 0);
        assert_eq!(plumber.metrics().snapshot().thrown_away, 1);
    }

    #[test]
    fn test_persist_requires_running() {
        let dir = TempDir::new().unwrap();
        let plumber = plumber(&dir, RejectionPolicy::Noop);
        let err = plumber.persist(|| {}).unwrap_err();
        assert!(matches!(
            err,
            PlumberError::NotRunning {
                state: "created",
                ..
            }
        ));
    }

    #[test]
    fn test_handed_off_bucket_rejects_replay() {
        let dir = TempDir::new().unwrap();
        let plumber = plumber(&dir, RejectionPolicy::Noop);
        let ts = parse_timestamp("2013-01-01T00:10:00Z").unwrap();
        let sink = plumber.get_sink(ts).unwrap().unwrap();

        plumber
            .inner
            .release_handed_off(sink.interval().start_millis(), &sink);

        assert!(plumber.get_sink(ts).unwrap().is_none());
        assert_eq!(
            plumber.add(&InputRow::new(ts)).unwrap(),
            AddOutcome::Rejected(RejectReason::HandedOff)
        );
        assert_eq!(plumber.metrics().snapshot().handed_off, 1);
    }

    #[test]
    fn test_handed_off_buckets_pruned_once_policy_refuses_them() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            parse_timestamp("2013-01-01T00:15:00Z").unwrap(),
        ));
        let window = plumber_at(
            &dir,
            RejectionPolicy::server_time(Duration::from_secs(600)),
            clock.clone(),
        );
        let noop = plumber_at(&dir, RejectionPolicy::Noop, clock.clone());
        for plumber in [&window, &noop] {
            let sink = plumber
                .get_sink(parse_timestamp("2013-01-01T00:10:00Z").unwrap())
                .unwrap()
                .unwrap();
            plumber
                .inner
                .release_handed_off(sink.interval().start_millis(), &sink);
        }

        // the bucket's last millisecond is still inside the window
        clock.set(parse_timestamp("2013-01-01T01:05:00Z").unwrap());
        window.inner.prune_handed_off();
        assert_eq!(window.inner.handed_off.lock().len(), 1);

        clock.set(parse_timestamp("2013-01-01T01:11:00Z").unwrap());
        window.inner.prune_handed_off();
        noop.inner.prune_handed_off();
        assert!(window.inner.handed_off.lock().is_empty());
        assert_eq!(noop.inner.handed_off.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = TempDir::new().unwrap();
        let plumber = plumber(&dir, RejectionPolicy::Noop);
        plumber.start_job().await.unwrap();
        assert!(matches!(
            plumber.start_job().await,
            Err(PlumberError::AlreadyStarted)
        ));
        plumber.finish_job().await.unwrap();
        assert_eq!(plumber.state(), PlumberState::Stopped);
        assert!(plumber.get_sink(Utc::now()).is_err());
    }
}
