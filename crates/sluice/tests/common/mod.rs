//! Shared fixtures for plumber integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use sluice::coordination::{
    InMemorySegmentAnnouncer, InMemorySegmentPublisher, InMemoryServerView, NoopSegmentPusher,
};
use sluice::time::parse_timestamp;
use sluice::{
    AggregatorSpec, InputRow, ManualClock, PlumberConfig, PlumberMetrics, RealtimePlumber,
    RealtimePlumberSchool, RejectionPolicy, Schema, SegmentGranularity,
};

pub fn ts(raw: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap()
}

pub fn schema() -> Schema {
    Schema::new(
        "test",
        vec![AggregatorSpec::Count {
            name: "rows".into(),
        }],
    )
}

pub fn row(timestamp: &str, page: &str) -> InputRow {
    InputRow::new(ts(timestamp)).with_dimension("page", page)
}

/// Temp directory, manual clock and in-memory collaborators for one plumber.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub announcer: Arc<InMemorySegmentAnnouncer>,
    pub publisher: Arc<InMemorySegmentPublisher>,
    pub pusher: Arc<NoopSegmentPusher>,
    pub server_view: Arc<InMemoryServerView>,
    pub metrics: Arc<PlumberMetrics>,
}

impl Harness {
    pub fn new(now: &str) -> Self {
        Self::in_dir(TempDir::new().unwrap(), now)
    }

    /// Reuse a directory left behind by an earlier plumber.
    pub fn in_dir(dir: TempDir, now: &str) -> Self {
        Self {
            dir,
            clock: Arc::new(ManualClock::new(ts(now))),
            announcer: Arc::new(InMemorySegmentAnnouncer::new()),
            publisher: Arc::new(InMemorySegmentPublisher::new()),
            pusher: Arc::new(NoopSegmentPusher::new()),
            server_view: Arc::new(InMemoryServerView::new()),
            metrics: Arc::new(PlumberMetrics::new()),
        }
    }

    /// Hourly buckets, a ten minute window and background periods short enough for tests.
    pub fn config(&self) -> PlumberConfig {
        PlumberConfig::default()
            .with_base_persist_directory(self.dir.path())
            .with_segment_granularity(SegmentGranularity::Hour)
            .with_window_period(Duration::from_secs(600))
            .with_persist_period(Duration::from_millis(50))
            .with_handoff_check_period(Duration::from_millis(20))
            .with_close_retry(Duration::from_millis(10), Duration::from_millis(40))
            .with_finish_timeout(Duration::from_secs(5))
    }

    pub fn school(&self, config: PlumberConfig) -> RealtimePlumberSchool {
        RealtimePlumberSchool::new(config)
            .with_clock(self.clock.clone())
            .with_announcer(self.announcer.clone())
            .with_publisher(self.publisher.clone())
            .with_pusher(self.pusher.clone())
            .with_server_view(self.server_view.clone())
    }

    pub fn plumber(&self) -> RealtimePlumber {
        self.plumber_with(self.config(), RejectionPolicy::Noop)
    }

    pub fn plumber_with(&self, config: PlumberConfig, rejection: RejectionPolicy) -> RealtimePlumber {
        self.school(config)
            .with_rejection_policy(rejection)
            .find_plumber(schema(), self.metrics.clone())
            .unwrap()
    }
}

impl Harness {
    /// Put a regular file where the data source directory belongs so every chunk write fails.
    pub fn block_writes(&self) {
        let path = self.dir.path().join("test");
        let _ = std::fs::remove_dir_all(&path);
        std::fs::write(&path, b"blocked").unwrap();
    }

    pub fn unblock_writes(&self) {
        std::fs::remove_file(self.dir.path().join("test")).unwrap();
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
