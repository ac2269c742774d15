//! Plumber factory.
//!
//! A [`RealtimePlumberSchool`] holds the runtime settings and shared collaborators; each call
//! to [`find_plumber`](RealtimePlumberSchool::find_plumber) wires an independent plumber for
//! one schema.

use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::coordination::{
    SegmentAnnouncerRef, SegmentPublisherRef, SegmentPusherRef, ServerViewRef,
};
use crate::error::{ConfigError, PlumberError};
use crate::plumber::{Collaborators, PlumberMetrics, RealtimePlumber};
use crate::policy::{RejectionPolicy, VersioningPolicy};
use crate::schema::Schema;
use crate::time::{ClockRef, SegmentGranularity, SystemClock};
use sluice_core::error::{EmptyPersistDirectorySnafu, MissingCollaboratorSnafu, ZeroPeriodSnafu};

const DEFAULT_WINDOW_PERIOD: Duration = Duration::from_secs(10 * 60);
const DEFAULT_PERSIST_PERIOD: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MAX_ROWS_IN_MEMORY: usize = 500_000;
const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HANDOFF_CHECK_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_CLOSE_RETRY_BASE: Duration = Duration::from_secs(10);
const DEFAULT_CLOSE_RETRY_MAX: Duration = Duration::from_secs(10 * 60);
const DEFAULT_HANDOFF_WARN_AFTER: Duration = Duration::from_secs(15 * 60);

/// Runtime settings shared by every plumber a school builds.
#[derive(Debug, Clone)]
pub struct PlumberConfig {
    /// Grace period after a bucket ends before it is closed.
    pub window_period: Duration,
    pub persist_period: Duration,
    pub segment_granularity: SegmentGranularity,
    pub base_persist_directory: PathBuf,
    /// Head size that triggers an early persist of one sink.
    pub max_rows_in_memory: usize,
    /// Bound on the final flush in `finish_job`.
    pub finish_timeout: Duration,
    /// Period of the interval-close check and the handoff coordinator's retry tick.
    pub handoff_check_period: Duration,
    pub close_retry_base: Duration,
    pub close_retry_max: Duration,
    /// Awaiting handoff longer than this is logged at warn on every check.
    pub handoff_warn_after: Duration,
}

impl Default for PlumberConfig {
    fn default() -> Self {
        Self {
            window_period: DEFAULT_WINDOW_PERIOD,
            persist_period: DEFAULT_PERSIST_PERIOD,
            segment_granularity: SegmentGranularity::default(),
            base_persist_directory: PathBuf::from("/tmp/sluice"),
            max_rows_in_memory: DEFAULT_MAX_ROWS_IN_MEMORY,
            finish_timeout: DEFAULT_FINISH_TIMEOUT,
            handoff_check_period: DEFAULT_HANDOFF_CHECK_PERIOD,
            close_retry_base: DEFAULT_CLOSE_RETRY_BASE,
            close_retry_max: DEFAULT_CLOSE_RETRY_MAX,
            handoff_warn_after: DEFAULT_HANDOFF_WARN_AFTER,
        }
    }
}

impl PlumberConfig {
    pub fn with_window_period(mut self, period: Duration) -> Self {
        self.window_period = period;
        self
    }

    pub fn with_persist_period(mut self, period: Duration) -> Self {
        self.persist_period = period;
        self
    }

    pub fn with_segment_granularity(mut self, granularity: SegmentGranularity) -> Self {
        self.segment_granularity = granularity;
        self
    }

    pub fn with_base_persist_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_persist_directory = dir.into();
        self
    }

    pub fn with_max_rows_in_memory(mut self, rows: usize) -> Self {
        self.max_rows_in_memory = rows;
        self
    }

    pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout = timeout;
        self
    }

    pub fn with_handoff_check_period(mut self, period: Duration) -> Self {
        self.handoff_check_period = period;
        self
    }

    pub fn with_close_retry(mut self, base: Duration, max: Duration) -> Self {
        self.close_retry_base = base;
        self.close_retry_max = max;
        self
    }

    pub fn with_handoff_warn_after(mut self, after: Duration) -> Self {
        self.handoff_warn_after = after;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("persist_period", self.persist_period),
            ("finish_timeout", self.finish_timeout),
            ("handoff_check_period", self.handoff_check_period),
            ("close_retry_base", self.close_retry_base),
        ];
        for (field, period) in periods {
            ensure!(!period.is_zero(), ZeroPeriodSnafu { field });
        }
        ensure!(
            self.max_rows_in_memory > 0,
            ZeroPeriodSnafu {
                field: "max_rows_in_memory"
            }
        );
        ensure!(
            !self.base_persist_directory.as_os_str().is_empty(),
            EmptyPersistDirectorySnafu
        );
        Ok(())
    }
}

/// Builds [`RealtimePlumber`]s that share settings, policies and collaborators.
#[derive(Debug, Clone)]
pub struct RealtimePlumberSchool {
    config: PlumberConfig,
    rejection: RejectionPolicy,
    versioning: VersioningPolicy,
    clock: ClockRef,
    announcer: Option<SegmentAnnouncerRef>,
    publisher: Option<SegmentPublisherRef>,
    pusher: Option<SegmentPusherRef>,
    server_view: Option<ServerViewRef>,
}

impl RealtimePlumberSchool {
    pub fn new(config: PlumberConfig) -> Self {
        Self {
            config,
            rejection: RejectionPolicy::default(),
            versioning: VersioningPolicy::default(),
            clock: Arc::new(SystemClock),
            announcer: None,
            publisher: None,
            pusher: None,
            server_view: None,
        }
    }

    pub fn config(&self) -> &PlumberConfig {
        &self.config
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection = policy;
        self
    }

    pub fn with_versioning_policy(mut self, policy: VersioningPolicy) -> Self {
        self.versioning = policy;
        self
    }

    pub fn with_clock(mut self, clock: ClockRef) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_announcer(mut self, announcer: SegmentAnnouncerRef) -> Self {
        self.announcer = Some(announcer);
        self
    }

    pub fn with_publisher(mut self, publisher: SegmentPublisherRef) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_pusher(mut self, pusher: SegmentPusherRef) -> Self {
        self.pusher = Some(pusher);
        self
    }

    pub fn with_server_view(mut self, server_view: ServerViewRef) -> Self {
        self.server_view = Some(server_view);
        self
    }

    /// Wire a plumber for `schema`. No rows are touched and no task is started.
    pub fn find_plumber(
        &self,
        schema: Schema,
        metrics: Arc<PlumberMetrics>,
    ) -> Result<RealtimePlumber, PlumberError> {
        schema.validate()?;
        self.config.validate()?;

        let collaborators = Collaborators {
            announcer: self.announcer.clone().context(MissingCollaboratorSnafu {
                collaborator: "announcer",
            })?,
            publisher: self.publisher.clone().context(MissingCollaboratorSnafu {
                collaborator: "publisher",
            })?,
            pusher: self.pusher.clone().context(MissingCollaboratorSnafu {
                collaborator: "pusher",
            })?,
            server_view: self.server_view.clone().context(MissingCollaboratorSnafu {
                collaborator: "server_view",
            })?,
        };

        debug!(
            target = %schema.data_source,
            granularity = ?self.config.segment_granularity,
            "Building plumber"
        );
        Ok(RealtimePlumber::new(
            Arc::new(schema),
            self.config.clone(),
            self.rejection,
            self.versioning.clone(),
            self.clock.clone(),
            collaborators,
            metrics,
        ))
    }
}
