//! Sluice: the realtime write path of a time-bucketed column store.
//!
//! This crate handles:
//! - Routing timestamped rows into per-bucket [`Sink`]s, gated by a [`RejectionPolicy`]
//! - Periodically persisting sink buffers to local durable storage
//! - Closing elapsed buckets: merge, push to deep storage, publish, announce
//! - Waiting for a replica to serve each segment before releasing local data

pub mod config;
pub mod coordination;
pub mod error;
pub mod persist;
pub mod plumber;
pub mod policy;
pub mod row;
pub mod schema;
pub mod school;
pub mod segment;
pub mod sink;
pub mod source;
pub mod time;

pub use config::{CliArgs, Config};
pub use error::{CoordinationError, PersistError, PlumberError, SinkError, SourceError};
pub use plumber::{
    AddOutcome, MetricsSnapshot, PlumberMetrics, PlumberState, RealtimePlumber, RejectReason,
};
pub use policy::{RejectionPolicy, VersioningPolicy};
pub use row::InputRow;
pub use schema::{AggregatorSpec, Schema, ShardSpec};
pub use school::{PlumberConfig, RealtimePlumberSchool};
pub use segment::{DataSegment, SegmentId};
pub use sink::{Sink, SinkView};
pub use time::{
    Clock, ClockRef, Interval, ManualClock, QueryGranularity, SegmentGranularity, SystemClock,
};

pub use sluice_core::{
    StorageProvider, StorageProviderRef, init_metrics, init_tracing, shutdown_signal,
};
