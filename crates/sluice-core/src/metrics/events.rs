//! Internal events for sluice metrics emission.
//!
//! Each event struct represents a measurable occurrence on the realtime write path.
//! The `target` label carries the data source so one process can run several plumbers.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Rows accepted into a sink.
pub struct RowsProcessed {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RowsProcessed {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Rows processed");
        counter!("sluice_rows_processed_total", "target" => self.target).increment(self.count);
    }
}

/// Why a row never reached a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The rejection policy vetoed the row's timestamp.
    Policy,
    /// The bucket's sink no longer accepts writes.
    SinkClosed,
    /// The bucket was already handed off by this process.
    HandedOff,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Policy => "policy",
            RejectReason::SinkClosed => "sink_closed",
            RejectReason::HandedOff => "handed_off",
        }
    }
}

/// Rows thrown away before reaching a sink.
pub struct RowsRejected {
    pub count: u64,
    pub reason: RejectReason,
    pub target: String,
}

impl InternalEvent for RowsRejected {
    fn emit(self) {
        trace!(count = self.count, reason = self.reason.as_str(), target = %self.target, "Rows rejected");
        counter!(
            "sluice_rows_rejected_total",
            "reason" => self.reason.as_str(),
            "target" => self.target
        )
        .increment(self.count);
    }
}

/// Input lines that could not be parsed into rows.
pub struct RowsUnparseable {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RowsUnparseable {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Rows unparseable");
        counter!("sluice_rows_unparseable_total", "target" => self.target).increment(self.count);
    }
}

/// A chunk reached local durable storage.
pub struct ChunkPersisted {
    pub rows: u64,
    pub target: String,
}

impl InternalEvent for ChunkPersisted {
    fn emit(self) {
        trace!(rows = self.rows, target = %self.target, "Chunk persisted");
        counter!("sluice_chunks_persisted_total", "target" => self.target.clone()).increment(1);
        counter!("sluice_rows_persisted_total", "target" => self.target).increment(self.rows);
    }
}

/// A chunk failed to reach local durable storage.
pub struct PersistFailed {
    pub target: String,
}

impl InternalEvent for PersistFailed {
    fn emit(self) {
        trace!(target = %self.target, "Persist failed");
        counter!("sluice_persist_failures_total", "target" => self.target).increment(1);
    }
}

/// Duration of one persist job.
pub struct PersistDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for PersistDuration {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis(), target = %self.target, "Persist completed");
        histogram!("sluice_persist_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// A merged segment was pushed, published and announced.
pub struct SegmentPushed {
    pub bytes: u64,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for SegmentPushed {
    fn emit(self) {
        trace!(bytes = self.bytes, target = %self.target, "Segment pushed");
        counter!("sluice_segments_pushed_total", "target" => self.target.clone()).increment(1);
        counter!("sluice_segment_bytes_pushed_total", "target" => self.target.clone())
            .increment(self.bytes);
        histogram!("sluice_segment_close_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Stage of the interval-close sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStage {
    Persist,
    Merge,
    Push,
    Publish,
    Announce,
}

impl CloseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseStage::Persist => "persist",
            CloseStage::Merge => "merge",
            CloseStage::Push => "push",
            CloseStage::Publish => "publish",
            CloseStage::Announce => "announce",
        }
    }
}

/// An interval-close attempt failed and will be retried.
pub struct SegmentCloseFailed {
    pub stage: CloseStage,
    pub target: String,
}

impl InternalEvent for SegmentCloseFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), target = %self.target, "Segment close failed");
        counter!(
            "sluice_segment_close_failures_total",
            "stage" => self.stage.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// A replica confirmed serving a segment and local data was released.
pub struct SegmentHandedOff {
    pub target: String,
}

impl InternalEvent for SegmentHandedOff {
    fn emit(self) {
        trace!(target = %self.target, "Segment handed off");
        counter!("sluice_segments_handed_off_total", "target" => self.target).increment(1);
    }
}

/// Current number of live sinks.
pub struct LiveSinks {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for LiveSinks {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Live sinks");
        gauge!("sluice_live_sinks", "target" => self.target).set(self.count as f64);
    }
}

/// Current number of sinks waiting for a replica to take over.
pub struct SinksAwaitingHandoff {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for SinksAwaitingHandoff {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Sinks awaiting handoff");
        gauge!("sluice_sinks_awaiting_handoff", "target" => self.target).set(self.count as f64);
    }
}

/// Storage operation type.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
    Delete,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Outcome of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// A request against deep storage or the metadata store.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "sluice_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "sluice_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
