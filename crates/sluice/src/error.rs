//! Error types for the realtime write path.

use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

use crate::time::Interval;

// Re-export common errors
pub use sluice_core::error::{ConfigError, StorageError};

/// Errors returned by a [`Sink`](crate::sink::Sink).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// The bucket no longer accepts rows.
    #[snafu(display("Sink for {interval} is closed to writes"))]
    Closed { interval: Interval },

    /// Merge requested before every row reached local durable storage.
    #[snafu(display("Sink for {interval} is not ready to merge: {reason}"))]
    NotFinalized {
        interval: Interval,
        reason: &'static str,
    },
}

/// Errors from the local sink store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PersistError {
    /// Filesystem operation failed.
    #[snafu(display("I/O error at {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize a sink file.
    #[snafu(display("Failed to serialize {}: {source}", path.display()))]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A file in the local layout could not be decoded.
    #[snafu(display("Corrupt sink file {}: {source}", path.display()))]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Errors from external collaborators: announcer, publisher, pusher.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// Announcing or unannouncing a segment failed.
    #[snafu(display("Failed to announce segment {segment}: {message}"))]
    Announce { segment: String, message: String },

    /// Publishing segment metadata failed.
    #[snafu(display("Failed to publish segment {segment}: {message}"))]
    Publish { segment: String, message: String },

    /// Pushing segment files to deep storage failed.
    #[snafu(display("Failed to push segment {segment}: {message}"))]
    Push { segment: String, message: String },

    /// Deep storage or metadata store request failed.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Reading local segment files failed.
    #[snafu(display("Failed to read {}: {source}", path.display()))]
    LocalRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to encode or decode a segment descriptor.
    #[snafu(display("Invalid segment descriptor: {source}"))]
    Descriptor { source: serde_json::Error },
}

/// Top-level error for plumber operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PlumberError {
    /// Operation is not valid in the plumber's current state.
    #[snafu(display("Plumber is {state}, cannot {operation}"))]
    NotRunning {
        state: &'static str,
        operation: &'static str,
    },

    /// `start_job` was called twice.
    #[snafu(display("Plumber job already started"))]
    AlreadyStarted,

    /// Buffered rows did not reach durable storage before the drain deadline.
    #[snafu(display("Timed out after {timeout:?} waiting for in-flight flushes"))]
    DrainTimeout { timeout: Duration },

    /// The final flush finished but left data that never reached disk.
    #[snafu(display(
        "Final flush left {unpersisted} chunk(s) unpersisted and {buffered_rows} row(s) in memory"
    ))]
    FlushIncomplete {
        unpersisted: usize,
        buffered_rows: usize,
    },

    /// Local sink store error.
    #[snafu(display("Persist error: {source}"))]
    Persist { source: PersistError },

    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Collaborator error.
    #[snafu(display("Coordination error: {source}"))]
    Coordination { source: CoordinationError },

    /// A background task panicked or was cancelled.
    #[snafu(display("Background task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The persist worker exited while jobs were still being submitted.
    #[snafu(display("Persist worker is gone"))]
    PersistWorkerGone,
}

impl From<PersistError> for PlumberError {
    fn from(source: PersistError) -> Self {
        PlumberError::Persist { source }
    }
}

impl From<ConfigError> for PlumberError {
    fn from(source: ConfigError) -> Self {
        PlumberError::Config { source }
    }
}

impl From<CoordinationError> for PlumberError {
    fn from(source: CoordinationError) -> Self {
        PlumberError::Coordination { source }
    }
}

/// Errors from the NDJSON row source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Reading input failed.
    #[snafu(display("Failed to read input: {source}"))]
    Read { source: std::io::Error },

    /// A line could not be turned into a row.
    #[snafu(display("Unparseable row: {message}"))]
    Parse { message: String },

    /// The plumber refused the row.
    #[snafu(display("Plumber error: {source}"))]
    Plumber { source: PlumberError },
}
