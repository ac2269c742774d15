//! Error types shared by the sluice crates.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            StorageError::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Data source name is empty.
    #[snafu(display("Schema data_source cannot be empty"))]
    EmptyDataSource,

    /// Schema declares no aggregators.
    #[snafu(display("Schema '{data_source}' must declare at least one aggregator"))]
    NoAggregators { data_source: String },

    /// Two aggregators share an output name.
    #[snafu(display("Duplicate aggregator name '{name}'"))]
    DuplicateAggregator { name: String },

    /// The persist directory is empty.
    #[snafu(display("base_persist_directory cannot be empty"))]
    EmptyPersistDirectory,

    /// A period must be strictly positive.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroPeriod { field: &'static str },

    /// A collaborator was not wired into the plumber school.
    #[snafu(display("Plumber school is missing its {collaborator}"))]
    MissingCollaborator { collaborator: &'static str },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Metrics server not initialized (controller accessed before init).
    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,

    /// Failed to parse the metrics bind address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },
}
