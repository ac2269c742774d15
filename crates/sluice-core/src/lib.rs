//! sluice-core: Shared plumbing for the sluice realtime write path.
//!
//! - `storage/` - object_store backed storage (local, in-memory, S3) used for deep storage
//!   and the segment metadata store
//! - `metrics/` - `emit!` events and the Prometheus endpoint
//! - `config/` - environment variable interpolation and YAML helpers
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber setup
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod tracing;

pub use config::{MetricsConfig, interpolate, parse_yaml};
pub use error::{ConfigError, MetricsError, StorageError};
pub use metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use signal::shutdown_signal;
pub use storage::{StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
