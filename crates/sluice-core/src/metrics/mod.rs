//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and HTTP endpoint

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit an internal event as a metric.
///
/// ```ignore
/// use sluice_core::emit;
/// use sluice_core::metrics::events::RowsProcessed;
///
/// emit!(RowsProcessed { count: 1, target: "wikipedia".to_string() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
