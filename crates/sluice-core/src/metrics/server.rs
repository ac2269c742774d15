//! Prometheus recorder and HTTP endpoint.
//!
//! A single process-wide controller is installed once; `init_test()` may be called from many
//! test threads.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AddressParseSnafu, AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu,
    PrometheusInitSnafu,
};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 10.0, 30.0, 120.0, 600.0,
];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Access to the installed Prometheus recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

/// Install the recorder and serve `/metrics` and `/health` on `addr`.
pub fn init_global(addr: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = addr.parse().context(AddressParseSnafu)?;
    install()?;

    tokio::spawn(run_server(addr));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the recorder without an HTTP endpoint. Safe to call repeatedly.
pub fn init_test() {
    if install().is_err() {
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

fn install() -> Result<(), MetricsError> {
    if CONTROLLER.get().is_some() {
        return AlreadyInitializedSnafu.fail();
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())
}

impl MetricsController {
    /// Get the global controller.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

async fn run_server(addr: SocketAddr) {
    let Some(controller) = CONTROLLER.get() else {
        error!("Metrics controller missing, not starting server");
        return;
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(controller.handle.clone()));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit;
    use crate::metrics::events::{RejectReason, RowsRejected};

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        assert!(MetricsController::get().is_ok());
    }

    #[test]
    fn test_emitted_event_is_rendered() {
        init_test();

        emit!(RowsRejected {
            count: 3,
            reason: RejectReason::Policy,
            target: "render_test".to_string(),
        });

        let output = MetricsController::get().unwrap().render();
        assert!(output.contains("sluice_rows_rejected_total"));
        assert!(output.contains("render_test"));
    }

    #[test]
    fn test_bad_address_is_rejected() {
        let result = init_global("not an address");
        assert!(matches!(result, Err(MetricsError::AddressParse { .. })));
    }
}
