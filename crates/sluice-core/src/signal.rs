//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT or SIGTERM, then cancel `token`.
///
/// If the handlers cannot be installed the token is left untouched and the function returns,
/// so callers should treat it as a best-effort trigger.
#[cfg(unix)]
pub async fn shutdown_signal(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[cfg(not(unix))]
pub async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for ctrl-c");
                return;
            }
            info!(message = "Signal received.", signal = "ctrl-c");
        }
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_returns_when_token_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(Duration::from_millis(200), shutdown_signal(token))
            .await
            .expect("shutdown_signal should return once the token is cancelled");
    }
}
