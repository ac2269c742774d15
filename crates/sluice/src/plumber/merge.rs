//! Interval close: final flush, merge, push, publish, announce.
//!
//! Runs once per elapsed bucket, serialized per sink by the sink's close mutex. Every step is
//! idempotent so a failed attempt is simply retried after a backoff:
//! the merged directory is reused once complete, pushes and publishes overwrite the same keys,
//! and announcing twice is harmless.

use snafu::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use sluice_core::emit;
use sluice_core::metrics::events::{CloseStage, SegmentCloseFailed, SegmentPushed};

use super::Inner;
use crate::sink::Sink;

#[derive(Debug, Snafu)]
#[snafu(display("{} failed: {message}", stage.as_str()))]
struct CloseFailure {
    stage: CloseStage,
    message: String,
}

fn failure(stage: CloseStage, error: impl std::fmt::Display) -> CloseFailure {
    CloseFailureSnafu {
        stage,
        message: error.to_string(),
    }
    .build()
}

/// Close `sink` unless another attempt is in progress or its backoff has not expired.
pub(crate) async fn close_sink(inner: Arc<Inner>, sink: Arc<Sink>) {
    let Ok(mut attempts) = sink.close.try_lock() else {
        return;
    };
    if !attempts.ready(tokio::time::Instant::now()) || sink.pushed_segment().is_some() {
        return;
    }

    sink.finish_writing();
    let target = inner.schema.data_source.clone();

    if sink.num_rows() == 0 && sink.chunk_count() == 0 {
        if let Err(e) = inner.store.remove_sink(sink.segment()).await {
            warn!(interval = %sink.interval(), error = %e, "Failed to remove empty sink directory");
            return;
        }
        inner.release_empty(&sink);
        debug!(target = %target, interval = %sink.interval(), "Dropped empty sink");
        return;
    }

    info!(
        target = %target,
        interval = %sink.interval(),
        version = %sink.version(),
        attempt = attempts.failures() + 1,
        "Closing sink"
    );

    let start = Instant::now();
    match run_close(&inner, &sink).await {
        Ok(bytes) => {
            attempts.reset();
            inner.metrics.record_segment_pushed();
            emit!(SegmentPushed {
                bytes,
                duration: start.elapsed(),
                target: target.clone(),
            });
            info!(
                target = %target,
                interval = %sink.interval(),
                bytes,
                "Segment pushed, awaiting handoff"
            );
            inner.await_handoff(sink.clone());
        }
        Err(e) => {
            let delay = attempts.record_failure(
                tokio::time::Instant::now(),
                inner.config.close_retry_base,
                inner.config.close_retry_max,
            );
            emit!(SegmentCloseFailed {
                stage: e.stage,
                target: target.clone(),
            });
            warn!(
                target = %target,
                interval = %sink.interval(),
                error = %e,
                retry_in_secs = delay.as_secs(),
                "Failed to close sink, will retry"
            );
        }
    }
}

/// Returns the merged segment size in bytes.
async fn run_close(inner: &Inner, sink: &Arc<Sink>) -> Result<u64, CloseFailure> {
    let flushed = inner
        .persist_sink_and_wait(sink)
        .await
        .map_err(|e| failure(CloseStage::Persist, e))?;
    if !flushed {
        return Err(failure(CloseStage::Persist, "chunks did not reach local disk"));
    }

    let rows = sink
        .merged_immutable()
        .map_err(|e| failure(CloseStage::Merge, e))?;
    let merged = inner
        .store
        .write_merged(sink.segment(), &rows)
        .await
        .map_err(|e| failure(CloseStage::Merge, e))?;

    let pushed = inner
        .collaborators
        .pusher
        .push(&merged.dir, &merged.descriptor)
        .await
        .map_err(|e| failure(CloseStage::Push, e))?;

    inner
        .collaborators
        .publisher
        .publish_segment(&pushed)
        .await
        .map_err(|e| failure(CloseStage::Publish, e))?;

    inner
        .store
        .mark_pushed(&pushed)
        .await
        .map_err(|e| failure(CloseStage::Persist, e))?;

    inner
        .collaborators
        .announcer
        .announce_segment(&pushed)
        .await
        .map_err(|e| failure(CloseStage::Announce, e))?;

    let size = pushed.size;
    sink.mark_awaiting_handoff(pushed);
    Ok(size)
}
