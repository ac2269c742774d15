//! In-process collaborators.
//!
//! Used by tests and by single-node deployments where no cluster exists. Each fake can be told
//! to fail its next N calls so retry paths can be exercised.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    SegmentAnnouncer, SegmentEvent, SegmentPublisher, SegmentPublisherRef, SegmentPusher,
    SegmentSubscription, ServerMetadata, ServerView,
};
use crate::error::CoordinationError;
use crate::segment::{DataSegment, SegmentId};

/// Consume one injected failure, if any are left.
fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
pub struct InMemorySegmentAnnouncer {
    announced: Mutex<BTreeMap<SegmentId, DataSegment>>,
    unannounced: AtomicUsize,
    failures: AtomicU32,
}

impl InMemorySegmentAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    pub fn announced(&self) -> Vec<DataSegment> {
        self.announced.lock().values().cloned().collect()
    }

    pub fn is_announced(&self, id: &SegmentId) -> bool {
        self.announced.lock().contains_key(id)
    }

    pub fn unannounce_count(&self) -> usize {
        self.unannounced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentAnnouncer for InMemorySegmentAnnouncer {
    async fn announce_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError> {
        let id = segment.identifier();
        if take_failure(&self.failures) {
            return Err(CoordinationError::Announce {
                segment: id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.announced.lock().insert(id, segment.clone());
        Ok(())
    }

    async fn unannounce_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError> {
        let id = segment.identifier();
        if take_failure(&self.failures) {
            return Err(CoordinationError::Announce {
                segment: id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.announced.lock().remove(&id);
        self.unannounced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySegmentPublisher {
    published: Mutex<BTreeMap<SegmentId, DataSegment>>,
    calls: AtomicUsize,
    failures: AtomicU32,
}

impl InMemorySegmentPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<DataSegment> {
        self.published.lock().values().cloned().collect()
    }

    /// Successful publish calls, counting idempotent repeats.
    pub fn publish_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentPublisher for InMemorySegmentPublisher {
    async fn publish_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError> {
        let id = segment.identifier();
        if take_failure(&self.failures) {
            return Err(CoordinationError::Publish {
                segment: id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.published.lock().insert(id, segment.clone());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Leaves files where they are and points `load_spec` at the local directory.
#[derive(Debug, Default)]
pub struct NoopSegmentPusher {
    pushes: AtomicUsize,
    failures: AtomicU32,
}

impl NoopSegmentPusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentPusher for NoopSegmentPusher {
    async fn push(
        &self,
        dir: &Path,
        segment: &DataSegment,
    ) -> Result<DataSegment, CoordinationError> {
        if take_failure(&self.failures) {
            return Err(CoordinationError::Push {
                segment: segment.identifier().to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);

        let mut pushed = segment.clone();
        pushed.load_spec = BTreeMap::from([
            ("type".to_string(), "local".to_string()),
            ("path".to_string(), dir.display().to_string()),
        ]);
        Ok(pushed)
    }
}

/// Server view driven by explicit calls to [`segment_added`](Self::segment_added) and
/// [`segment_removed`](Self::segment_removed).
#[derive(Debug, Default)]
pub struct InMemoryServerView {
    subscribers: Mutex<Vec<(mpsc::UnboundedSender<SegmentEvent>, CancellationToken)>>,
}

impl InMemoryServerView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_added(&self, server: ServerMetadata, segment: DataSegment) {
        self.notify(SegmentEvent::Added { server, segment });
    }

    pub fn segment_removed(&self, server: ServerMetadata, segment: DataSegment) {
        self.notify(SegmentEvent::Removed { server, segment });
    }

    /// Live subscriptions. Cancelled ones are pruned first.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(tx, cancel)| !cancel.is_cancelled() && !tx.is_closed());
        subscribers.len()
    }

    fn notify(&self, event: SegmentEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(tx, cancel)| !cancel.is_cancelled() && tx.send(event.clone()).is_ok());
        debug!(subscribers = subscribers.len(), "Delivered segment event");
    }
}

impl ServerView for InMemoryServerView {
    fn subscribe(&self) -> SegmentSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        // a fresh subscriber has nothing to replay
        let _ = tx.send(SegmentEvent::Initialized);
        self.subscribers.lock().push((tx, cancel.clone()));
        SegmentSubscription::new(rx, cancel)
    }
}

/// Publisher that also reports each published segment as served by a local historical.
///
/// Lets a single node complete handoff once its segment is safely in deep storage and the
/// metadata store.
#[derive(Debug)]
pub struct PublishNotifyingPublisher {
    inner: SegmentPublisherRef,
    view: Arc<InMemoryServerView>,
    server: ServerMetadata,
}

impl PublishNotifyingPublisher {
    pub fn new(inner: SegmentPublisherRef, view: Arc<InMemoryServerView>) -> Self {
        Self {
            inner,
            view,
            server: ServerMetadata::historical("local-historical"),
        }
    }
}

#[async_trait]
impl SegmentPublisher for PublishNotifyingPublisher {
    async fn publish_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError> {
        self.inner.publish_segment(segment).await?;
        self.view
            .segment_added(self.server.clone(), segment.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AggregatorSpec, Schema};
    use crate::time::{SegmentGranularity, parse_timestamp};

    fn segment() -> DataSegment {
        let schema = Schema::new(
            "wikipedia",
            vec![AggregatorSpec::Count {
                name: "rows".into(),
            }],
        );
        let interval =
            SegmentGranularity::Hour.bucket(parse_timestamp("2013-01-01T00:00:00Z").unwrap());
        DataSegment::template(&schema, interval, "v1")
    }

    #[tokio::test]
    async fn test_announcer_failure_injection() {
        let announcer = InMemorySegmentAnnouncer::new();
        announcer.fail_next(1);
        assert!(announcer.announce_segment(&segment()).await.is_err());
        announcer.announce_segment(&segment()).await.unwrap();
        assert!(announcer.is_announced(&segment().identifier()));

        announcer.unannounce_segment(&segment()).await.unwrap();
        assert!(announcer.announced().is_empty());
        assert_eq!(announcer.unannounce_count(), 1);
    }

    #[tokio::test]
    async fn test_server_view_delivers_and_unsubscribes() {
        let view = InMemoryServerView::new();
        let mut subscription = view.subscribe();
        assert_eq!(subscription.recv().await, Some(SegmentEvent::Initialized));

        view.segment_added(ServerMetadata::historical("h1"), segment());
        assert!(matches!(
            subscription.recv().await,
            Some(SegmentEvent::Added { .. })
        ));

        subscription.cancel();
        assert_eq!(subscription.recv().await, None);
        assert_eq!(view.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let view = InMemoryServerView::new();
        let subscription = view.subscribe();
        assert_eq!(view.subscriber_count(), 1);
        drop(subscription);
        view.segment_removed(ServerMetadata::historical("h1"), segment());
        assert_eq!(view.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_notifying_publisher() {
        let view = Arc::new(InMemoryServerView::new());
        let inner = Arc::new(InMemorySegmentPublisher::new());
        let publisher = PublishNotifyingPublisher::new(inner.clone(), view.clone());
        let mut subscription = view.subscribe();
        subscription.recv().await;

        publisher.publish_segment(&segment()).await.unwrap();

        assert_eq!(inner.published().len(), 1);
        match subscription.recv().await {
            Some(SegmentEvent::Added { server, segment: s }) => {
                assert_eq!(server.server_type, crate::coordination::ServerType::Historical);
                assert_eq!(s, segment());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_noop_pusher_sets_load_spec() {
        let pusher = NoopSegmentPusher::new();
        let pushed = pusher
            .push(Path::new("/tmp/merged"), &segment())
            .await
            .unwrap();
        assert_eq!(pushed.load_spec["path"], "/tmp/merged");
        assert_eq!(pusher.push_count(), 1);
    }
}
