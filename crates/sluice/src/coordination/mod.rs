//! Interfaces to the rest of the cluster.
//!
//! The plumber never talks to a wire protocol directly. It announces, publishes and pushes
//! through these traits and learns about replicas through a [`ServerView`] subscription.

mod memory;
mod storage;

pub use memory::{
    InMemorySegmentAnnouncer, InMemorySegmentPublisher, InMemoryServerView, NoopSegmentPusher,
    PublishNotifyingPublisher,
};
pub use storage::{StorageSegmentPublisher, StorageSegmentPusher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoordinationError;
use crate::segment::DataSegment;

/// Tells the cluster this process can serve a segment.
#[async_trait]
pub trait SegmentAnnouncer: Send + Sync + Debug {
    async fn announce_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError>;

    async fn unannounce_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError>;
}

/// Records a segment in the metadata store.
#[async_trait]
pub trait SegmentPublisher: Send + Sync + Debug {
    async fn publish_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError>;
}

/// Copies a merged segment directory to deep storage.
#[async_trait]
pub trait SegmentPusher: Send + Sync + Debug {
    /// Returns the descriptor with `load_spec` pointing at the pushed files.
    async fn push(
        &self,
        dir: &Path,
        segment: &DataSegment,
    ) -> Result<DataSegment, CoordinationError>;
}

/// Source of segment-served / segment-dropped notifications.
pub trait ServerView: Send + Sync + Debug {
    fn subscribe(&self) -> SegmentSubscription;
}

pub type SegmentAnnouncerRef = Arc<dyn SegmentAnnouncer>;
pub type SegmentPublisherRef = Arc<dyn SegmentPublisher>;
pub type SegmentPusherRef = Arc<dyn SegmentPusher>;
pub type ServerViewRef = Arc<dyn ServerView>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Historical,
    Realtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub name: String,
    pub server_type: ServerType,
}

impl ServerMetadata {
    pub fn historical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_type: ServerType::Historical,
        }
    }

    pub fn realtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_type: ServerType::Realtime,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    Added {
        server: ServerMetadata,
        segment: DataSegment,
    },
    Removed {
        server: ServerMetadata,
        segment: DataSegment,
    },
    /// The view finished replaying its initial state.
    Initialized,
}

/// A live subscription. Dropping it, or calling [`cancel`](Self::cancel), unsubscribes.
#[derive(Debug)]
pub struct SegmentSubscription {
    events: mpsc::UnboundedReceiver<SegmentEvent>,
    cancel: CancellationToken,
}

impl SegmentSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<SegmentEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the view or the subscription is closed.
    pub async fn recv(&mut self) -> Option<SegmentEvent> {
        tokio::select! {
            event = self.events.recv() => event,
            _ = self.cancel.cancelled() => None,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SegmentSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
