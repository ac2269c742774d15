//! Handoff coordinator.
//!
//! A single task owns the server view subscription. Sinks that finished their close sequence
//! are registered with [`HandoffHandle::await_handoff`]. A sink is confirmed once a historical
//! server reports a segment of the same data source whose interval lies inside the sink's and
//! whose version is at least the sink's. Only then is the segment unannounced, the local
//! directory deleted and the sink dropped.
//!
//! Served segments that fall inside a live sink are remembered until a matching `Removed`
//! event or until that sink is released, so a confirmation that arrives before the sink is
//! registered still counts. Notifications for segments this plumber does not track are
//! ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_core::emit;
use sluice_core::metrics::events::SegmentHandedOff;

use super::Inner;
use crate::coordination::{SegmentEvent, SegmentSubscription, ServerType};
use crate::segment::{DataSegment, SegmentId};
use crate::sink::Sink;

pub(crate) struct HandoffHandle {
    tx: mpsc::UnboundedSender<Arc<Sink>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HandoffHandle {
    pub fn spawn(
        inner: Weak<Inner>,
        subscription: SegmentSubscription,
        data_source: String,
        check_period: Duration,
        warn_after: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let coordinator = HandoffCoordinator {
            inner,
            data_source,
            warn_after,
            pending: HashMap::new(),
            served: HashMap::new(),
        };
        let handle = tokio::spawn(coordinator.run(rx, subscription, cancel.clone(), check_period));
        Self { tx, cancel, handle }
    }

    /// Register a sink whose segment has been pushed, published and announced.
    pub fn await_handoff(&self, sink: Arc<Sink>) -> bool {
        self.tx.send(sink).is_ok()
    }

    /// Cancel the subscription and stop the task.
    pub fn shutdown(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle
    }
}

struct PendingHandoff {
    sink: Arc<Sink>,
    confirmed: bool,
    unannounced: bool,
}

struct HandoffCoordinator {
    inner: Weak<Inner>,
    data_source: String,
    warn_after: Duration,
    pending: HashMap<i64, PendingHandoff>,
    /// Segments of this data source served by historicals, with the servers serving them.
    served: HashMap<SegmentId, (DataSegment, HashSet<String>)>,
}

impl HandoffCoordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Arc<Sink>>,
        mut subscription: SegmentSubscription,
        cancel: CancellationToken,
        check_period: Duration,
    ) {
        let mut tick = tokio::time::interval_at(Instant::now() + check_period, check_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subscribed = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(sink) => self.register(sink).await,
                    None => break,
                },
                event = subscription.recv(), if subscribed => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        warn!(target = %self.data_source, "Segment subscription closed, handoff confirmations stopped");
                        subscribed = false;
                    }
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        subscription.cancel();
        debug!(target = %self.data_source, pending = self.pending.len(), "Handoff coordinator stopped");
    }

    async fn register(&mut self, sink: Arc<Sink>) {
        let key = sink.interval().start_millis();
        debug!(interval = %sink.interval(), "Awaiting handoff");
        self.pending.insert(
            key,
            PendingHandoff {
                sink,
                confirmed: false,
                unannounced: false,
            },
        );
        self.confirm_and_complete().await;
    }

    async fn on_event(&mut self, event: SegmentEvent) {
        match event {
            SegmentEvent::Added { server, segment } => {
                if server.server_type != ServerType::Historical
                    || segment.data_source != self.data_source
                {
                    return;
                }
                let tracked = self
                    .inner
                    .upgrade()
                    .is_some_and(|inner| inner.covers_interval(&segment.interval));
                if !tracked {
                    return;
                }
                let id = segment.identifier();
                self.served
                    .entry(id)
                    .or_insert_with(|| (segment, HashSet::new()))
                    .1
                    .insert(server.name);
                self.confirm_and_complete().await;
            }
            SegmentEvent::Removed { server, segment } => {
                let id = segment.identifier();
                if let Some((_, servers)) = self.served.get_mut(&id) {
                    servers.remove(&server.name);
                    if servers.is_empty() {
                        self.served.remove(&id);
                    }
                }
            }
            SegmentEvent::Initialized => {}
        }
    }

    async fn on_tick(&mut self) {
        self.confirm_and_complete().await;

        let now = Instant::now();
        for pending in self.pending.values().filter(|p| !p.confirmed) {
            let Some(since) = pending.sink.awaiting_handoff_since() else {
                continue;
            };
            let waited = now.saturating_duration_since(since);
            if waited >= self.warn_after {
                warn!(
                    target = %self.data_source,
                    interval = %pending.sink.interval(),
                    version = %pending.sink.version(),
                    waited_secs = waited.as_secs(),
                    "Segment still awaiting handoff, keeping local data"
                );
            }
        }
    }

    fn is_served(&self, sink: &Sink) -> bool {
        self.served.values().any(|(segment, _)| {
            segment.data_source == self.data_source
                && sink.interval().contains_interval(&segment.interval)
                && segment.version.as_str() >= sink.version()
        })
    }

    /// Mark newly confirmed sinks and finish every confirmed one.
    async fn confirm_and_complete(&mut self) {
        let newly_confirmed: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| !p.confirmed && self.is_served(&p.sink))
            .map(|(key, _)| *key)
            .collect();
        for key in newly_confirmed {
            if let Some(pending) = self.pending.get_mut(&key) {
                info!(
                    target = %self.data_source,
                    interval = %pending.sink.interval(),
                    "Segment served by a historical, releasing local copy"
                );
                pending.confirmed = true;
            }
        }

        let confirmed: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.confirmed)
            .map(|(key, _)| *key)
            .collect();
        for key in confirmed {
            if self.complete(key).await {
                self.pending.remove(&key);
            }
        }
    }

    /// Unannounce, delete local files, drop the sink. Returns false if a step must be retried.
    async fn complete(&mut self, key: i64) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let Some(pending) = self.pending.get_mut(&key) else {
            return true;
        };
        let sink = pending.sink.clone();

        if !pending.unannounced {
            if let Some(pushed) = sink.pushed_segment() {
                if let Err(e) = inner
                    .collaborators
                    .announcer
                    .unannounce_segment(&pushed)
                    .await
                {
                    warn!(interval = %sink.interval(), error = %e, "Failed to unannounce segment, will retry");
                    return false;
                }
            }
            pending.unannounced = true;
        }

        if let Err(e) = inner.store.remove_sink(sink.segment()).await {
            warn!(interval = %sink.interval(), error = %e, "Failed to delete local segment files, will retry");
            return false;
        }

        inner.release_handed_off(key, &sink);
        self.served
            .retain(|_, (segment, _)| !sink.interval().contains_interval(&segment.interval));
        emit!(SegmentHandedOff {
            target: self.data_source.clone(),
        });
        info!(
            target = %self.data_source,
            interval = %sink.interval(),
            version = %sink.version(),
            "Segment handed off"
        );
        true
    }
}
