//! Topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message and a slow subscriber only ever hurts itself (it lags and
//! loses the oldest events).
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Detections`] | One [`FrameBroadcast`][svcs_types::FrameBroadcast] state vector per ingested frame |
//! | [`Topic::ScanLifecycle`] | Scan completion and probe disconnects |
//! | [`Topic::SystemAlerts`] | Degraded collaborators, shutdown notices |

use svcs_types::{Event, SvcsError};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-frame state vectors.
    Detections,
    /// Scan stopped, probe gone.
    ScanLifecycle,
    /// Operational warnings and notices.
    SystemAlerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    detections: broadcast::Sender<Event>,
    scan_lifecycle: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (detections, _) = broadcast::channel(capacity);
        let (scan_lifecycle, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            detections,
            scan_lifecycle,
            system_alerts,
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of receivers handed the event, or
    /// [`SvcsError::Channel`] when nobody is subscribed to the topic.
    /// Publishers that do not care about observers treat that error as
    /// informational.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, SvcsError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| SvcsError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to every event on `topic`.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Current number of receivers on `topic`.
    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Detections => &self.detections,
            Topic::ScanLifecycle => &self.scan_lifecycle,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receivers
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(Lagged(n))` means `n` events were dropped because this receiver
    /// fell behind; `Err(Closed)` means every sender is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        let result = self.receiver.recv().await;
        if let Err(broadcast::error::RecvError::Lagged(n)) = &result {
            warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
        }
        result
    }

    /// Non-blocking receive, for draining after a synchronous step.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
