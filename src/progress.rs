#![forbid(unsafe_code)]

//! Best-effort push delivery of per-task progress to the client that started
//! the task.
//!
//! Each live push connection owns a [`Subscription`]; the channel keeps only
//! the sending half. Workers never talk to connections directly: they write
//! into a per-task queue obtained from [`ProgressChannel::task_stream`], and a
//! forwarder drains it in order into whatever subscriber the task is bound to.
//! Events for a subscriber that is gone are dropped.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::registry::TaskId;

/// Identity of a push connection, handed to the client at connect time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SubscriberId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// Transfer statistics. Every field may be unknown.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TransferProgress {
    pub percent: Option<f64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProgressEvent {
    Downloading(TransferProgress),
    Processing { message: String },
    Complete { filename: String },
    Error { error: String },
}

impl ProgressEvent {
    pub fn processing() -> Self {
        Self::Processing {
            message: "Processing file...".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    fn wire_name(&self) -> &'static str {
        match self {
            Self::Downloading(_) | Self::Processing { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// One event addressed to one task.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressMessage {
    pub task_id: TaskId,
    pub event: ProgressEvent,
}

#[derive(Serialize)]
struct WireFrame<'a> {
    event: &'static str,
    task_id: TaskId,
    data: WireData<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireData<'a> {
    Event(&'a ProgressEvent),
    Filename { filename: &'a str },
    Error { error: &'a str },
}

impl ProgressMessage {
    /// JSON text frame sent over the push connection.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let data = match &self.event {
            ProgressEvent::Complete { filename } => WireData::Filename { filename },
            ProgressEvent::Error { error } => WireData::Error { error },
            other => WireData::Event(other),
        };
        serde_json::to_string(&WireFrame {
            event: self.event.wire_name(),
            task_id: self.task_id,
            data,
        })
    }
}

/// Producer half of a task's progress queue.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

type Bindings = HashMap<SubscriberId, mpsc::UnboundedSender<ProgressMessage>>;

#[derive(Clone, Default)]
pub struct ProgressChannel {
    bindings: Arc<Mutex<Bindings>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a new connection and returns its receiving end.
    pub fn connect(&self) -> Subscription {
        let id = SubscriberId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.bindings.lock().insert(id, sender.clone());
        debug!(subscriber = %id, "subscriber bound");
        Subscription {
            id,
            sender,
            receiver,
            channel: self.clone(),
        }
    }

    /// Delivers at most once. Returns whether a live subscriber accepted it.
    pub fn publish(&self, subscriber: SubscriberId, message: ProgressMessage) -> bool {
        let sender = self.bindings.lock().get(&subscriber).cloned();
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => {
                trace!(subscriber = %subscriber, "dropping event for absent subscriber");
                false
            }
        }
    }

    pub fn is_bound(&self, subscriber: SubscriberId) -> bool {
        self.bindings.lock().contains_key(&subscriber)
    }

    pub fn subscriber_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Opens the ordered per-task queue a worker writes into. The forwarder
    /// ends once every sender clone is dropped, so awaiting it guarantees all
    /// queued events have been handed to the subscriber.
    pub fn task_stream(
        &self,
        task_id: TaskId,
        subscriber: Option<SubscriberId>,
    ) -> (ProgressSender, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ProgressEvent>();
        let channel = self.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Some(subscriber) = subscriber {
                    channel.publish(subscriber, ProgressMessage { task_id, event });
                }
            }
        });
        (sender, forwarder)
    }

    fn unbind(&self, id: SubscriberId) {
        self.bindings.lock().remove(&id);
    }
}

/// A live push connection. Dropping it unbinds the subscriber.
pub struct Subscription {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<ProgressMessage>,
    receiver: mpsc::UnboundedReceiver<ProgressMessage>,
    channel: ProgressChannel,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly re-asserts the binding for this connection.
    pub fn rejoin(&self) {
        self.channel
            .bindings
            .lock()
            .insert(self.id, self.sender.clone());
        debug!(subscriber = %self.id, "subscriber re-joined");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.unbind(self.id);
        debug!(subscriber = %self.id, "subscriber unbound");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloading(percent: f64) -> ProgressEvent {
        ProgressEvent::Downloading(TransferProgress {
            percent: Some(percent),
            ..TransferProgress::default()
        })
    }

    #[tokio::test]
    async fn publish_reaches_only_the_bound_subscriber() {
        let channel = ProgressChannel::new();
        let mut alice = channel.connect();
        let mut bob = channel.connect();
        let task_id = TaskId::new();

        assert!(channel.publish(
            alice.id(),
            ProgressMessage {
                task_id,
                event: downloading(10.0)
            }
        ));
        assert_eq!(alice.recv().await.unwrap().event, downloading(10.0));
        assert!(bob.try_recv().is_none());
    }

    #[tokio::test]
    async fn events_for_departed_subscribers_are_dropped() {
        let channel = ProgressChannel::new();
        let subscription = channel.connect();
        let id = subscription.id();
        drop(subscription);
        assert!(!channel.is_bound(id));
        assert!(!channel.publish(
            id,
            ProgressMessage {
                task_id: TaskId::new(),
                event: ProgressEvent::processing()
            }
        ));
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn rejoin_restores_binding() {
        let channel = ProgressChannel::new();
        let mut subscription = channel.connect();
        channel.unbind(subscription.id());
        subscription.rejoin();
        assert!(channel.is_bound(subscription.id()));
        let task_id = TaskId::new();
        channel.publish(
            subscription.id(),
            ProgressMessage {
                task_id,
                event: ProgressEvent::processing(),
            },
        );
        assert_eq!(subscription.recv().await.unwrap().task_id, task_id);
    }

    #[tokio::test]
    async fn task_streams_preserve_order_per_task() {
        let channel = ProgressChannel::new();
        let mut subscription = channel.connect();
        let task_a = TaskId::new();
        let task_b = TaskId::new();
        let (sender_a, forward_a) = channel.task_stream(task_a, Some(subscription.id()));
        let (sender_b, forward_b) = channel.task_stream(task_b, Some(subscription.id()));

        for step in 0..50 {
            sender_a.send(downloading(step as f64)).unwrap();
            sender_b.send(downloading(100.0 - step as f64)).unwrap();
        }
        drop(sender_a);
        drop(sender_b);
        forward_a.await.unwrap();
        forward_b.await.unwrap();

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while let Some(message) = subscription.try_recv() {
            let ProgressEvent::Downloading(progress) = message.event else {
                panic!("unexpected event");
            };
            if message.task_id == task_a {
                seen_a.push(progress.percent.unwrap());
            } else {
                seen_b.push(progress.percent.unwrap());
            }
        }
        assert_eq!(seen_a, (0..50).map(|s| s as f64).collect::<Vec<_>>());
        assert_eq!(
            seen_b,
            (0..50).map(|s| 100.0 - s as f64).collect::<Vec<_>>()
        );
    }

    #[test]
    fn wire_frames_match_event_kinds() {
        let task_id = TaskId::new();
        let progress = ProgressMessage {
            task_id,
            event: ProgressEvent::Downloading(TransferProgress {
                percent: Some(45.5),
                speed: None,
                eta: Some(10),
                downloaded_bytes: None,
                total_bytes: Some(1024),
            }),
        };
        let value: serde_json::Value =
            serde_json::from_str(&progress.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "progress");
        assert_eq!(value["task_id"], task_id.to_string());
        assert_eq!(value["data"]["status"], "downloading");
        assert_eq!(value["data"]["percent"], 45.5);
        assert!(value["data"]["speed"].is_null());

        let complete = ProgressMessage {
            task_id,
            event: ProgressEvent::Complete {
                filename: "Clip.mp4".into(),
            },
        };
        let value: serde_json::Value =
            serde_json::from_str(&complete.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "complete");
        assert_eq!(value["data"]["filename"], "Clip.mp4");

        let error = ProgressMessage {
            task_id,
            event: ProgressEvent::Error {
                error: "boom".into(),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&error.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["error"], "boom");
    }
}
