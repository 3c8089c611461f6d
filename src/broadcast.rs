//! In-process fan-out of message activity to live subscribers (the SSE stream).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::platform::ChatKind;

/// Per-subscriber queue depth. Events beyond this are dropped for that subscriber.
pub const QUEUE_CAPACITY: usize = 32;

/// Subscribers of this topic receive every event.
pub const GLOBAL_TOPIC: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub id: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatKind>,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub msg_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recalled: bool,
    /// Target of a recall event.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

impl BroadcastEvent {
    /// A message event; `id` is the platform message id when known.
    pub fn message(
        id: &str,
        chat_id: &str,
        chat_type: Option<ChatKind>,
        direction: Direction,
    ) -> Self {
        Self {
            id: if id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                id.to_string()
            },
            chat_id: chat_id.to_string(),
            chat_type,
            sender_id: String::new(),
            sender_name: String::new(),
            direction: Some(direction),
            msg_type: String::new(),
            content: String::new(),
            recalled: false,
            message_id: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn recall(message_id: &str, chat_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            chat_type: None,
            sender_id: String::new(),
            sender_name: String::new(),
            direction: None,
            msg_type: String::new(),
            content: String::new(),
            recalled: true,
            message_id: message_id.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_sender(mut self, sender_id: &str, sender_name: &str) -> Self {
        self.sender_id = sender_id.to_string();
        self.sender_name = sender_name.to_string();
        self
    }

    pub fn with_body(mut self, msg_type: &str, content: &str) -> Self {
        self.msg_type = msg_type.to_string();
        self.content = content.to_string();
        self
    }
}

type Topics = HashMap<String, HashMap<u64, mpsc::Sender<BroadcastEvent>>>;

struct Inner {
    topics: RwLock<Topics>,
    next_id: AtomicU64,
}

/// Topic-keyed publish/subscribe hub with bounded, drop-on-full queues.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new queue under `topic` (a chat id, or [`GLOBAL_TOPIC`]).
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);

        debug!("Subscriber {} joined topic '{}'", id, topic);
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
            broadcaster: self.clone(),
        }
    }

    /// Deregister and close a subscription's queue. Repeated calls are no-ops.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.remove(&subscription.topic, subscription.id);
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = topics.get_mut(topic) {
            // Dropping the only sender closes the queue.
            if subscribers.remove(&id).is_some() {
                debug!("Subscriber {} left topic '{}'", id, topic);
            }
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Deliver `event` to subscribers of its chat and of the global topic.
    ///
    /// Never blocks: a full queue loses this event for that subscriber only.
    /// Returns how many queues accepted the event.
    pub fn publish(&self, event: &BroadcastEvent) -> usize {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        let mut targets = vec![GLOBAL_TOPIC];
        if event.chat_id != GLOBAL_TOPIC {
            targets.push(event.chat_id.as_str());
        }

        for topic in targets {
            let Some(subscribers) = topics.get(topic) else {
                continue;
            };
            for (id, tx) in subscribers {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!("Subscriber {} queue full, dropping event {}", id, event.id)
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, HashMap::len)
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<BroadcastEvent>,
    broadcaster: Broadcaster,
}

#[cfg(test)]
impl Subscription {
    /// Next event; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = BroadcastEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self);
    }
}
