use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broadcast::{BroadcastEvent, Broadcaster, Direction};
use crate::handler::{Dispatched, HandlerChain};
use crate::identity::{IdentityResolver, Resolution};
use crate::platform::{MessageSender, NormalizedMessage};
use crate::store::logs::MessageLog;
use crate::store::Store;

/// Source tag for replies produced by the handler chain.
pub const SOURCE_EVENT: &str = "event";

/// Run a side effect detached from the caller. Failures are logged under `name`.
pub fn spawn_background<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!("Background task '{}' failed: {:#}", name, e);
        }
    })
}

/// Outbound path: deliver through the platform, then log and broadcast the result.
pub struct Outbox {
    transport: Arc<dyn MessageSender>,
    store: Store,
    broadcaster: Broadcaster,
}

impl Outbox {
    pub fn new(transport: Arc<dyn MessageSender>, store: Store, broadcaster: Broadcaster) -> Self {
        Self {
            transport,
            store,
            broadcaster,
        }
    }
}

#[async_trait]
impl MessageSender for Outbox {
    async fn send(&self, chat_id: &str, kind: &str, content: &str, source: &str) -> Result<String> {
        let message_id = self.transport.send(chat_id, kind, content, source).await?;

        let chat_type = match self.store.chat_type_of(chat_id).await {
            Ok(kind) => kind,
            Err(e) => {
                debug!("Chat type lookup failed for {}: {:#}", chat_id, e);
                None
            }
        };

        let log = MessageLog {
            message_id: message_id.clone(),
            chat_id: chat_id.to_string(),
            chat_type,
            sender_id: String::new(),
            sender_name: String::new(),
            direction: Direction::Out,
            msg_type: kind.to_string(),
            content: content.to_string(),
            handled_by: String::new(),
            source: source.to_string(),
        };
        if let Err(e) = self.store.log_message(&log).await {
            warn!("Failed to log outgoing message {}: {:#}", message_id, e);
        }

        self.broadcaster.publish(
            &BroadcastEvent::message(&message_id, chat_id, chat_type, Direction::Out)
                .with_body(kind, content),
        );
        Ok(message_id)
    }
}

/// Inbound pipeline: identity, live feed, handler chain, reply, history.
pub struct Bot {
    resolver: IdentityResolver,
    chain: HandlerChain,
    outbox: Arc<dyn MessageSender>,
    store: Store,
    broadcaster: Broadcaster,
}

impl Bot {
    pub fn new(
        resolver: IdentityResolver,
        chain: HandlerChain,
        outbox: Arc<dyn MessageSender>,
        store: Store,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            resolver,
            chain,
            outbox,
            store,
            broadcaster,
        }
    }

    pub async fn on_message(&self, mut msg: NormalizedMessage) -> Dispatched {
        let resolution = self.resolver.resolve(&msg.sender_id).await;
        if let Resolution::Degraded { error, .. } = &resolution {
            debug!("Sender {} unresolved: {:#}", msg.sender_id, error);
        }
        let profile = resolution.into_profile();
        msg.sender_name = if profile.name.is_empty() {
            msg.sender_id.clone()
        } else {
            profile.name
        };

        let resolver = self.resolver.clone();
        let sender_id = msg.sender_id.clone();
        spawn_background("record user activity", async move {
            resolver.record_activity(&sender_id).await
        });

        self.broadcaster.publish(
            &BroadcastEvent::message(
                &msg.message_id,
                &msg.chat_id,
                Some(msg.chat_kind),
                Direction::In,
            )
            .with_sender(&msg.sender_id, &msg.sender_name)
            .with_body(&msg.kind, &msg.content),
        );

        let dispatched = self.chain.process(&msg).await;

        if let Some(reply) = dispatched.outcome.reply() {
            if let Err(e) = self
                .outbox
                .send(&msg.chat_id, &reply.kind, &reply.content, SOURCE_EVENT)
                .await
            {
                error!("Failed to reply to message {}: {:#}", msg.message_id, e);
            }
        }

        let store = self.store.clone();
        let log = MessageLog {
            message_id: msg.message_id.clone(),
            chat_id: msg.chat_id.clone(),
            chat_type: Some(msg.chat_kind),
            sender_id: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            direction: Direction::In,
            msg_type: msg.kind.clone(),
            content: msg.content.clone(),
            handled_by: dispatched.handled_by.unwrap_or_default().to_string(),
            source: String::new(),
        };
        spawn_background("log incoming message", async move {
            store.log_message(&log).await.map(|_| ())
        });

        dispatched
    }

    pub async fn on_recall(&self, message_id: &str, chat_id: &str) {
        if let Err(e) = self.store.recall(message_id).await {
            warn!("Failed to mark message {} recalled: {:#}", message_id, e);
        }
        self.broadcaster
            .publish(&BroadcastEvent::recall(message_id, chat_id));
    }
}
