pub mod fallback;
pub mod keyword;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use crate::platform::NormalizedMessage;

/// What a handler wants sent back to the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Lark message type, e.g. `text` or `interactive`.
    pub kind: String,
    /// JSON content string in the shape the message type expects.
    pub content: String,
}

impl Reply {
    /// A plain text reply, wrapped as `{"text": ...}`.
    pub fn text(text: &str) -> Self {
        Self {
            kind: "text".to_string(),
            content: serde_json::json!({ "text": text }).to_string(),
        }
    }
}

/// Result of one handler invocation. A reply can only exist on a claimed message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DispatchOutcome {
    #[default]
    Unclaimed,
    Claimed { reply: Option<Reply> },
}

impl DispatchOutcome {
    pub fn claimed(reply: Option<Reply>) -> Self {
        DispatchOutcome::Claimed { reply }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, DispatchOutcome::Claimed { .. })
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            DispatchOutcome::Claimed { reply } => reply.as_ref(),
            DispatchOutcome::Unclaimed => None,
        }
    }
}

/// One stage of the inbound message pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, msg: &NormalizedMessage) -> Result<DispatchOutcome>;
}

/// The outcome of a chain run plus the handler that claimed the message, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    pub handled_by: Option<&'static str>,
}

/// Runs handlers in registration order until one claims the message.
///
/// A handler error is logged and treated as "not claimed". Put an unconditional
/// claimer (see [`fallback::FallbackHandler`]) last to make the chain total.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub async fn process(&self, msg: &NormalizedMessage) -> Dispatched {
        for handler in &self.handlers {
            match handler.handle(msg).await {
                Ok(outcome) if outcome.is_claimed() => {
                    info!(
                        "Message {} handled by {}",
                        msg.message_id,
                        handler.name()
                    );
                    return Dispatched {
                        outcome,
                        handled_by: Some(handler.name()),
                    };
                }
                Ok(_) => {}
                Err(e) => error!("Handler {} failed: {:#}", handler.name(), e),
            }
        }
        Dispatched::default()
    }
}
