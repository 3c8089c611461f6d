pub mod event;
pub mod lark;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Whether a conversation is one-to-one or multi-party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChatKind {
    #[serde(rename = "p2p")]
    Direct,
    #[default]
    #[serde(rename = "group")]
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "p2p",
            ChatKind::Group => "group",
        }
    }

    /// Lark reports direct chats as `p2p`; anything else is treated as a group.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "p2p" => ChatKind::Direct,
            _ => ChatKind::Group,
        }
    }
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound message, normalized from the platform event.
#[derive(Debug, Clone, Default)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub chat_id: String,
    pub chat_kind: ChatKind,
    pub sender_id: String,
    /// Filled in by the identity resolver before dispatch.
    pub sender_name: String,
    /// `text`, `post`, `image`, ...
    pub kind: String,
    /// Raw JSON content as delivered by the platform (mentions already substituted).
    pub content: String,
    /// Plain text extracted from `content`; empty for non-text messages.
    pub text: String,
    pub mentions_bot: bool,
}

/// Outbound message delivery.
///
/// `source` tags where the message came from (`event`, `scheduled`, `manual`) for the
/// message log. Returns the platform's id for the sent message.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, chat_id: &str, kind: &str, content: &str, source: &str)
        -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_kind_wire_values() {
        assert_eq!(ChatKind::from_wire("p2p"), ChatKind::Direct);
        assert_eq!(ChatKind::from_wire("group"), ChatKind::Group);
        assert_eq!(ChatKind::from_wire("topic_group"), ChatKind::Group);
        assert_eq!(ChatKind::Direct.to_string(), "p2p");
        assert_eq!(
            serde_json::to_string(&ChatKind::Direct).unwrap(),
            "\"p2p\""
        );
    }
}
