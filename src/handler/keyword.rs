//! Keyword auto-reply.
//!
//! Rules are evaluated in snapshot order and the first match wins. There is no
//! priority field: callers control precedence through the order of the rules they
//! hand to [`KeywordEngine::update_rules`] (the store lists them by id).

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DispatchOutcome, Handler, Reply};
use crate::platform::{ChatKind, NormalizedMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    #[default]
    Contains,
    Prefix,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Contains => "contains",
            MatchMode::Prefix => "prefix",
        }
    }

    /// Unknown values fall back to `contains`.
    pub fn parse(value: &str) -> Self {
        match value {
            "exact" => MatchMode::Exact,
            "prefix" => MatchMode::Prefix,
            _ => MatchMode::Contains,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Any,
    /// Direct chats, or group messages that mention the bot.
    AtBot,
    P2pOnly,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Any => "any",
            TriggerMode::AtBot => "at_bot",
            TriggerMode::P2pOnly => "p2p_only",
        }
    }

    /// Unknown values fall back to `any`.
    pub fn parse(value: &str) -> Self {
        match value {
            "at_bot" => TriggerMode::AtBot,
            "p2p_only" => TriggerMode::P2pOnly,
            _ => TriggerMode::Any,
        }
    }

    fn admits(&self, msg: &NormalizedMessage) -> bool {
        match self {
            TriggerMode::Any => true,
            TriggerMode::AtBot => msg.chat_kind == ChatKind::Direct || msg.mentions_bot,
            TriggerMode::P2pOnly => msg.chat_kind == ChatKind::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub id: i64,
    pub keyword: String,
    /// Reply template; see [`render_template`] for placeholders.
    pub reply_text: String,
    pub match_mode: MatchMode,
    /// Comma-separated chat id allow-list. Empty means every chat.
    pub chat_id: String,
    pub trigger_mode: TriggerMode,
    pub enabled: bool,
}

impl Default for KeywordRule {
    fn default() -> Self {
        Self {
            id: 0,
            keyword: String::new(),
            reply_text: String::new(),
            match_mode: MatchMode::default(),
            chat_id: String::new(),
            trigger_mode: TriggerMode::default(),
            enabled: true,
        }
    }
}

impl KeywordRule {
    fn allows_chat(&self, chat_id: &str) -> bool {
        self.chat_id.is_empty() || self.chat_id.split(',').any(|id| id.trim() == chat_id)
    }
}

/// Durable rule records; consulted on every reload.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Enabled rules in evaluation order.
    async fn list_enabled(&self) -> Result<Vec<KeywordRule>>;
}

/// Keyword matcher over a replaceable, immutable rule snapshot.
pub struct KeywordEngine {
    rules: RwLock<Arc<Vec<KeywordRule>>>,
}

impl KeywordEngine {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Swap in a new rule set. In-flight matches keep the snapshot they started with.
    pub fn update_rules(&self, rules: Vec<KeywordRule>) {
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
    }

    pub fn snapshot(&self) -> Arc<Vec<KeywordRule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// First enabled rule admitting `msg`, if any.
    pub fn find_match(&self, msg: &NormalizedMessage) -> Option<KeywordRule> {
        if msg.kind != "text" && msg.kind != "post" {
            return None;
        }
        if msg.text.is_empty() {
            return None;
        }

        self.snapshot()
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| rule.allows_chat(&msg.chat_id))
            .filter(|rule| rule.trigger_mode.admits(msg))
            .find(|rule| matches_keyword(&msg.text, &rule.keyword, rule.match_mode))
            .cloned()
    }
}

#[async_trait]
impl Handler for KeywordEngine {
    fn name(&self) -> &'static str {
        "KeywordEngine"
    }

    async fn handle(&self, msg: &NormalizedMessage) -> Result<DispatchOutcome> {
        Ok(match self.find_match(msg) {
            Some(rule) => {
                let text = render_template(&rule.reply_text, msg);
                DispatchOutcome::claimed(Some(Reply::text(&text)))
            }
            None => DispatchOutcome::Unclaimed,
        })
    }
}

/// `exact` compares with case folding; `prefix` and `contains` lowercase both sides.
pub fn matches_keyword(text: &str, keyword: &str, mode: MatchMode) -> bool {
    let text = text.trim();
    match mode {
        MatchMode::Exact => text
            .chars()
            .flat_map(char::to_lowercase)
            .eq(keyword.chars().flat_map(char::to_lowercase)),
        MatchMode::Prefix => text.to_lowercase().starts_with(&keyword.to_lowercase()),
        MatchMode::Contains => text.to_lowercase().contains(&keyword.to_lowercase()),
    }
}

/// Substitute `{{chat_id}}`, `{{chat_type}}`, `{{sender_id}}`, `{{sender_name}}`,
/// `{{message_id}}` and `{{content}}` with values from `msg`.
///
/// Single pass: substituted values are never expanded again, and unknown
/// placeholders are left as written.
pub fn render_template(template: &str, msg: &NormalizedMessage) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rest = &rest[start..];
            break;
        };

        let value = match &after[..end] {
            "chat_id" => Some(msg.chat_id.as_str()),
            "chat_type" => Some(msg.chat_kind.as_str()),
            "sender_id" => Some(msg.sender_id.as_str()),
            "sender_name" => Some(msg.sender_name.as_str()),
            "message_id" => Some(msg.message_id.as_str()),
            "content" => Some(msg.text.as_str()),
            _ => None,
        };
        match value {
            Some(value) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                // Emit the braces and rescan from just after them.
                out.push_str("{{");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
