//! Parsing of Lark event-callback payloads into normalized messages.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{ChatKind, NormalizedMessage};

/// A decoded event callback.
#[derive(Debug)]
pub struct Callback {
    /// Verification token carried by the payload, if any.
    pub token: Option<String>,
    pub event: InboundEvent,
}

#[derive(Debug)]
pub enum InboundEvent {
    /// Endpoint ownership challenge; the challenge must be echoed back.
    UrlVerification { challenge: String },
    Message(NormalizedMessage),
    Recalled { message_id: String, chat_id: String },
    /// A valid envelope for an event type we don't act on.
    Ignored { event_type: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    header: Option<Header>,
    #[serde(default)]
    event: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Header {
    event_type: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserIds {
    #[serde(default)]
    open_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    #[serde(default)]
    sender_id: Option<UserIds>,
}

#[derive(Debug, Deserialize)]
struct Mention {
    #[serde(default)]
    key: String,
    #[serde(default)]
    id: Option<UserIds>,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    chat_type: String,
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    mentions: Vec<Mention>,
}

#[derive(Debug, Deserialize)]
struct MessageReceive {
    #[serde(default)]
    sender: Option<Sender>,
    message: RawMessage,
}

#[derive(Debug, Deserialize)]
struct MessageRecalled {
    message_id: String,
    #[serde(default)]
    chat_id: Option<String>,
}

/// Decode a raw callback body. `bot_open_id` is used to detect mentions of the bot.
pub fn parse_callback(body: &[u8], bot_open_id: Option<&str>) -> Result<Callback> {
    let envelope: Envelope =
        serde_json::from_slice(body).context("Failed to parse event callback")?;

    if envelope.kind.as_deref() == Some("url_verification") {
        let challenge = envelope
            .challenge
            .context("url_verification callback without challenge")?;
        return Ok(Callback {
            token: envelope.token,
            event: InboundEvent::UrlVerification { challenge },
        });
    }

    let header = envelope
        .header
        .context("Event callback without header (only schema 2.0 is supported)")?;
    let token = header.token.clone();

    let event = match header.event_type.as_str() {
        "im.message.receive_v1" => {
            let raw = envelope.event.context("Message event without body")?;
            let receive: MessageReceive =
                serde_json::from_value(raw).context("Failed to parse message event")?;
            InboundEvent::Message(normalize(receive, bot_open_id))
        }
        "im.message.recalled_v1" => {
            let raw = envelope.event.context("Recall event without body")?;
            let recalled: MessageRecalled =
                serde_json::from_value(raw).context("Failed to parse recall event")?;
            InboundEvent::Recalled {
                message_id: recalled.message_id,
                chat_id: recalled.chat_id.unwrap_or_default(),
            }
        }
        other => InboundEvent::Ignored {
            event_type: other.to_string(),
        },
    };

    Ok(Callback { token, event })
}

fn normalize(receive: MessageReceive, bot_open_id: Option<&str>) -> NormalizedMessage {
    let sender_id = receive
        .sender
        .and_then(|s| s.sender_id)
        .and_then(|ids| ids.open_id)
        .unwrap_or_default();

    let message = receive.message;
    let content = replace_mentions(&message.content, &message.mentions);
    let text = extract_text(&content);
    let mentions_bot = contains_bot_mention(&message.mentions, bot_open_id);

    NormalizedMessage {
        message_id: message.message_id,
        chat_id: message.chat_id,
        chat_kind: ChatKind::from_wire(&message.chat_type),
        sender_id,
        sender_name: String::new(),
        kind: message.message_type,
        content,
        text,
        mentions_bot,
    }
}

/// Replace `@_user_N` placeholders with `@[Name]` so the mention boundary survives.
///
/// Substitution happens inside the decoded `text` values, so names containing quotes
/// or backslashes keep the content valid JSON. Non-JSON content is rewritten as-is.
fn replace_mentions(content: &str, mentions: &[Mention]) -> String {
    if mentions.is_empty() && !content.contains("@_all") {
        return content.to_string();
    }
    let mut keyed: Vec<(&str, String)> = mentions
        .iter()
        .filter(|m| !m.key.is_empty() && !m.name.is_empty())
        .map(|m| (m.key.as_str(), format!("@[{}]", m.name)))
        .collect();
    keyed.push(("@_all", "@[all]".to_string()));
    // Longest key first so `@_user_10` is never read as `@_user_1`.
    keyed.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    match serde_json::from_str::<Value>(content) {
        Ok(mut value) => {
            rewrite_text_fields(&mut value, &keyed);
            serde_json::to_string(&value).unwrap_or_else(|_| content.to_string())
        }
        Err(_) => substitute_keys(content, &keyed),
    }
}

fn rewrite_text_fields(value: &mut Value, keyed: &[(&str, String)]) {
    match value {
        Value::Object(map) => {
            for (field, inner) in map.iter_mut() {
                match inner {
                    Value::String(s) if field == "text" => *s = substitute_keys(s, keyed),
                    other => rewrite_text_fields(other, keyed),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_text_fields(item, keyed);
            }
        }
        _ => {}
    }
}

/// Replace whole mention keys only: a key followed by another key character is left alone.
fn substitute_keys(text: &str, keyed: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        rest = &rest[at..];
        let hit = keyed.iter().find(|(key, _)| {
            rest.starts_with(key)
                && !rest[key.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        });
        match hit {
            Some((key, replacement)) => {
                out.push_str(replacement);
                rest = &rest[key.len()..];
            }
            None => {
                out.push('@');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn contains_bot_mention(mentions: &[Mention], bot_open_id: Option<&str>) -> bool {
    let Some(bot) = bot_open_id.filter(|id| !id.is_empty()) else {
        return false;
    };
    mentions.iter().any(|m| {
        m.id
            .as_ref()
            .and_then(|ids| ids.open_id.as_deref())
            .is_some_and(|id| id == bot)
    })
}

/// Extract plain text from message content.
///
/// `{"text": ..}` yields the trimmed text, post messages yield their concatenated text
/// and mention tags, other JSON yields an empty string, and non-JSON is returned as-is.
pub fn extract_text(content: &str) -> String {
    let value: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => return content.to_string(),
    };

    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return text.trim().to_string();
    }

    if let Some(lines) = value.get("content").and_then(Value::as_array) {
        return extract_post_text(lines);
    }

    String::new()
}

fn extract_post_text(lines: &[Value]) -> String {
    let mut text = String::new();
    for element in lines.iter().filter_map(Value::as_array).flatten() {
        match element.get("tag").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = element.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("at") => {
                if let Some(name) = element
                    .get("user_name")
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                {
                    text.push_str(&format!("@[{}]", name));
                }
            }
            _ => {}
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn receive_payload(chat_type: &str, message_type: &str, content: &str) -> Vec<u8> {
        json!({
            "schema": "2.0",
            "header": {
                "event_id": "ev-1",
                "event_type": "im.message.receive_v1",
                "token": "verify-me"
            },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_sender" } },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_1",
                    "chat_type": chat_type,
                    "message_type": message_type,
                    "content": content,
                    "mentions": [
                        { "key": "@_user_1", "id": { "open_id": "ou_bot" }, "name": "Helper" }
                    ]
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_url_verification() {
        let body = br#"{"type":"url_verification","challenge":"abc","token":"t"}"#;
        let callback = parse_callback(body, None).unwrap();
        assert_eq!(callback.token.as_deref(), Some("t"));
        match callback.event {
            InboundEvent::UrlVerification { challenge } => assert_eq!(challenge, "abc"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_text_message_with_bot_mention() {
        let body = receive_payload("group", "text", r#"{"text":"@_user_1  hello "}"#);
        let callback = parse_callback(&body, Some("ou_bot")).unwrap();
        assert_eq!(callback.token.as_deref(), Some("verify-me"));

        let InboundEvent::Message(msg) = callback.event else {
            panic!("expected a message event");
        };
        assert_eq!(msg.message_id, "om_1");
        assert_eq!(msg.chat_id, "oc_1");
        assert_eq!(msg.chat_kind, ChatKind::Group);
        assert_eq!(msg.sender_id, "ou_sender");
        assert_eq!(msg.kind, "text");
        assert_eq!(msg.content, r#"{"text":"@[Helper]  hello "}"#);
        assert_eq!(msg.text, "@[Helper]  hello");
        assert!(msg.mentions_bot);
    }

    #[test]
    fn test_mention_of_someone_else_is_not_bot_mention() {
        let body = receive_payload("p2p", "text", r#"{"text":"hi"}"#);
        let InboundEvent::Message(msg) = parse_callback(&body, Some("ou_other")).unwrap().event
        else {
            panic!("expected a message event");
        };
        assert!(!msg.mentions_bot);
        assert_eq!(msg.chat_kind, ChatKind::Direct);

        let InboundEvent::Message(msg) = parse_callback(&body, None).unwrap().event else {
            panic!("expected a message event");
        };
        assert!(!msg.mentions_bot);
    }

    #[test]
    fn test_post_text_extraction() {
        let content = json!({
            "title": "",
            "content": [
                [{ "tag": "text", "text": "hello " }, { "tag": "at", "user_name": "Ann" }],
                [{ "tag": "img", "image_key": "k" }, { "tag": "text", "text": " world" }]
            ]
        })
        .to_string();
        assert_eq!(extract_text(&content), "hello @[Ann] world");
    }

    #[test]
    fn test_extract_text_fallbacks() {
        assert_eq!(extract_text("not json"), "not json");
        assert_eq!(extract_text(r#"{"image_key":"img_1"}"#), "");
    }

    #[test]
    fn test_at_all_is_replaced() {
        assert_eq!(replace_mentions("@_all ping", &[]), "@[all] ping");
        assert_eq!(
            replace_mentions(r#"{"text":"@_all ping"}"#, &[]),
            r#"{"text":"@[all] ping"}"#
        );
    }

    fn mention(key: &str, name: &str) -> Mention {
        Mention {
            key: key.to_string(),
            id: None,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_quoted_mention_name_keeps_content_json() {
        let content = json!({ "text": "@_user_1 hello" }).to_string();
        let out = replace_mentions(&content, &[mention("@_user_1", r#"Ann "Bo" \ C"#)]);

        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["text"], r#"@[Ann "Bo" \ C] hello"#);
        assert_eq!(extract_text(&out), r#"@[Ann "Bo" \ C] hello"#);
    }

    #[test]
    fn test_mention_keys_match_whole_tokens() {
        let mentions: Vec<Mention> = (1..=10)
            .map(|n| mention(&format!("@_user_{n}"), &format!("N{n}")))
            .collect();
        let content = json!({ "text": "@_user_10 hi @_user_1" }).to_string();
        assert_eq!(extract_text(&replace_mentions(&content, &mentions)), "@[N10] hi @[N1]");

        // A key that only prefixes an unknown placeholder is left alone.
        let content = json!({ "text": "@_user_12 hi" }).to_string();
        assert_eq!(extract_text(&replace_mentions(&content, &mentions)), "@_user_12 hi");
    }

    #[test]
    fn test_post_mentions_are_replaced_in_text_elements() {
        let content = json!({
            "title": "@_user_1",
            "content": [[{ "tag": "text", "text": "ask @_user_1 now" }]]
        })
        .to_string();
        let out = replace_mentions(&content, &[mention("@_user_1", "Ann")]);
        assert_eq!(extract_text(&out), "ask @[Ann] now");
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["title"], "@_user_1");
    }

    #[test]
    fn test_recalled_event() {
        let body = json!({
            "schema": "2.0",
            "header": { "event_type": "im.message.recalled_v1" },
            "event": { "message_id": "om_9", "chat_id": "oc_3" }
        })
        .to_string();
        match parse_callback(body.as_bytes(), None).unwrap().event {
            InboundEvent::Recalled {
                message_id,
                chat_id,
            } => {
                assert_eq!(message_id, "om_9");
                assert_eq!(chat_id, "oc_3");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_is_ignored() {
        let body = json!({
            "schema": "2.0",
            "header": { "event_type": "im.chat.member.bot.added_v1" },
            "event": {}
        })
        .to_string();
        assert!(matches!(
            parse_callback(body.as_bytes(), None).unwrap().event,
            InboundEvent::Ignored { .. }
        ));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_callback(b"{", None).is_err());
        assert!(parse_callback(b"{}", None).is_err());
    }
}
