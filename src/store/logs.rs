use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;

use super::{format_ts, now_ts, parse_ts, Store};
use crate::broadcast::Direction;
use crate::platform::ChatKind;

/// One row of the message history.
#[derive(Debug, Clone, Serialize)]
pub struct MessageLog {
    pub message_id: String,
    pub chat_id: String,
    pub chat_type: Option<ChatKind>,
    pub sender_id: String,
    pub sender_name: String,
    pub direction: Direction,
    pub msg_type: String,
    pub content: String,
    /// Name of the handler that claimed an inbound message.
    pub handled_by: String,
    /// What produced an outbound message: `event`, `scheduled` or `manual`.
    pub source: String,
}

/// A stored log row as returned by history queries.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedMessage {
    pub id: i64,
    #[serde(flatten)]
    pub log: MessageLog,
    pub recalled: bool,
    pub created_at: DateTime<Utc>,
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "in",
        Direction::Out => "out",
    }
}

fn map_logged(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoggedMessage> {
    let chat_type: String = row.get(3)?;
    let direction: String = row.get(6)?;
    let created_at: String = row.get(12)?;
    Ok(LoggedMessage {
        id: row.get(0)?,
        log: MessageLog {
            message_id: row.get(1)?,
            chat_id: row.get(2)?,
            chat_type: (!chat_type.is_empty()).then(|| ChatKind::from_wire(&chat_type)),
            sender_id: row.get(4)?,
            sender_name: row.get(5)?,
            direction: if direction == "out" {
                Direction::Out
            } else {
                Direction::In
            },
            msg_type: row.get(7)?,
            content: row.get(8)?,
            handled_by: row.get(9)?,
            source: row.get(10)?,
        },
        recalled: row.get(11)?,
        created_at: parse_ts(&created_at).unwrap_or_default(),
    })
}

impl Store {
    pub async fn log_message(&self, log: &MessageLog) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO message_logs
             (message_id, chat_id, chat_type, sender_id, sender_name, direction, msg_type,
              content, handled_by, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                log.message_id,
                log.chat_id,
                log.chat_type.map(|kind| kind.as_str()).unwrap_or_default(),
                log.sender_id,
                log.sender_name,
                direction_str(log.direction),
                log.msg_type,
                log.content,
                log.handled_by,
                log.source,
                now_ts(),
            ],
        )
        .context("Failed to insert message log")?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent logs first, optionally restricted to one chat.
    pub async fn recent_logs(
        &self,
        chat_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LoggedMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, message_id, chat_id, chat_type, sender_id, sender_name, direction,
                        msg_type, content, handled_by, source, recalled, created_at
                 FROM message_logs
                 WHERE ?1 IS NULL OR chat_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare message log query")?;
        let logs = stmt
            .query_map(rusqlite::params![chat_id, limit as i64], map_logged)
            .context("Failed to query message logs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect message logs")?;
        Ok(logs)
    }

    /// Chat kind recorded by the most recent log of this chat that carried one.
    pub async fn chat_type_of(&self, chat_id: &str) -> Result<Option<ChatKind>> {
        let conn = self.conn.lock().await;
        let kind: Option<String> = conn
            .query_row(
                "SELECT chat_type FROM message_logs
                 WHERE chat_id = ?1 AND chat_type != ''
                 ORDER BY id DESC LIMIT 1",
                rusqlite::params![chat_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up chat type")?;
        Ok(kind.as_deref().map(ChatKind::from_wire))
    }

    /// Mark every log of `message_id` as recalled. Returns the number of rows touched.
    pub async fn recall(&self, message_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE message_logs SET recalled = 1 WHERE message_id = ?1",
            rusqlite::params![message_id],
        )
        .context("Failed to mark message recalled")
    }

    /// Delete group-chat logs created before `cutoff`; direct-chat history is kept.
    pub async fn delete_group_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM message_logs WHERE chat_type = ?1 AND created_at < ?2",
            rusqlite::params![ChatKind::Group.as_str(), format_ts(cutoff)],
        )
        .context("Failed to delete old message logs")
    }
}
