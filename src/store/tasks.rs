use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;

use super::{now_ts, parse_ts, Store};
use crate::scheduler::tasks::{RunRecorder, ScheduleEntry, TaskStore};

/// Editable fields of a scheduled task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub cron_expr: String,
    pub chat_id: String,
    #[serde(default = "default_msg_type")]
    pub msg_type: String,
    pub content: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_msg_type() -> String {
    "text".to_string()
}

fn default_enabled() -> bool {
    true
}

impl TaskDraft {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name must not be empty");
        }
        if self.chat_id.trim().is_empty() {
            anyhow::bail!("chat_id must not be empty");
        }
        if self.content.is_empty() {
            anyhow::bail!("content must not be empty");
        }
        Ok(())
    }

    /// The entry this draft describes once stored under `id`.
    pub fn to_entry(&self, id: i64) -> ScheduleEntry {
        ScheduleEntry {
            id,
            name: self.name.clone(),
            cron_expr: self.cron_expr.clone(),
            chat_id: self.chat_id.clone(),
            msg_type: self.msg_type.clone(),
            content: self.content.clone(),
            enabled: self.enabled,
            last_run_at: None,
        }
    }
}

const TASK_COLUMNS: &str = "id, name, cron_expr, chat_id, msg_type, content, enabled, last_run_at";

fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleEntry> {
    let last_run_at: Option<String> = row.get(7)?;
    Ok(ScheduleEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expr: row.get(2)?,
        chat_id: row.get(3)?,
        msg_type: row.get(4)?,
        content: row.get(5)?,
        enabled: row.get(6)?,
        last_run_at: last_run_at.as_deref().and_then(parse_ts),
    })
}

fn query_tasks(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ScheduleEntry>> {
    let sql = format!(
        "SELECT {} FROM scheduled_tasks {} ORDER BY id ASC",
        TASK_COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare task query")?;
    let tasks = stmt
        .query_map(params, map_task)
        .context("Failed to map rows")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to collect rows")?;
    Ok(tasks)
}

impl Store {
    pub async fn list_tasks(&self) -> Result<Vec<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        query_tasks(&conn, "", [])
    }

    pub async fn list_enabled_tasks(&self) -> Result<Vec<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        query_tasks(&conn, "WHERE enabled = 1", [])
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM scheduled_tasks WHERE id = ?1", TASK_COLUMNS);
        conn.query_row(&sql, rusqlite::params![id], map_task)
            .optional()
            .context("Failed to load task")
    }

    pub async fn create_task(&self, draft: &TaskDraft) -> Result<ScheduleEntry> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_tasks
             (name, cron_expr, chat_id, msg_type, content, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                draft.name,
                draft.cron_expr,
                draft.chat_id,
                draft.msg_type,
                draft.content,
                draft.enabled,
                now_ts(),
            ],
        )
        .context("Failed to insert scheduled task")?;
        Ok(draft.to_entry(conn.last_insert_rowid()))
    }

    /// Returns the stored entry, or `None` when no task has this id.
    pub async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<Option<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks
                 SET name = ?1, cron_expr = ?2, chat_id = ?3, msg_type = ?4, content = ?5,
                     enabled = ?6, updated_at = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    draft.name,
                    draft.cron_expr,
                    draft.chat_id,
                    draft.msg_type,
                    draft.content,
                    draft.enabled,
                    now_ts(),
                    id,
                ],
            )
            .context("Failed to update scheduled task")?;
        if changed == 0 {
            return Ok(None);
        }
        let sql = format!("SELECT {} FROM scheduled_tasks WHERE id = ?1", TASK_COLUMNS);
        conn.query_row(&sql, rusqlite::params![id], map_task)
            .optional()
            .context("Failed to reload scheduled task")
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", rusqlite::params![id])
            .context("Failed to delete scheduled task")?;
        Ok(changed > 0)
    }

    /// Flip `enabled` and return the updated entry.
    pub async fn toggle_task(&self, id: i64) -> Result<Option<ScheduleEntry>> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks SET enabled = NOT enabled, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now_ts(), id],
            )
            .context("Failed to toggle scheduled task")?;
        if changed == 0 {
            return Ok(None);
        }
        let sql = format!("SELECT {} FROM scheduled_tasks WHERE id = ?1", TASK_COLUMNS);
        conn.query_row(&sql, rusqlite::params![id], map_task)
            .optional()
            .context("Failed to reload scheduled task")
    }
}

#[async_trait]
impl TaskStore for Store {
    async fn list_enabled(&self) -> Result<Vec<ScheduleEntry>> {
        self.list_enabled_tasks().await
    }
}

#[async_trait]
impl RunRecorder for Store {
    async fn record_last_run(&self, task_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = now_ts();
        conn.execute(
            "UPDATE scheduled_tasks SET last_run_at = ?1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, task_id],
        )
        .context("Failed to update last_run_at")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_draft(name: &str) -> TaskDraft {
        TaskDraft {
            name: name.to_string(),
            cron_expr: "0 0 9 * * *".to_string(),
            chat_id: "oc_team".to_string(),
            msg_type: "text".to_string(),
            content: r#"{"text":"standup"}"#.to_string(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_create_and_list_enabled() {
        let store = Store::open_in_memory().unwrap();
        let first = store.create_task(&make_draft("standup")).await.unwrap();
        let mut paused = make_draft("retro");
        paused.enabled = false;
        store.create_task(&paused).await.unwrap();

        let enabled = TaskStore::list_enabled(&store).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0], first);
        assert_eq!(store.list_tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_toggle_and_update_return_entry() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task(&make_draft("standup")).await.unwrap();

        let toggled = store.toggle_task(task.id).await.unwrap().unwrap();
        assert!(!toggled.enabled);

        let mut draft = make_draft("standup v2");
        draft.cron_expr = "0 30 9 * * 1-5".to_string();
        let updated = store.update_task(task.id, &draft).await.unwrap().unwrap();
        assert_eq!(updated.name, "standup v2");
        assert_eq!(updated.cron_expr, "0 30 9 * * 1-5");
        assert!(updated.enabled);

        assert!(store.toggle_task(404).await.unwrap().is_none());
        assert!(store.update_task(404, &draft).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_last_run() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task(&make_draft("standup")).await.unwrap();
        assert!(task.last_run_at.is_none());

        store.record_last_run(task.id).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task(&make_draft("standup")).await.unwrap();
        assert!(store.delete_task(task.id).await.unwrap());
        assert!(!store.delete_task(task.id).await.unwrap());
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }

    #[test]
    fn test_draft_validation() {
        let draft: TaskDraft = serde_json::from_str(
            r#"{"name":"n","cron_expr":"0 * * * * *","chat_id":"oc_1","content":"{}"}"#,
        )
        .unwrap();
        assert_eq!(draft.msg_type, "text");
        assert!(draft.enabled);
        assert!(draft.validate().is_ok());

        let mut missing_chat = draft.clone();
        missing_chat.chat_id = " ".to_string();
        assert!(missing_chat.validate().is_err());
    }
}
