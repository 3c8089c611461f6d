use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;

use super::{now_ts, Store};
use crate::handler::keyword::{KeywordRule, MatchMode, RuleStore, TriggerMode};

/// Editable fields of an auto-reply rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDraft {
    pub keyword: String,
    pub reply_text: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    pub fn validate(&self) -> Result<()> {
        if self.keyword.trim().is_empty() {
            anyhow::bail!("keyword must not be empty");
        }
        if self.reply_text.is_empty() {
            anyhow::bail!("reply_text must not be empty");
        }
        Ok(())
    }
}

const RULE_COLUMNS: &str =
    "id, keyword, reply_text, match_mode, chat_id, trigger_mode, enabled";

fn map_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeywordRule> {
    let match_mode: String = row.get(3)?;
    let trigger_mode: String = row.get(5)?;
    Ok(KeywordRule {
        id: row.get(0)?,
        keyword: row.get(1)?,
        reply_text: row.get(2)?,
        match_mode: MatchMode::parse(&match_mode),
        chat_id: row.get(4)?,
        trigger_mode: TriggerMode::parse(&trigger_mode),
        enabled: row.get(6)?,
    })
}

fn query_rules(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<KeywordRule>> {
    let sql = format!(
        "SELECT {} FROM auto_reply_rules {} ORDER BY id ASC",
        RULE_COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare rule query")?;
    let rules = stmt
        .query_map(params, map_rule)
        .context("Failed to query rules")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to collect rules")?;
    Ok(rules)
}

impl Store {
    pub async fn list_rules(&self) -> Result<Vec<KeywordRule>> {
        let conn = self.conn.lock().await;
        query_rules(&conn, "", [])
    }

    pub async fn list_enabled_rules(&self) -> Result<Vec<KeywordRule>> {
        let conn = self.conn.lock().await;
        query_rules(&conn, "WHERE enabled = 1", [])
    }

    pub async fn get_rule(&self, id: i64) -> Result<Option<KeywordRule>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM auto_reply_rules WHERE id = ?1", RULE_COLUMNS);
        conn.query_row(&sql, rusqlite::params![id], map_rule)
            .optional()
            .context("Failed to load rule")
    }

    pub async fn create_rule(&self, draft: &RuleDraft) -> Result<KeywordRule> {
        let conn = self.conn.lock().await;
        let now = now_ts();
        conn.execute(
            "INSERT INTO auto_reply_rules
             (keyword, reply_text, match_mode, chat_id, trigger_mode, enabled,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                draft.keyword,
                draft.reply_text,
                draft.match_mode.as_str(),
                draft.chat_id,
                draft.trigger_mode.as_str(),
                draft.enabled,
                now,
            ],
        )
        .context("Failed to insert rule")?;

        Ok(KeywordRule {
            id: conn.last_insert_rowid(),
            keyword: draft.keyword.clone(),
            reply_text: draft.reply_text.clone(),
            match_mode: draft.match_mode,
            chat_id: draft.chat_id.clone(),
            trigger_mode: draft.trigger_mode,
            enabled: draft.enabled,
        })
    }

    /// Returns false when no rule has this id.
    pub async fn update_rule(&self, id: i64, draft: &RuleDraft) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE auto_reply_rules
                 SET keyword = ?1, reply_text = ?2, match_mode = ?3, chat_id = ?4,
                     trigger_mode = ?5, enabled = ?6, updated_at = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    draft.keyword,
                    draft.reply_text,
                    draft.match_mode.as_str(),
                    draft.chat_id,
                    draft.trigger_mode.as_str(),
                    draft.enabled,
                    now_ts(),
                    id,
                ],
            )
            .context("Failed to update rule")?;
        Ok(changed > 0)
    }

    pub async fn delete_rule(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM auto_reply_rules WHERE id = ?1",
                rusqlite::params![id],
            )
            .context("Failed to delete rule")?;
        Ok(changed > 0)
    }

    pub async fn toggle_rule(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE auto_reply_rules SET enabled = NOT enabled, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now_ts(), id],
            )
            .context("Failed to toggle rule")?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl RuleStore for Store {
    async fn list_enabled(&self) -> Result<Vec<KeywordRule>> {
        self.list_enabled_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(keyword: &str) -> RuleDraft {
        RuleDraft {
            keyword: keyword.to_string(),
            reply_text: format!("reply to {}", keyword),
            match_mode: MatchMode::Exact,
            chat_id: String::new(),
            trigger_mode: TriggerMode::AtBot,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_create_and_list_in_id_order() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_rule(&draft("alpha")).await.unwrap();
        let b = store.create_rule(&draft("beta")).await.unwrap();
        assert!(a.id < b.id);

        let rules = store.list_enabled().await.unwrap();
        assert_eq!(
            rules.iter().map(|r| r.keyword.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
        assert_eq!(rules[0].match_mode, MatchMode::Exact);
        assert_eq!(rules[0].trigger_mode, TriggerMode::AtBot);
    }

    #[tokio::test]
    async fn test_toggle_hides_from_enabled_list() {
        let store = Store::open_in_memory().unwrap();
        let rule = store.create_rule(&draft("alpha")).await.unwrap();

        assert!(store.toggle_rule(rule.id).await.unwrap());
        assert!(store.list_enabled().await.unwrap().is_empty());
        assert_eq!(store.list_rules().await.unwrap().len(), 1);
        assert!(!store.get_rule(rule.id).await.unwrap().unwrap().enabled);

        assert!(!store.toggle_rule(999).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = Store::open_in_memory().unwrap();
        let rule = store.create_rule(&draft("alpha")).await.unwrap();

        let mut changed = draft("gamma");
        changed.match_mode = MatchMode::Prefix;
        assert!(store.update_rule(rule.id, &changed).await.unwrap());
        let loaded = store.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.keyword, "gamma");
        assert_eq!(loaded.match_mode, MatchMode::Prefix);

        assert!(store.delete_rule(rule.id).await.unwrap());
        assert!(!store.delete_rule(rule.id).await.unwrap());
        assert!(store.get_rule(rule.id).await.unwrap().is_none());
    }

    #[test]
    fn test_draft_defaults_and_validation() {
        let draft: RuleDraft =
            serde_json::from_str(r#"{"keyword":"hi","reply_text":"hello"}"#).unwrap();
        assert!(draft.enabled);
        assert_eq!(draft.match_mode, MatchMode::Contains);
        assert_eq!(draft.trigger_mode, TriggerMode::Any);
        assert!(draft.validate().is_ok());

        let blank: RuleDraft =
            serde_json::from_str(r#"{"keyword":"  ","reply_text":"hello"}"#).unwrap();
        assert!(blank.validate().is_err());
    }
}
