//! Admin operations: every mutation of rules or tasks is persisted first and then
//! pushed into the live engine or scheduler, so changes apply without a restart.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::handler::keyword::{KeywordEngine, KeywordRule, RuleStore};
use crate::identity::{IdentityResolver, SyncResult};
use crate::platform::MessageSender;
use crate::scheduler::tasks::{ScheduleEntry, TaskStore};
use crate::scheduler::{Scheduler, SOURCE_MANUAL};
use crate::store::rules::RuleDraft;
use crate::store::tasks::TaskDraft;
use crate::store::users::UserRecord;
use crate::store::Store;

/// The addressed record does not exist.
#[derive(Debug, thiserror::Error)]
#[error("{kind} {id} not found")]
pub struct NotFound {
    pub kind: &'static str,
    pub id: String,
}

/// The request was rejected before anything was stored.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidInput(pub String);

fn invalid(e: anyhow::Error) -> anyhow::Error {
    InvalidInput(format!("{:#}", e)).into()
}

fn not_found(kind: &'static str, id: impl ToString) -> anyhow::Error {
    NotFound {
        kind,
        id: id.to_string(),
    }
    .into()
}

pub struct Admin {
    store: Store,
    engine: Arc<KeywordEngine>,
    scheduler: Arc<Scheduler>,
    resolver: IdentityResolver,
    /// Manual sends use the same outbound path as replies and scheduled tasks.
    sender: Arc<dyn MessageSender>,
}

impl Admin {
    pub fn new(
        store: Store,
        engine: Arc<KeywordEngine>,
        scheduler: Arc<Scheduler>,
        resolver: IdentityResolver,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            store,
            engine,
            scheduler,
            resolver,
            sender,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // --- rules ---

    /// Replace the engine's snapshot with the stored enabled rules.
    pub async fn reload_rules(&self) -> Result<usize> {
        let rules = RuleStore::list_enabled(&self.store).await?;
        let count = rules.len();
        self.engine.update_rules(rules);
        info!("Reloaded {} keyword rules", count);
        Ok(count)
    }

    pub async fn list_rules(&self) -> Result<Vec<KeywordRule>> {
        self.store.list_rules().await
    }

    pub async fn get_rule(&self, id: i64) -> Result<KeywordRule> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| not_found("rule", id))
    }

    pub async fn create_rule(&self, draft: &RuleDraft) -> Result<KeywordRule> {
        draft.validate().map_err(invalid)?;
        let rule = self.store.create_rule(draft).await?;
        self.reload_rules().await?;
        Ok(rule)
    }

    pub async fn update_rule(&self, id: i64, draft: &RuleDraft) -> Result<()> {
        draft.validate().map_err(invalid)?;
        if !self.store.update_rule(id, draft).await? {
            return Err(not_found("rule", id));
        }
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        if !self.store.delete_rule(id).await? {
            return Err(not_found("rule", id));
        }
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn toggle_rule(&self, id: i64) -> Result<()> {
        if !self.store.toggle_rule(id).await? {
            return Err(not_found("rule", id));
        }
        self.reload_rules().await?;
        Ok(())
    }

    // --- scheduled tasks ---

    /// Register every enabled stored task. Entries that fail to register are skipped.
    pub async fn load_tasks(&self) -> Result<usize> {
        let entries = TaskStore::list_enabled(&self.store).await?;
        let mut loaded = 0;
        for entry in &entries {
            match self.scheduler.add_task(entry).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping scheduled task {}: {:#}", entry.id, e),
            }
        }
        info!("Loaded {} of {} scheduled tasks", loaded, entries.len());
        Ok(loaded)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduleEntry>> {
        self.store.list_tasks().await
    }

    pub async fn get_task(&self, id: i64) -> Result<ScheduleEntry> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| not_found("task", id))
    }

    fn check_task(draft: &TaskDraft) -> Result<()> {
        draft.validate().map_err(invalid)?;
        Scheduler::validate_cron(&draft.cron_expr).map_err(invalid)
    }

    pub async fn create_task(&self, draft: &TaskDraft) -> Result<ScheduleEntry> {
        Self::check_task(draft)?;
        let entry = self.store.create_task(draft).await?;
        if entry.enabled {
            self.scheduler.add_task(&entry).await?;
        }
        Ok(entry)
    }

    pub async fn update_task(&self, id: i64, draft: &TaskDraft) -> Result<ScheduleEntry> {
        Self::check_task(draft)?;
        let entry = self
            .store
            .update_task(id, draft)
            .await?
            .ok_or_else(|| not_found("task", id))?;
        self.scheduler.reload_task(&entry).await?;
        Ok(entry)
    }

    pub async fn delete_task(&self, id: i64) -> Result<()> {
        self.scheduler.remove_task(id).await?;
        if !self.store.delete_task(id).await? {
            return Err(not_found("task", id));
        }
        Ok(())
    }

    pub async fn toggle_task(&self, id: i64) -> Result<ScheduleEntry> {
        let entry = self
            .store
            .toggle_task(id)
            .await?
            .ok_or_else(|| not_found("task", id))?;
        self.scheduler.reload_task(&entry).await?;
        Ok(entry)
    }

    /// Send a task's message immediately. Returns the platform message id.
    pub async fn run_task(&self, id: i64) -> Result<String> {
        let entry = self.get_task(id).await?;
        self.scheduler.run_task_now(&entry).await
    }

    // --- messages ---

    /// Send an ad-hoc message. Returns the platform message id.
    pub async fn send_message(
        &self,
        chat_id: &str,
        msg_type: &str,
        content: &str,
    ) -> Result<String> {
        check_send(chat_id, content).map_err(invalid)?;
        let msg_type = if msg_type.is_empty() { "text" } else { msg_type };
        let message_id = self
            .sender
            .send(chat_id, msg_type, content, SOURCE_MANUAL)
            .await?;
        info!("Manual message {} sent to {}", message_id, chat_id);
        Ok(message_id)
    }

    // --- users ---

    pub async fn sync_users(&self, open_ids: Vec<String>, force: bool) -> Result<SyncResult> {
        self.resolver.sync_by_ids(open_ids, force).await
    }

    pub async fn sync_all_users(&self) -> Result<SyncResult> {
        self.resolver.sync_all().await
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.store.list_users().await
    }

    pub async fn get_user(&self, open_id: &str) -> Result<UserRecord> {
        self.store
            .get_user(open_id)
            .await?
            .ok_or_else(|| not_found("user", open_id))
    }
}

fn check_send(chat_id: &str, content: &str) -> Result<()> {
    if chat_id.trim().is_empty() {
        bail!("chat_id is required");
    }
    if content.trim().is_empty() {
        bail!("content is required");
    }
    Ok(())
}
