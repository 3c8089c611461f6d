use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use super::Scheduler;
use crate::config::SchedulerConfig;
use crate::store::Store;

/// A user-defined recurring broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub name: String,
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub cron_expr: String,
    pub chat_id: String,
    pub msg_type: String,
    pub content: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Durable task definitions, read at startup to rebuild the scheduler.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<ScheduleEntry>>;
}

/// Bookkeeping hook invoked after a successful scheduled send.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record_last_run(&self, task_id: i64) -> Result<()>;
}

/// Register the fixed housekeeping jobs: daily pruning of old group-chat logs.
pub async fn register_builtin_tasks(
    scheduler: &Scheduler,
    store: Store,
    config: &SchedulerConfig,
) -> Result<()> {
    let retention_days = config.log_retention_days;
    scheduler
        .add_maintenance_job(&config.cleanup_cron, "log cleanup", move || {
            let store = store.clone();
            Box::pin(async move {
                if let Err(e) = prune_group_logs(&store, retention_days).await {
                    error!("Log cleanup failed: {:#}", e);
                }
            })
        })
        .await
}

/// Delete group-chat logs older than `retention_days`. Direct-chat history is kept.
pub async fn prune_group_logs(store: &Store, retention_days: i64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let deleted = store.delete_group_logs_before(cutoff).await?;
    info!(
        "Log cleanup removed {} group messages older than {} days",
        deleted, retention_days
    );
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Direction;
    use crate::platform::ChatKind;
    use crate::store::logs::MessageLog;
    use crate::testing::{RecordingRecorder, RecordingSender};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_builtin_tasks_reject_bad_cron() {
        let scheduler = Scheduler::new(
            Arc::new(RecordingSender::default()),
            Arc::new(RecordingRecorder::default()),
        )
        .await
        .unwrap();
        let store = Store::open_in_memory().unwrap();

        let mut config = SchedulerConfig::default();
        register_builtin_tasks(&scheduler, store.clone(), &config)
            .await
            .unwrap();
        // Maintenance jobs are not addressable as user tasks.
        assert!(scheduler.registered_ids().await.is_empty());

        config.cleanup_cron = "daily".to_string();
        assert!(register_builtin_tasks(&scheduler, store, &config).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_logs() {
        let store = Store::open_in_memory().unwrap();
        store
            .log_message(&MessageLog {
                message_id: "om_1".to_string(),
                chat_id: "oc_g".to_string(),
                chat_type: Some(ChatKind::Group),
                sender_id: "ou_1".to_string(),
                sender_name: "Alice".to_string(),
                direction: Direction::In,
                msg_type: "text".to_string(),
                content: "{}".to_string(),
                handled_by: String::new(),
                source: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(prune_group_logs(&store, 7).await.unwrap(), 0);
        assert_eq!(store.recent_logs(None, 10).await.unwrap().len(), 1);
    }
}
