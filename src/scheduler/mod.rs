pub mod tasks;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::platform::MessageSender;
use tasks::{RunRecorder, ScheduleEntry};

/// A scheduled send that has not completed within this window is abandoned.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub const SOURCE_SCHEDULED: &str = "scheduled";
pub const SOURCE_MANUAL: &str = "manual";

/// Everything a cron firing needs, captured once at registration.
#[derive(Debug)]
struct TaskContext {
    task_id: i64,
    name: String,
    chat_id: String,
    msg_type: String,
    content: String,
}

impl From<&ScheduleEntry> for TaskContext {
    fn from(entry: &ScheduleEntry) -> Self {
        Self {
            task_id: entry.id,
            name: entry.name.clone(),
            chat_id: entry.chat_id.clone(),
            msg_type: entry.msg_type.clone(),
            content: entry.content.clone(),
        }
    }
}

struct Registration {
    job_id: Uuid,
    context: Arc<TaskContext>,
}

/// The send-then-record sequence shared by cron firings and manual runs.
struct Dispatcher {
    sender: Arc<dyn MessageSender>,
    recorder: Arc<dyn RunRecorder>,
    send_timeout: Duration,
}

impl Dispatcher {
    async fn execute(&self, ctx: &TaskContext, source: &str) -> Result<String> {
        let send = self
            .sender
            .send(&ctx.chat_id, &ctx.msg_type, &ctx.content, source);
        let message_id = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(message_id)) => message_id,
            Ok(Err(e)) => {
                error!("Scheduled task {} send failed: {:#}", ctx.task_id, e);
                return Err(e).with_context(|| format!("Task {} send failed", ctx.task_id));
            }
            Err(_) => {
                error!(
                    "Scheduled task {} send timed out after {:?}",
                    ctx.task_id, self.send_timeout
                );
                anyhow::bail!("Task {} send timed out", ctx.task_id);
            }
        };

        if let Err(e) = self.recorder.record_last_run(ctx.task_id).await {
            warn!("Failed to update last run for task {}: {:#}", ctx.task_id, e);
        }
        info!(
            "Scheduled task executed: id={}, name={}, source={}",
            ctx.task_id, ctx.name, source
        );
        Ok(message_id)
    }
}

/// Wrapper around tokio-cron-scheduler that keeps user tasks addressable by id.
pub struct Scheduler {
    inner: JobScheduler,
    dispatcher: Arc<Dispatcher>,
    registrations: Mutex<HashMap<i64, Registration>>,
    running: AtomicBool,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new(
        sender: Arc<dyn MessageSender>,
        recorder: Arc<dyn RunRecorder>,
    ) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self {
            inner,
            dispatcher: Arc::new(Dispatcher {
                sender,
                recorder,
                send_timeout: DEFAULT_SEND_TIMEOUT,
            }),
            registrations: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Override the per-send deadline. Only meaningful before any task is added.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        if let Some(dispatcher) = Arc::get_mut(&mut self.dispatcher) {
            dispatcher.send_timeout = timeout;
        }
        self
    }

    /// Check that `cron_expr` parses, without registering anything.
    pub fn validate_cron(cron_expr: &str) -> Result<()> {
        Job::new_async(cron_expr, |_uuid, _lock| Box::pin(async {}))
            .with_context(|| format!("Invalid cron expression '{}'", cron_expr))?;
        Ok(())
    }

    /// Register a cron firing for `entry`. An invalid expression leaves nothing registered.
    ///
    /// Adding an id that is already registered replaces the old registration.
    pub async fn add_task(&self, entry: &ScheduleEntry) -> Result<()> {
        let context = Arc::new(TaskContext::from(entry));
        let dispatcher = Arc::clone(&self.dispatcher);
        let job_context = Arc::clone(&context);

        let job = Job::new_async(entry.cron_expr.as_str(), move |_uuid, _lock| {
            let dispatcher = Arc::clone(&dispatcher);
            let ctx = Arc::clone(&job_context);
            Box::pin(async move {
                // Failures are already logged; the next firing is the retry.
                let _ = dispatcher.execute(&ctx, SOURCE_SCHEDULED).await;
            })
        })
        .with_context(|| {
            format!(
                "Invalid cron expression '{}' for task {}",
                entry.cron_expr, entry.id
            )
        })?;

        let job_id = self
            .inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job for task {}", entry.id))?;

        let previous = self
            .registrations
            .lock()
            .await
            .insert(entry.id, Registration { job_id, context });
        if let Some(previous) = previous {
            warn!("Task {} was already scheduled; replacing it", entry.id);
            if let Err(e) = self.inner.remove(&previous.job_id).await {
                warn!("Failed to remove replaced job for task {}: {:?}", entry.id, e);
            }
        }

        info!(
            "Scheduled task '{}' (id={}) with cron: {}",
            entry.name, entry.id, entry.cron_expr
        );
        Ok(())
    }

    /// Unregister a task. Unknown ids are a no-op.
    pub async fn remove_task(&self, task_id: i64) -> Result<()> {
        let removed = self.registrations.lock().await.remove(&task_id);
        let Some(registration) = removed else {
            return Ok(());
        };
        self.inner
            .remove(&registration.job_id)
            .await
            .with_context(|| format!("Failed to remove job for task {}", task_id))?;
        info!(
            "Unscheduled task '{}' (id={})",
            registration.context.name, task_id
        );
        Ok(())
    }

    /// Remove, then re-add only if the entry is enabled.
    pub async fn reload_task(&self, entry: &ScheduleEntry) -> Result<()> {
        self.remove_task(entry.id).await?;
        if entry.enabled {
            self.add_task(entry).await?;
        }
        Ok(())
    }

    /// Send `entry` now, outside the cron clock. Nothing is registered.
    pub async fn run_task_now(&self, entry: &ScheduleEntry) -> Result<String> {
        let context = TaskContext::from(entry);
        self.dispatcher.execute(&context, SOURCE_MANUAL).await
    }

    /// Register a fixed housekeeping job. It is not addressable by task id.
    pub async fn add_maintenance_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                info!("Running maintenance job: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Maintenance job '{}' scheduled with cron: {}", name, cron_expr);
        Ok(())
    }

    /// Start the scheduler. Repeated calls are no-ops.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.inner.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e).context("Failed to start scheduler");
        }
        info!("Scheduler started");
        Ok(())
    }

    /// Stop the scheduler. Repeated calls are no-ops.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.clone();
        inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
impl Scheduler {
    pub async fn is_registered(&self, task_id: i64) -> bool {
        self.registrations.lock().await.contains_key(&task_id)
    }

    pub async fn registered_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.registrations.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingRecorder, RecordingSender};

    fn entry(id: i64, cron_expr: &str) -> ScheduleEntry {
        ScheduleEntry {
            id,
            name: format!("task-{}", id),
            cron_expr: cron_expr.to_string(),
            chat_id: "oc_team".to_string(),
            msg_type: "text".to_string(),
            content: r#"{"text":"standup"}"#.to_string(),
            enabled: true,
            last_run_at: None,
        }
    }

    async fn scheduler() -> (Scheduler, Arc<RecordingSender>, Arc<RecordingRecorder>) {
        let sender = Arc::new(RecordingSender::default());
        let recorder = Arc::new(RecordingRecorder::default());
        let scheduler = Scheduler::new(sender.clone(), recorder.clone())
            .await
            .unwrap();
        (scheduler, sender, recorder)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_cron_is_rejected() {
        let (scheduler, _, _) = scheduler().await;
        assert!(scheduler.add_task(&entry(1, "not-a-cron")).await.is_err());
        assert!(!scheduler.is_registered(1).await);
        assert!(scheduler.registered_ids().await.is_empty());
    }

    #[test]
    fn test_validate_cron() {
        assert!(Scheduler::validate_cron("0 30 9 * * 1-5").is_ok());
        assert!(Scheduler::validate_cron("not-a-cron").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_remove_and_reload() {
        let (scheduler, _, _) = scheduler().await;
        scheduler.add_task(&entry(1, "0 0 9 * * *")).await.unwrap();
        scheduler.add_task(&entry(2, "0 0 18 * * *")).await.unwrap();
        assert_eq!(scheduler.registered_ids().await, vec![1, 2]);

        let mut disabled = entry(1, "0 0 9 * * *");
        disabled.enabled = false;
        scheduler.reload_task(&disabled).await.unwrap();
        assert_eq!(scheduler.registered_ids().await, vec![2]);

        scheduler.remove_task(2).await.unwrap();
        scheduler.remove_task(2).await.unwrap();
        scheduler.remove_task(99).await.unwrap();
        assert!(scheduler.registered_ids().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_adds_keep_one_registration_per_id() {
        let scheduler = Arc::new(scheduler().await.0);
        let mut handles = Vec::new();
        for n in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler.add_task(&entry(1, &format!("{} 0 9 * * *", n))).await?;
                scheduler.add_task(&entry(10 + n, "0 0 9 * * *")).await
            }));
        }
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let mut expected = vec![1];
        expected.extend(10..18);
        assert_eq!(scheduler.registered_ids().await, expected);

        scheduler.remove_task(1).await.unwrap();
        assert!(!scheduler.is_registered(1).await);
        assert_eq!(scheduler.registered_ids().await.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reload_with_bad_cron_leaves_task_unscheduled() {
        let (scheduler, _, _) = scheduler().await;
        scheduler.add_task(&entry(1, "0 0 9 * * *")).await.unwrap();
        assert!(scheduler.reload_task(&entry(1, "every day")).await.is_err());
        assert!(!scheduler.is_registered(1).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_now_sends_and_records() {
        let (scheduler, sender, recorder) = scheduler().await;
        let message_id = scheduler.run_task_now(&entry(7, "0 0 9 * * *")).await.unwrap();

        assert_eq!(message_id, "om_sent_1");
        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "oc_team");
        assert_eq!(sent[0].source, SOURCE_MANUAL);
        assert_eq!(recorder.runs(), vec![7]);
        assert!(!scheduler.is_registered(7).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_send_skips_bookkeeping() {
        let (scheduler, sender, recorder) = scheduler().await;
        sender.fail_next_sends(true);

        assert!(scheduler.run_task_now(&entry(7, "0 0 9 * * *")).await.is_err());
        assert!(recorder.runs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_send_times_out() {
        let sender = Arc::new(RecordingSender::with_delay(Duration::from_millis(500)));
        let recorder = Arc::new(RecordingRecorder::default());
        let scheduler = Scheduler::new(sender.clone(), recorder.clone())
            .await
            .unwrap()
            .with_send_timeout(Duration::from_millis(50));

        let err = scheduler
            .run_task_now(&entry(3, "0 0 9 * * *"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(recorder.runs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cron_firing_sends_with_scheduled_source() {
        let (scheduler, sender, recorder) = scheduler().await;
        scheduler.add_task(&entry(5, "* * * * * *")).await.unwrap();
        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();

        let sent = sender.sent();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|m| m.source == SOURCE_SCHEDULED));
        assert!(recorder.runs().iter().all(|id| *id == 5));
    }
}
