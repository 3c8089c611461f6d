//! Sender identity resolution: memory cache, then the persistent store, then the
//! remote contact API. Also hosts the batch refresh used by admin "sync users".

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;

/// Display name used when there is no sender id at all.
const UNKNOWN_NAME: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub open_id: String,
    pub union_id: String,
    pub user_id: String,
    pub name: String,
    pub en_name: String,
    pub avatar: String,
    pub description: String,
    pub email: String,
    pub city: String,
    pub job_title: String,
    pub work_station: String,
    pub employee_no: String,
    pub gender: i32,
    pub leader_user_id: String,
    pub department_ids: Vec<String>,
    pub department_names: Vec<String>,
    pub join_time: i64,
}

impl IdentityProfile {
    /// Best-effort profile for an id we could not resolve: the id doubles as the name.
    pub fn unresolved(open_id: &str) -> Self {
        Self {
            open_id: open_id.to_string(),
            name: open_id.to_string(),
            ..Default::default()
        }
    }
}

/// A profile as persisted, with the time it was last written.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub profile: IdentityProfile,
    pub updated_at: DateTime<Utc>,
}

/// Persistence tier.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, open_id: &str) -> Result<Option<StoredIdentity>>;
    /// Insert or update; first-seen time and message count survive updates.
    async fn upsert(&self, profile: &IdentityProfile) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<String>>;
    async fn increment_msg_count(&self, open_id: &str) -> Result<()>;
}

/// Remote tier (the platform contact API).
#[async_trait]
pub trait RemoteIdentityApi: Send + Sync {
    async fn fetch(&self, open_id: &str) -> Result<IdentityProfile>;
}

/// Process-local profile cache. Entries never expire; they are only overwritten.
#[derive(Clone, Default)]
pub struct IdentityCache {
    entries: Arc<RwLock<HashMap<String, IdentityProfile>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, open_id: &str) -> Option<IdentityProfile> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(open_id)
            .cloned()
    }

    pub fn insert(&self, profile: IdentityProfile) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.open_id.clone(), profile);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Outcome of [`IdentityResolver::resolve`].
#[derive(Debug)]
pub enum Resolution {
    Resolved(IdentityProfile),
    /// The remote lookup failed. The profile is usable (id as name) but unresolved.
    Degraded {
        profile: IdentityProfile,
        error: Error,
    },
}

impl Resolution {
    #[cfg(test)]
    pub fn profile(&self) -> &IdentityProfile {
        match self {
            Resolution::Resolved(profile) => profile,
            Resolution::Degraded { profile, .. } => profile,
        }
    }

    pub fn into_profile(self) -> IdentityProfile {
        match self {
            Resolution::Resolved(profile) => profile,
            Resolution::Degraded { profile, .. } => profile,
        }
    }
}

/// Outcome of refreshing a single identity.
#[derive(Debug)]
pub enum SyncOutcome {
    Synced,
    /// Stored record is still inside the cooldown window.
    Skipped,
}

/// Aggregated counts of a batch refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub total: usize,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub workers: usize,
    pub cooldown: Duration,
    pub retry_backoff: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            cooldown: Duration::from_secs(3600),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&IdentityConfig> for SyncOptions {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            cooldown: config.cooldown(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    cache: IdentityCache,
    store: Arc<dyn IdentityStore>,
    remote: Arc<dyn RemoteIdentityApi>,
    options: SyncOptions,
}

impl IdentityResolver {
    pub fn new(
        cache: IdentityCache,
        store: Arc<dyn IdentityStore>,
        remote: Arc<dyn RemoteIdentityApi>,
        options: SyncOptions,
    ) -> Self {
        Self {
            cache,
            store,
            remote,
            options,
        }
    }

    /// Resolve a sender id to a profile: memory cache, then store, then remote API.
    pub async fn resolve(&self, open_id: &str) -> Resolution {
        if open_id.is_empty() {
            return Resolution::Resolved(IdentityProfile {
                name: UNKNOWN_NAME.to_string(),
                ..Default::default()
            });
        }

        if let Some(profile) = self.cache.get(open_id) {
            return Resolution::Resolved(profile);
        }

        match self.store.get(open_id).await {
            Ok(Some(stored)) if !stored.profile.name.is_empty() => {
                self.cache.insert(stored.profile.clone());
                return Resolution::Resolved(stored.profile);
            }
            Ok(_) => {}
            Err(e) => debug!("Identity store lookup failed for {}: {:#}", open_id, e),
        }

        match self.remote.fetch(open_id).await {
            Ok(profile) => {
                if let Err(e) = self.store.upsert(&profile).await {
                    warn!("Failed to persist identity {}: {:#}", open_id, e);
                }
                self.cache.insert(profile.clone());
                Resolution::Resolved(profile)
            }
            Err(error) => {
                debug!("Remote identity lookup failed for {}: {:#}", open_id, error);
                Resolution::Degraded {
                    profile: IdentityProfile::unresolved(open_id),
                    error,
                }
            }
        }
    }

    /// Record that `open_id` sent a message: make sure a user record exists and bump
    /// its message count.
    pub async fn record_activity(&self, open_id: &str) -> Result<()> {
        if open_id.is_empty() {
            return Ok(());
        }

        let profile = match self.resolve(open_id).await {
            Resolution::Resolved(profile) => profile,
            // Persist without a name so later lookups still try the remote tier.
            Resolution::Degraded { .. } => IdentityProfile {
                open_id: open_id.to_string(),
                ..Default::default()
            },
        };

        self.store.upsert(&profile).await?;
        self.store.increment_msg_count(open_id).await
    }

    /// Refresh one identity from the remote API. Without `force`, a record written
    /// within the cooldown window is returned unchanged.
    pub async fn sync_one(&self, open_id: &str, force: bool) -> Result<SyncOutcome> {
        if !force {
            if let Ok(Some(stored)) = self.store.get(open_id).await {
                if self.is_fresh(stored.updated_at) {
                    return Ok(SyncOutcome::Skipped);
                }
            }
        }

        let profile = self.remote.fetch(open_id).await?;
        self.store.upsert(&profile).await?;
        self.cache.insert(profile.clone());
        Ok(SyncOutcome::Synced)
    }

    /// Refresh every identity known to the store.
    pub async fn sync_all(&self) -> Result<SyncResult> {
        let ids = self.store.list_ids().await?;
        self.sync_by_ids(ids, false).await
    }

    /// Refresh the given identities on a fixed-size worker pool. Each identity is
    /// retried once after a short backoff before it counts as failed.
    pub async fn sync_by_ids(&self, open_ids: Vec<String>, force: bool) -> Result<SyncResult> {
        let mut result = SyncResult {
            total: open_ids.len(),
            ..Default::default()
        };
        if open_ids.is_empty() {
            return Ok(result);
        }

        let workers = self.options.workers.clamp(1, open_ids.len());
        let (job_tx, job_rx) = mpsc::channel::<String>(open_ids.len());
        let (result_tx, mut result_rx) = mpsc::channel(open_ids.len());
        let job_rx = Arc::new(Mutex::new(job_rx));

        // Workers are detached so the batch finishes even if the caller goes away.
        for _ in 0..workers {
            let resolver = self.clone();
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(open_id) = next else { break };
                    let outcome = resolver.sync_with_retry(&open_id, force).await;
                    if result_tx.send((open_id, outcome)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for open_id in open_ids {
            if job_tx.send(open_id).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        while let Some((open_id, outcome)) = result_rx.recv().await {
            match outcome {
                Ok(SyncOutcome::Synced) => result.synced += 1,
                Ok(SyncOutcome::Skipped) => result.skipped += 1,
                Err(e) => {
                    debug!("Failed to sync user {}: {:#}", open_id, e);
                    result.failed += 1;
                    result.failed_ids.push(open_id);
                }
            }
        }
        result.failed_ids.sort();

        info!(
            "User sync completed: {} synced, {} skipped, {} failed, {} total",
            result.synced, result.skipped, result.failed, result.total
        );
        Ok(result)
    }

    async fn sync_with_retry(&self, open_id: &str, force: bool) -> Result<SyncOutcome> {
        match self.sync_one(open_id, force).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                tokio::time::sleep(self.options.retry_backoff).await;
                self.sync_one(open_id, force).await
            }
        }
    }

    fn is_fresh(&self, updated_at: DateTime<Utc>) -> bool {
        // A timestamp in the future can't be converted and counts as fresh.
        (Utc::now() - updated_at)
            .to_std()
            .map(|age| age < self.options.cooldown)
            .unwrap_or(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub(crate) struct MemoryIdentityStore {
        pub records: StdMutex<HashMap<String, StoredIdentity>>,
        pub msg_counts: StdMutex<HashMap<String, u64>>,
    }

    impl MemoryIdentityStore {
        pub fn insert(&self, profile: IdentityProfile, updated_at: DateTime<Utc>) {
            self.records.lock().unwrap().insert(
                profile.open_id.clone(),
                StoredIdentity {
                    profile,
                    updated_at,
                },
            );
        }
    }

    #[async_trait]
    impl IdentityStore for MemoryIdentityStore {
        async fn get(&self, open_id: &str) -> Result<Option<StoredIdentity>> {
            Ok(self.records.lock().unwrap().get(open_id).cloned())
        }

        async fn upsert(&self, profile: &IdentityProfile) -> Result<()> {
            self.insert(profile.clone(), Utc::now());
            Ok(())
        }

        async fn list_ids(&self) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
            ids.sort();
            Ok(ids)
        }

        async fn increment_msg_count(&self, open_id: &str) -> Result<()> {
            *self
                .msg_counts
                .lock()
                .unwrap()
                .entry(open_id.to_string())
                .or_default() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeRemote {
        pub failing: HashSet<String>,
        pub calls: StdMutex<HashMap<String, usize>>,
    }

    impl FakeRemote {
        pub fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn calls_for(&self, open_id: &str) -> usize {
            self.calls.lock().unwrap().get(open_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl RemoteIdentityApi for FakeRemote {
        async fn fetch(&self, open_id: &str) -> Result<IdentityProfile> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(open_id.to_string())
                .or_default() += 1;
            if self.failing.contains(open_id) {
                anyhow::bail!("get user info error: code=41050, msg=no user authority");
            }
            Ok(IdentityProfile {
                open_id: open_id.to_string(),
                name: format!("Name of {}", open_id),
                ..Default::default()
            })
        }
    }

    fn resolver(
        store: Arc<MemoryIdentityStore>,
        remote: Arc<FakeRemote>,
    ) -> (IdentityResolver, IdentityCache) {
        let cache = IdentityCache::new();
        let options = SyncOptions {
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        (
            IdentityResolver::new(cache.clone(), store, remote, options),
            cache,
        )
    }

    #[tokio::test]
    async fn test_resolve_goes_remote_once_then_hits_cache() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::default());
        let (resolver, cache) = resolver(store.clone(), remote.clone());

        let first = resolver.resolve("ou_a").await;
        assert!(matches!(first, Resolution::Resolved(_)));
        assert_eq!(first.profile().name, "Name of ou_a");

        let second = resolver.resolve("ou_a").await;
        assert_eq!(second.into_profile().name, "Name of ou_a");

        assert_eq!(remote.calls_for("ou_a"), 1);
        assert_eq!(cache.len(), 1);
        assert!(store.records.lock().unwrap().contains_key("ou_a"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_named_store_record() {
        let store = Arc::new(MemoryIdentityStore::default());
        store.insert(
            IdentityProfile {
                open_id: "ou_b".into(),
                name: "Stored".into(),
                ..Default::default()
            },
            Utc::now() - chrono::Duration::days(30),
        );
        let remote = Arc::new(FakeRemote::default());
        let (resolver, cache) = resolver(store, remote.clone());

        assert_eq!(resolver.resolve("ou_b").await.profile().name, "Stored");
        assert_eq!(remote.calls_for("ou_b"), 0);
        assert_eq!(cache.get("ou_b").unwrap().name, "Stored");
    }

    #[tokio::test]
    async fn test_resolve_skips_nameless_store_record() {
        let store = Arc::new(MemoryIdentityStore::default());
        store.insert(
            IdentityProfile {
                open_id: "ou_c".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        let remote = Arc::new(FakeRemote::default());
        let (resolver, _) = resolver(store, remote.clone());

        assert_eq!(resolver.resolve("ou_c").await.profile().name, "Name of ou_c");
        assert_eq!(remote.calls_for("ou_c"), 1);
    }

    #[tokio::test]
    async fn test_resolve_failure_is_degraded_not_fatal() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::failing(&["ou_x"]));
        let (resolver, cache) = resolver(store, remote);

        match resolver.resolve("ou_x").await {
            Resolution::Degraded { profile, error } => {
                assert_eq!(profile.open_id, "ou_x");
                assert_eq!(profile.name, "ou_x");
                assert!(error.to_string().contains("41050"));
            }
            other => panic!("expected degraded resolution, got {:?}", other),
        }
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_resolve_empty_id() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::default());
        let (resolver, _) = resolver(store, remote.clone());

        assert_eq!(resolver.resolve("").await.profile().name, "unknown");
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_activity_counts_messages() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::failing(&["ou_gone"]));
        let (resolver, _) = resolver(store.clone(), remote);

        resolver.record_activity("ou_a").await.unwrap();
        resolver.record_activity("ou_a").await.unwrap();
        resolver.record_activity("ou_gone").await.unwrap();

        let counts = store.msg_counts.lock().unwrap();
        assert_eq!(counts.get("ou_a"), Some(&2));
        assert_eq!(counts.get("ou_gone"), Some(&1));
        let records = store.records.lock().unwrap();
        assert_eq!(records["ou_gone"].profile.name, "");
    }

    #[tokio::test]
    async fn test_sync_empty_input() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::default());
        let (resolver, _) = resolver(store, remote);

        let result = resolver.sync_by_ids(vec![], false).await.unwrap();
        assert_eq!(result, SyncResult::default());
    }

    #[tokio::test]
    async fn test_sync_retries_once_then_reports_failure() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::failing(&["b"]));
        let (resolver, _) = resolver(store, remote.clone());

        let result = resolver
            .sync_by_ids(vec!["a".into(), "b".into()], false)
            .await
            .unwrap();

        assert_eq!(
            result,
            SyncResult {
                total: 2,
                synced: 1,
                skipped: 0,
                failed: 1,
                failed_ids: vec!["b".into()],
            }
        );
        assert_eq!(remote.calls_for("a"), 1);
        assert_eq!(remote.calls_for("b"), 2);
    }

    #[tokio::test]
    async fn test_sync_respects_cooldown_unless_forced() {
        let store = Arc::new(MemoryIdentityStore::default());
        store.insert(
            IdentityProfile {
                open_id: "fresh".into(),
                name: "Old".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        store.insert(
            IdentityProfile {
                open_id: "stale".into(),
                name: "Old".into(),
                ..Default::default()
            },
            Utc::now() - chrono::Duration::hours(2),
        );
        let remote = Arc::new(FakeRemote::default());
        let (resolver, _) = resolver(store.clone(), remote.clone());

        let result = resolver.sync_all().await.unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.synced, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(remote.calls_for("fresh"), 0);
        assert_eq!(remote.calls_for("stale"), 1);

        let forced = resolver
            .sync_by_ids(vec!["fresh".into()], true)
            .await
            .unwrap();
        assert_eq!(forced.synced, 1);
        assert_eq!(remote.calls_for("fresh"), 1);
        assert_eq!(
            store.records.lock().unwrap()["fresh"].profile.name,
            "Name of fresh"
        );
    }

    #[tokio::test]
    async fn test_sync_many_ids_with_few_workers() {
        let store = Arc::new(MemoryIdentityStore::default());
        let remote = Arc::new(FakeRemote::default());
        let cache = IdentityCache::new();
        let options = SyncOptions {
            workers: 3,
            ..Default::default()
        };
        let resolver = IdentityResolver::new(cache.clone(), store, remote, options);

        let ids: Vec<String> = (0..20).map(|i| format!("ou_{}", i)).collect();
        let result = resolver.sync_by_ids(ids, false).await.unwrap();
        assert_eq!(result.total, 20);
        assert_eq!(result.synced, 20);
        assert_eq!(cache.len(), 20);
    }
}
