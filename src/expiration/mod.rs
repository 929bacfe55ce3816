// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TTL-proxy expiration.
//!
//! Cached records never carry a TTL themselves. Each one gets a companion
//! string key, the *proxy*, holding the expire spec with a native TTL:
//!
//! ```text
//! data:42           value hash, no TTL
//! keyinfo:data:42   metadata hash, no TTL
//! ttl::data:42      proxy, TTL = resolved expire spec
//! ```
//!
//! When the proxy expires the backend emits a notification. The listener
//! flushes the value to the database if it was never written there, then
//! drops the value hash, the metadata hash and the local entries.

mod policy;

pub use policy::{unsigned_spec, ExpirePolicy};

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::ServiceContext;
use crate::error::Result;
use crate::key_info::KeyInfo;
use crate::kv_pair::{KvIdType, KvPair};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::Repository;

/// What caused an [`arm`](ExpirationCoordinator::arm).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmTrigger {
    /// The value was written by a caller.
    Write,
    /// The value was reloaded from the database after a cache miss.
    Refill,
    /// The caller asked for a different expire spec on a cached key.
    Override,
}

/// Proxy key of a record: `{event_prefix}::{kind}:{id}`.
pub fn proxy_key(event_prefix: &str, id_type: &KvIdType) -> String {
    format!("{}::{}", event_prefix, id_type.key())
}

#[derive(Clone)]
pub struct ExpirationCoordinator {
    ctx: Arc<ServiceContext>,
}

impl ExpirationCoordinator {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub fn proxy_key(&self, id_type: &KvIdType) -> String {
        proxy_key(&self.ctx.config.event_prefix, id_type)
    }

    fn proxy_prefix(&self) -> String {
        format!("{}::", self.ctx.config.event_prefix)
    }

    /// Apply the key's expire policy to its proxy.
    ///
    /// Commits or rolls back the staged expire spec and persists the
    /// KeyInfo when that changed it.
    pub async fn arm(&self, pair: &KvPair, key_info: &mut KeyInfo, trigger: ArmTrigger) -> Result<()> {
        let policy = ExpirePolicy::resolve(&key_info.expire, &self.ctx.config.default_expire)?;
        let proxy = self.proxy_key(&pair.id_type);
        let cache = &self.ctx.cache;

        let ttl = match policy {
            ExpirePolicy::NoExpiration => {
                cache.delete(&proxy).await?;
                key_info.commit_expire();
                crate::metrics::record_proxy_arm("cleared");
                debug!(proxy = %proxy, "Expiration disabled, proxy cleared");
                return self.persist(pair, key_info).await;
            }
            ExpirePolicy::Sliding(ttl) => {
                if cache.exists(&proxy).await? {
                    key_info.rollback_expire();
                    crate::metrics::record_proxy_arm("skipped");
                    return Ok(());
                }
                ttl
            }
            ExpirePolicy::OneShot(ttl) => {
                if trigger == ArmTrigger::Refill {
                    crate::metrics::record_proxy_arm("skipped");
                    return Ok(());
                }
                ttl
            }
            ExpirePolicy::ForcedOverride(ttl) => ttl,
        };

        if policy.replaces_existing() {
            cache.delete(&proxy).await?;
        }
        cache.set_with_ttl(&proxy, &key_info.expire, ttl).await?;

        key_info.commit_expire();
        if matches!(policy, ExpirePolicy::ForcedOverride(_)) {
            // Later arms slide on the magnitude; the signed form stays committed.
            key_info.expire = unsigned_spec(&key_info.expire).to_string();
        }
        crate::metrics::record_proxy_arm("armed");
        debug!(proxy = %proxy, ?ttl, ?trigger, "Proxy armed");

        self.persist(pair, key_info).await
    }

    async fn persist(&self, pair: &KvPair, key_info: &mut KeyInfo) -> Result<()> {
        if key_info.is_new {
            self.ctx.metadata.save(pair, key_info).await?;
            if self.ctx.local.contains(&pair.id_type) {
                self.ctx.local.put_key_info(&pair.id_type, key_info);
            }
        }
        Ok(())
    }

    /// Evict the record behind an expired proxy key.
    pub async fn handle_expired(&self, proxy: &str) -> Result<()> {
        let Some(id_type) = proxy
            .strip_prefix(&self.proxy_prefix())
            .and_then(KvIdType::parse_key)
        else {
            debug!(key = %proxy, "Ignoring expiration of foreign key");
            crate::metrics::record_expiration("ignored");
            return Ok(());
        };

        let key_info = match self.ctx.local.key_info(&id_type) {
            Some(key_info) => Some(key_info),
            None => self.ctx.metadata.load(&id_type).await?,
        };
        let mut pair = KvPair::new(id_type);
        let mut key_info = key_info.unwrap_or_default();

        if key_info.unflushed && !key_info.is_query_backed() {
            if self.ctx.remote.find(&mut pair, &mut key_info).await? {
                if let Err(e) = self.ctx.database.save(&pair, &mut key_info).await {
                    warn!(id = %pair.id_type, error = %e, "Flush before eviction failed, keeping cached entries");
                    crate::metrics::record_expiration("flush_failed");
                    return Ok(());
                }
                key_info.unflushed = false;
                debug!(id = %pair.id_type, "Flushed unwritten value before eviction");
            }
        }

        self.ctx.remote.delete(&pair, &key_info).await?;
        if self.keeps_routing(&pair, &key_info) {
            key_info.unflushed = false;
            key_info.is_new = true;
            self.ctx.metadata.save(&pair, &mut key_info).await?;
            debug!(id = %pair.id_type, clause = %key_info.clause, "Kept routing of evicted record");
        } else {
            self.ctx.metadata.delete(&pair, &key_info).await?;
        }
        self.ctx.local.remove(&pair.id_type);
        crate::metrics::record_expiration("evicted");
        debug!(id = %pair.id_type, "Evicted expired record");
        Ok(())
    }

    /// Whether the metadata must outlive the cached value: a fresh request
    /// for the id could not rebuild its routing on the default table.
    fn keeps_routing(&self, pair: &KvPair, key_info: &KeyInfo) -> bool {
        if key_info.is_query_backed() || key_info.clause.is_empty() {
            return false;
        }
        let default_table = self.ctx.config.default_table.as_deref().unwrap_or_default();
        key_info.table != default_table || !key_info.routes_by_id(pair.id())
    }

    /// Consume expiration notifications until `shutdown` flips to true,
    /// resubscribing whenever the stream ends.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.proxy_prefix();
        let capacity = self.ctx.config.expiration_channel_capacity;
        let policy = RetryConfig::resubscribe();

        loop {
            let subscribe = retry("expiration_subscribe", &policy, || async {
                self.ctx.cache.subscribe_expired(&prefix, capacity).await
            });
            let mut events = tokio::select! {
                result = subscribe => match result {
                    Ok(events) => events,
                    Err(e) => {
                        error!(error = %e, "Could not subscribe to expiration notifications");
                        return;
                    }
                },
                _ = shutdown.changed() => return,
            };
            info!(prefix = %prefix, "Expiration listener subscribed");

            loop {
                tokio::select! {
                    key = events.recv() => match key {
                        Some(key) => {
                            if let Err(e) = self.handle_expired(&key).await {
                                warn!(key = %key, error = %e, "Expiration handling failed");
                                crate::metrics::record_error("expiration", "evict", "backend");
                            }
                        }
                        None => {
                            warn!("Expiration stream closed, resubscribing");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Expiration listener stopped");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub fn spawn_listener(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::memory::InMemoryCacheBackend;
    use crate::storage::sql::SqlStore;
    use crate::storage::traits::{CacheBackend, SqlBackend};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<InMemoryCacheBackend>,
        store: Arc<SqlStore>,
        ctx: Arc<ServiceContext>,
        coordinator: ExpirationCoordinator,
        path: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
            let _ = std::fs::remove_file(format!("{}-wal", self.path.display()));
            let _ = std::fs::remove_file(format!("{}-shm", self.path.display()));
        }
    }

    async fn fixture() -> Fixture {
        let path = std::env::temp_dir().join(format!("kvqc_exp_{}.db", uuid::Uuid::new_v4().simple()));
        let store = SqlStore::new(&format!("sqlite://{}?mode=rwc", path.display()), 2)
            .await
            .unwrap();
        store
            .execute("CREATE TABLE user_table (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        let store = Arc::new(store);
        let backend = Arc::new(InMemoryCacheBackend::with_command_log());
        let config = EngineConfig {
            default_table: Some("user_table".into()),
            ..Default::default()
        };
        let ctx = Arc::new(ServiceContext::new(config, backend.clone(), store.clone()));
        let coordinator = ExpirationCoordinator::new(ctx.clone());
        Fixture { backend, store, ctx, coordinator, path }
    }

    fn pair(id: &str) -> KvPair {
        KvPair::from_value(KvIdType::data(id), json!({"id": id.parse::<i64>().unwrap_or(0), "name": "Ada"}))
    }

    #[test]
    fn test_proxy_key_layout() {
        assert_eq!(proxy_key("ttl", &KvIdType::data("42")), "ttl::data:42");
    }

    #[tokio::test]
    async fn test_arm_sets_proxy_and_persists_metadata() {
        let f = fixture().await;
        let mut info = KeyInfo::new("user_table", "60");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Write).await.unwrap();

        assert_eq!(f.backend.command_log(), vec!["SET ttl::data:1", "HSET keyinfo:data:1"]);
        assert_eq!(f.backend.get_string("ttl::data:1").await.unwrap().as_deref(), Some("60"));
        assert!(!info.is_new);
    }

    #[tokio::test]
    async fn test_rearm_unsigned_with_existing_proxy_is_noop() {
        let f = fixture().await;
        let mut info = KeyInfo::new("user_table", "60");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Write).await.unwrap();
        f.backend.clear_command_log();

        info.set_expire("120");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Refill).await.unwrap();

        assert!(f.backend.command_log().is_empty());
        assert_eq!(info.expire, "60");
        assert!(!info.has_pending_expire());
    }

    #[tokio::test]
    async fn test_forced_override_replaces_and_normalizes() {
        let f = fixture().await;
        let mut info = KeyInfo::new("user_table", "60");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Write).await.unwrap();
        f.backend.clear_command_log();

        info.set_expire("-5");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Override).await.unwrap();

        assert_eq!(
            f.backend.command_log(),
            vec!["DEL ttl::data:1", "SET ttl::data:1", "HSET keyinfo:data:1"]
        );
        assert_eq!(info.expire, "5");
        assert_eq!(info.expire_old, "-5");
        assert!(!info.has_pending_expire());

        // Now an ordinary spec: refills leave the armed proxy alone.
        f.backend.clear_command_log();
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Refill).await.unwrap();
        assert!(f.backend.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_arms_only_on_write() {
        let f = fixture().await;
        let mut info = KeyInfo::new("user_table", "+30");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Refill).await.unwrap();
        assert!(f.backend.command_log().is_empty());

        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Write).await.unwrap();
        assert_eq!(f.backend.command_log()[..2], ["DEL ttl::data:1", "SET ttl::data:1"]);
        assert_eq!(info.expire, "+30");
    }

    #[tokio::test]
    async fn test_zero_spec_clears_proxy() {
        let f = fixture().await;
        let mut info = KeyInfo::new("user_table", "60");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Write).await.unwrap();

        info.set_expire("0");
        f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Override).await.unwrap();
        assert!(!f.backend.exists("ttl::data:1").await.unwrap());
        assert_eq!(info.expire_old, "0");
    }

    #[tokio::test]
    async fn test_invalid_spec_is_bad_request() {
        let f = fixture().await;
        let mut info = KeyInfo::new("user_table", "soon");
        let err = f.coordinator.arm(&pair("1"), &mut info, ArmTrigger::Write).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    async fn cache_everything(f: &Fixture, pair: &KvPair, info: &mut KeyInfo) {
        f.ctx.remote.save(pair, info).await.unwrap();
        f.ctx.metadata.save(pair, info).await.unwrap();
        f.ctx.local.save(pair, info).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_expired_evicts_all_tiers() {
        let f = fixture().await;
        let p = pair("1");
        cache_everything(&f, &p, &mut KeyInfo::new("user_table", "60")).await;

        f.coordinator.handle_expired("ttl::data:1").await.unwrap();

        assert_eq!(f.backend.hash_count(), 0);
        assert!(!f.ctx.local.contains(&p.id_type));
        assert!(f.store.select("user_table", "", &[], None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eviction_keeps_routing_the_id_cannot_rebuild() {
        let f = fixture().await;
        let p = KvPair::from_value(KvIdType::data("3f2a"), json!({"name": "Grace"}));
        let mut info = KeyInfo::new("user_table", "60");
        info.clause = "id = ?".to_string();
        info.params = vec![json!(9)];
        cache_everything(&f, &p, &mut info).await;

        f.coordinator.handle_expired("ttl::data:3f2a").await.unwrap();

        assert!(f.backend.hash_get_all("data:3f2a").await.unwrap().is_none());
        assert!(!f.ctx.local.contains(&p.id_type));
        let kept = f.ctx.metadata.load(&p.id_type).await.unwrap().unwrap();
        assert_eq!(kept.clause, "id = ?");
        assert_eq!(kept.params, vec![json!(9)]);
        assert!(!kept.unflushed);
    }

    #[tokio::test]
    async fn test_unflushed_value_is_written_before_eviction() {
        let f = fixture().await;
        let p = pair("7");
        let mut info = KeyInfo::new("user_table", "60");
        info.unflushed = true;
        cache_everything(&f, &p, &mut info).await;

        f.coordinator.handle_expired("ttl::data:7").await.unwrap();

        let rows = f.store.select("user_table", "id = ?", &[json!(7)], None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Ada");
        assert_eq!(f.backend.hash_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_cached_entries() {
        let f = fixture().await;
        let p = pair("7");
        let mut info = KeyInfo::new("user_table", "60");
        info.unflushed = true;
        cache_everything(&f, &p, &mut info).await;
        // Memoize the schema, then take the table away.
        f.ctx.resolver.table_columns("user_table", &mut KeyInfo::default()).await.unwrap();
        f.store.execute("DROP TABLE user_table").await.unwrap();

        f.coordinator.handle_expired("ttl::data:7").await.unwrap();

        assert!(f.backend.hash_get_all("data:7").await.unwrap().is_some());
        assert!(f.ctx.local.contains(&p.id_type));
    }

    #[tokio::test]
    async fn test_foreign_keys_are_ignored() {
        let f = fixture().await;
        f.coordinator.handle_expired("session:abc").await.unwrap();
        f.coordinator.handle_expired("ttl::nocolon").await.unwrap();
        assert!(f.backend.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_listener_evicts_when_proxy_ttl_runs_out() {
        let f = fixture().await;
        let (tx, rx) = watch::channel(false);
        let listener = f.coordinator.spawn_listener(rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let p = pair("3");
        let mut info = KeyInfo::new("user_table", "50ms");
        cache_everything(&f, &p, &mut info).await;
        f.coordinator.arm(&p, &mut info, ArmTrigger::Write).await.unwrap();
        assert!(f.backend.hash_get_all("data:3").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(f.backend.hash_get_all("data:3").await.unwrap().is_none());
        assert!(f.backend.hash_get_all("keyinfo:data:3").await.unwrap().is_none());

        tx.send(true).unwrap();
        listener.await.unwrap();
    }
}
