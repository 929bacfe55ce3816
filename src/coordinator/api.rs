// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request entry points: single and batch get, put and delete.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ServiceContext;
use crate::error::{EngineError, Result};
use crate::expiration::{ArmTrigger, ExpirationCoordinator, ExpirePolicy};
use crate::key_info::{AnyKey, KeyInfo, QueryKeyState};
use crate::kv_pair::{KvIdType, KvPair, KvPairs, DEFAULT_KIND};
use crate::metrics::LatencyTimer;
use crate::query::QueryInfo;
use crate::storage::database::DatabaseRepository;
use crate::storage::traits::Repository;

use super::{BatchResult, KeyRequest, QueryCacheEngine};

impl QueryCacheEngine {
    /// Fetch a value: local cache, then remote cache, then database.
    ///
    /// A database hit fills the local cache before returning; the remote
    /// cache, the TTL proxy and the metadata follow on the write-behind
    /// executor.
    #[tracing::instrument(skip(self, request), fields(id = %request.id, tier))]
    pub async fn get(&self, request: &KeyRequest) -> Result<Value> {
        let _timer = LatencyTimer::new("get");
        if request.is_generated() {
            return Err(EngineError::bad_request("cannot read a generated id"));
        }
        let (id_type, mut key_info) = self.prepare(request).await?;
        let mut pair = KvPair::new(id_type);

        if self.ctx.local.find(&mut pair, &mut key_info).await? {
            tracing::Span::current().record("tier", "local");
            crate::metrics::record_lookup("local", "hit");
            self.arm_pending_override(&pair, &key_info);
            return Ok(pair.value());
        }
        crate::metrics::record_lookup("local", "miss");

        match self.ctx.remote.find(&mut pair, &mut key_info).await {
            Ok(true) => {
                tracing::Span::current().record("tier", "remote");
                crate::metrics::record_lookup("remote", "hit");
                self.ctx.local.save(&pair, &mut key_info).await?;
                self.arm_pending_override(&pair, &key_info);
                return Ok(pair.value());
            }
            Ok(false) => crate::metrics::record_lookup("remote", "miss"),
            Err(e) => {
                warn!(error = %e, "Remote lookup failed, falling through to database");
                crate::metrics::record_lookup("remote", "error");
            }
        }

        if self.ctx.database.find(&mut pair, &mut key_info).await? {
            tracing::Span::current().record("tier", "database");
            crate::metrics::record_lookup("database", "hit");
            self.ctx.local.save(&pair, &mut key_info).await?;
            let value = pair.value();
            self.spawn_refill(pair, key_info);
            return Ok(value);
        }

        tracing::Span::current().record("tier", "miss");
        crate::metrics::record_lookup("database", "miss");
        Err(EngineError::NotFound(pair.id_type.to_string()))
    }

    /// Store a value and return its id (generated for [`KeyRequest::generated`]).
    ///
    /// The caches and the metadata are written before returning; the TTL
    /// proxy and the database write follow on the write-behind executor.
    #[tracing::instrument(skip(self, request, value), fields(id = %request.id))]
    pub async fn put(&self, request: &KeyRequest, value: Value) -> Result<String> {
        let _timer = LatencyTimer::new("put");
        let (id_type, mut key_info) = self.prepare(request).await?;
        reject_query_backed(&id_type, &key_info)?;

        let pair = KvPair::from_value(id_type, value);
        key_info.unflushed = true;
        key_info.is_new = true;
        self.cache_write(&pair, &mut key_info).await?;

        let id = pair.id().to_string();
        self.spawn_persist(pair, key_info);
        Ok(id)
    }

    /// Remove a record from every tier. The database delete runs on the
    /// write-behind executor.
    #[tracing::instrument(skip(self, request), fields(id = %request.id))]
    pub async fn delete(&self, request: &KeyRequest) -> Result<()> {
        let _timer = LatencyTimer::new("delete");
        if request.is_generated() {
            return Err(EngineError::bad_request("cannot delete a generated id"));
        }
        let (id_type, key_info) = self.prepare(request).await?;
        let pair = KvPair::new(id_type);
        self.cache_evict(&pair, &key_info).await?;

        let ctx = Arc::clone(&self.ctx);
        self.ctx.executor.spawn("database_delete", async move {
            ctx.database.delete(&pair, &key_info).await
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Batch operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fetch many ids sharing the routing options of `request`.
    ///
    /// Results are index-aligned with `ids`; an id that no tier holds, or
    /// whose lookup failed, yields `None`.
    #[tracing::instrument(skip(self, request, ids), fields(count = ids.len()))]
    pub async fn get_many<S: AsRef<str>>(&self, request: &KeyRequest, ids: &[S]) -> Result<Vec<Option<Value>>> {
        let _timer = LatencyTimer::new("get_many");
        crate::metrics::record_batch_size("get_many", ids.len());
        let mut results: Vec<Option<Value>> = vec![None; ids.len()];

        let (mut slots, mut pairs, mut keys) = self.prepare_batch(request, ids).await;

        // Local tier.
        let hits = self.ctx.local.find_each(&mut pairs, &mut keys).await;
        let (mut pairs, mut keys) = take_misses(&mut slots, pairs, keys, &hits, &mut results, |_, _| {});
        if pairs.is_empty() {
            return Ok(results);
        }

        // Remote tier; hits fill the local cache.
        let hits = self.ctx.remote.find_each(&mut pairs, &mut keys).await;
        let mut filled = Vec::new();
        let (mut pairs, mut keys) = take_misses(&mut slots, pairs, keys, &hits, &mut results, |pair, key_info| {
            filled.push((pair.clone(), key_info.clone()));
        });
        for (pair, mut key_info) in filled {
            self.ctx.local.save(&pair, &mut key_info).await?;
        }
        if pairs.is_empty() {
            return Ok(results);
        }

        // Database; hits fill the local cache now and the rest later.
        let hits = self.ctx.database.find_each(&mut pairs, &mut keys).await;
        let mut refills = Vec::new();
        take_misses(&mut slots, pairs, keys, &hits, &mut results, |pair, key_info| {
            refills.push((pair.clone(), key_info.clone()));
        });
        for (pair, mut key_info) in refills {
            self.ctx.local.save(&pair, &mut key_info).await?;
            self.spawn_refill(pair, key_info);
        }

        let misses = results.iter().filter(|r| r.is_none()).count();
        debug!(misses, "Batch get complete");
        Ok(results)
    }

    /// Store many values sharing the routing options of `request`.
    #[tracing::instrument(skip(self, request, items), fields(count = items.len()))]
    pub async fn put_many(&self, request: &KeyRequest, items: Vec<(String, Value)>) -> Result<BatchResult> {
        let _timer = LatencyTimer::new("put_many");
        let total = items.len();
        crate::metrics::record_batch_size("put_many", total);

        let (ids, values): (Vec<String>, Vec<Value>) = items.into_iter().unzip();
        let mut values: Vec<Option<Value>> = values.into_iter().map(Some).collect();
        let (slots, pairs, keys) = self.prepare_batch(request, &ids).await;

        let mut succeeded = 0;
        for ((slot, pair), mut key_info) in slots.into_iter().zip(pairs).zip(keys.into_vec()) {
            if let Err(e) = reject_query_backed(&pair.id_type, &key_info) {
                warn!(id = %pair.id_type, error = %e, "Skipping batch item");
                continue;
            }
            let value = values[slot].take().unwrap_or(Value::Null);
            let pair = KvPair::from_value(pair.id_type, value);
            key_info.unflushed = true;
            key_info.is_new = true;

            match self.cache_write(&pair, &mut key_info).await {
                Ok(()) => {
                    succeeded += 1;
                    self.spawn_persist(pair, key_info);
                }
                Err(e) => warn!(id = %pair.id_type, error = %e, "Batch put failed for item"),
            }
        }
        Ok(BatchResult {
            total,
            succeeded,
            failed: total - succeeded,
        })
    }

    /// Remove many ids from every tier.
    #[tracing::instrument(skip(self, request, ids), fields(count = ids.len()))]
    pub async fn delete_many<S: AsRef<str>>(&self, request: &KeyRequest, ids: &[S]) -> Result<BatchResult> {
        let _timer = LatencyTimer::new("delete_many");
        let total = ids.len();
        crate::metrics::record_batch_size("delete_many", total);

        let (_, pairs, keys) = self.prepare_batch(request, ids).await;

        // Only ids gone from every cache tier reach the database.
        let mut evicted = KvPairs::new();
        let mut evicted_keys = AnyKey::new();
        for (pair, key_info) in pairs.into_vec().into_iter().zip(keys.into_vec()) {
            match self.cache_evict(&pair, &key_info).await {
                Ok(()) => {
                    evicted.push(pair);
                    evicted_keys.push(key_info);
                }
                Err(e) => warn!(id = %pair.id_type, error = %e, "Batch delete failed for item"),
            }
        }

        let succeeded = evicted.len();
        let (pairs, mut keys) = (evicted, evicted_keys);
        let ctx = Arc::clone(&self.ctx);
        self.ctx.executor.spawn("database_delete_many", async move {
            if ctx.database.delete_all(&pairs, &mut keys).await? {
                Ok(())
            } else {
                Err(EngineError::server("some database deletes failed"))
            }
        });

        Ok(BatchResult {
            total,
            succeeded,
            failed: total - succeeded,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Turn a request into an identity and the KeyInfo to route it with.
    ///
    /// Existing keys keep their routing: a different table or different
    /// filter conditions are rejected. Expire overrides are validated and
    /// staged, not committed.
    pub(super) async fn prepare(&self, request: &KeyRequest) -> Result<(KvIdType, KeyInfo)> {
        let id = if request.is_generated() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            request.id.clone()
        };
        if id.is_empty() {
            return Err(EngineError::bad_request("empty id"));
        }
        let kind = if request.kind.is_empty() { DEFAULT_KIND } else { request.kind.as_str() };
        let id_type = KvIdType::new(id, kind);

        if let Some(spec) = &request.expire {
            ExpirePolicy::parse(spec)?;
        }

        let stored = match self.ctx.local.key_info(&id_type) {
            Some(key_info) => Some(key_info),
            None if request.is_generated() => None,
            None => self.ctx.metadata.load(&id_type).await?,
        };

        let table = request
            .table
            .clone()
            .or_else(|| stored.as_ref().map(|k| k.table.clone()).filter(|t| !t.is_empty()))
            .or_else(|| self.ctx.config.default_table.clone());
        let query = if request.params.is_empty() {
            None
        } else {
            let Some(table) = &table else {
                return Err(EngineError::bad_request("a query needs a table"));
            };
            Some(QueryInfo::from_params(table.as_str(), &request.params)?)
        };

        let key_info = match stored {
            Some(mut key_info) => {
                let routed = !key_info.clause.is_empty() || key_info.is_query_backed();
                if let Some(requested) = &request.table {
                    if routed && !key_info.table.is_empty() && *requested != key_info.table {
                        return Err(EngineError::bad_request(format!(
                            "{} is routed to table '{}'",
                            id_type, key_info.table
                        )));
                    }
                    if !routed {
                        key_info.table = requested.clone();
                    }
                }
                if let Some(query) = query {
                    match &key_info.query_key {
                        QueryKeyState::Resolved(hash) if *hash != query.key() => {
                            return Err(EngineError::bad_request(format!(
                                "{} is bound to different filter conditions",
                                id_type
                            )));
                        }
                        QueryKeyState::NotQueryBacked if routed => {
                            return Err(EngineError::bad_request(format!(
                                "{} is not query-backed",
                                id_type
                            )));
                        }
                        _ => key_info.query_info = Some(query),
                    }
                }
                if key_info.table.is_empty() {
                    key_info.table = table.unwrap_or_default();
                }
                if let Some(spec) = &request.expire {
                    key_info.set_expire(spec.as_str());
                }
                key_info
            }
            None => {
                let expire = request
                    .expire
                    .clone()
                    .unwrap_or_else(|| self.ctx.config.default_expire.clone());
                let mut key_info = KeyInfo::new(table.unwrap_or_default(), expire);
                key_info.query_info = query;
                key_info
            }
        };
        Ok((id_type, key_info))
    }

    /// Prepare every id; failures are logged and leave their slot out.
    ///
    /// Returns the original index of each prepared item with the aligned
    /// pairs and KeyInfos.
    async fn prepare_batch<S: AsRef<str>>(&self, request: &KeyRequest, ids: &[S]) -> (Vec<usize>, KvPairs, AnyKey) {
        let mut slots = Vec::with_capacity(ids.len());
        let mut pairs = KvPairs::new();
        let mut keys = AnyKey::new();
        for (slot, id) in ids.iter().enumerate() {
            match self.prepare(&request.for_id(id.as_ref())).await {
                Ok((id_type, key_info)) => {
                    slots.push(slot);
                    pairs.push(KvPair::new(id_type));
                    keys.push(key_info);
                }
                Err(e) => {
                    warn!(id = id.as_ref(), error = %e, "Skipping batch item");
                    crate::metrics::record_rejected("batch_item");
                }
            }
        }
        (slots, pairs, keys)
    }

    /// Synchronous half of a write: remote cache, local cache, metadata.
    async fn cache_write(&self, pair: &KvPair, key_info: &mut KeyInfo) -> Result<()> {
        self.ctx.remote.save(pair, key_info).await?;
        self.ctx.local.save(pair, key_info).await?;
        self.ctx.metadata.save(pair, key_info).await?;
        Ok(())
    }

    /// Drop every cached trace of a key: local, remote, metadata and proxy.
    async fn cache_evict(&self, pair: &KvPair, key_info: &KeyInfo) -> Result<()> {
        self.ctx.local.delete(pair, key_info).await?;
        self.ctx.remote.delete(pair, key_info).await?;
        self.ctx.metadata.delete(pair, key_info).await?;
        self.ctx.cache.delete(&self.expiration.proxy_key(&pair.id_type)).await?;
        Ok(())
    }

    /// Apply a staged expire override of a cached key.
    fn arm_pending_override(&self, pair: &KvPair, key_info: &KeyInfo) {
        if !key_info.has_pending_expire() {
            return;
        }
        let expiration = self.expiration.clone();
        let pair = pair.clone();
        let mut key_info = key_info.clone();
        self.ctx.executor.spawn("arm_override", async move {
            expiration.arm(&pair, &mut key_info, ArmTrigger::Override).await
        });
    }

    /// After a database hit: write the remote cache, arm the proxy and
    /// persist the routing.
    fn spawn_refill(&self, pair: KvPair, key_info: KeyInfo) {
        let ctx = Arc::clone(&self.ctx);
        let expiration = self.expiration.clone();
        self.ctx.executor.spawn("refill", async move {
            let mut key_info = key_info;
            ctx.remote.save(&pair, &mut key_info).await?;
            expiration.arm(&pair, &mut key_info, ArmTrigger::Refill).await?;
            remember(&ctx, &pair, &mut key_info).await
        });
    }

    /// After a caller write: arm the proxy and write the database.
    fn spawn_persist(&self, pair: KvPair, key_info: KeyInfo) {
        let ctx = Arc::clone(&self.ctx);
        let expiration = self.expiration.clone();
        self.ctx.executor.spawn("persist", persist(ctx, expiration, pair, key_info));
    }
}

async fn persist(
    ctx: Arc<ServiceContext>,
    expiration: ExpirationCoordinator,
    mut pair: KvPair,
    mut key_info: KeyInfo,
) -> Result<()> {
    if let Err(e) = expiration.arm(&pair, &mut key_info, ArmTrigger::Write).await {
        warn!(id = %pair.id_type, error = %e, "Arming proxy failed");
    }

    ctx.database.save(&pair, &mut key_info).await?;
    key_info.unflushed = false;
    key_info.is_new = true;

    if DatabaseRepository::backfill(&mut pair, &key_info) {
        ctx.remote.save(&pair, &mut key_info).await?;
        if ctx.local.contains(&pair.id_type) {
            ctx.local.save(&pair, &mut key_info).await?;
        }
    }
    remember(&ctx, &pair, &mut key_info).await
}

/// Persist the KeyInfo and refresh the local copy.
async fn remember(ctx: &ServiceContext, pair: &KvPair, key_info: &mut KeyInfo) -> Result<()> {
    ctx.metadata.save(pair, key_info).await?;
    if ctx.local.contains(&pair.id_type) {
        ctx.local.put_key_info(&pair.id_type, key_info);
    }
    Ok(())
}

fn reject_query_backed(id_type: &KvIdType, key_info: &KeyInfo) -> Result<()> {
    if key_info.is_query_backed() || key_info.query_info.is_some() {
        return Err(EngineError::bad_request(format!(
            "{} is query-backed and cannot be written",
            id_type
        )));
    }
    Ok(())
}

/// Record hits into `results` and return the misses for the next tier.
///
/// `hits` is index-aligned with `pairs`. `on_hit` sees every hit before it
/// is dropped from the batch.
fn take_misses<F>(
    slots: &mut Vec<usize>,
    pairs: KvPairs,
    keys: AnyKey,
    hits: &[bool],
    results: &mut [Option<Value>],
    mut on_hit: F,
) -> (KvPairs, AnyKey)
where
    F: FnMut(&KvPair, &KeyInfo),
{
    let mut remaining_slots = Vec::new();
    let mut remaining_pairs = KvPairs::new();
    let mut remaining_keys = AnyKey::new();

    for (i, ((slot, pair), key_info)) in slots.iter().zip(pairs.into_vec()).zip(keys.into_vec()).enumerate() {
        if hits.get(i).copied().unwrap_or(false) {
            on_hit(&pair, &key_info);
            results[*slot] = Some(pair.value());
        } else {
            remaining_slots.push(*slot);
            remaining_pairs.push(pair);
            remaining_keys.push(key_info);
        }
    }

    *slots = remaining_slots;
    (remaining_pairs, remaining_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::memory::InMemoryCacheBackend;
    use crate::storage::sql::SqlStore;
    use serde_json::json;
    use std::path::PathBuf;

    struct Fixture {
        engine: QueryCacheEngine,
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
        let path = std::env::temp_dir().join(format!("kvqc_api_{}.db", uuid::Uuid::new_v4().simple()));
        let store = SqlStore::new(&format!("sqlite://{}?mode=rwc", path.display()), 2)
            .await
            .unwrap();
        store
            .execute("CREATE TABLE user_table (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .await
            .unwrap();
        store
            .execute("CREATE TABLE other_table (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        store
            .execute("INSERT INTO user_table (id, name, age) VALUES (1, 'Ada', 36), (2, 'Alan', 41)")
            .await
            .unwrap();
        let config = EngineConfig {
            default_table: Some("user_table".into()),
            ..Default::default()
        };
        let engine = QueryCacheEngine::new(config, Arc::new(InMemoryCacheBackend::new()), Arc::new(store));
        Fixture { engine, path }
    }

    #[tokio::test]
    async fn test_prepare_new_key_uses_defaults() {
        let f = fixture().await;
        let (id_type, info) = f.engine.prepare(&KeyRequest::new("5")).await.unwrap();
        assert_eq!(id_type, KvIdType::data("5"));
        assert_eq!(info.table, "user_table");
        assert_eq!(info.expire, "3600");
        assert!(info.is_new);
    }

    #[tokio::test]
    async fn test_prepare_generates_ids() {
        let f = fixture().await;
        let (a, _) = f.engine.prepare(&KeyRequest::generated()).await.unwrap();
        let (b, _) = f.engine.prepare(&KeyRequest::generated()).await.unwrap();
        assert_eq!(a.id.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_prepare_rejects_bad_input() {
        let f = fixture().await;
        for request in [
            KeyRequest::new(""),
            KeyRequest::new("1").with_expire("tomorrow"),
            KeyRequest::new("1").with_param("limit", ["many"]),
            KeyRequest::new("1").with_param("bad column", ["1"]),
        ] {
            let err = f.engine.prepare(&request).await.unwrap_err();
            assert_eq!(err.status_code(), 400, "{:?}", request);
        }
    }

    #[tokio::test]
    async fn test_routed_key_cannot_change_table() {
        let f = fixture().await;
        f.engine.get(&KeyRequest::new("1")).await.unwrap();

        let err = f
            .engine
            .get(&KeyRequest::new("1").with_table("other_table"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        // Naming the same table again is fine.
        f.engine.get(&KeyRequest::new("1").with_table("user_table")).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_key_cannot_change_conditions() {
        let f = fixture().await;
        let adults = KeyRequest::new("adults").with_param("age>", ["18"]);
        let rows = f.engine.get(&adults).await.unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);

        let err = f
            .engine
            .get(&KeyRequest::new("adults").with_param("age>", ["40"]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        // Same conditions again are served from cache.
        assert_eq!(f.engine.get(&adults).await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_standard_key_cannot_become_query_backed() {
        let f = fixture().await;
        f.engine.get(&KeyRequest::new("1")).await.unwrap();
        f.engine.drain().await;

        let err = f
            .engine
            .get(&KeyRequest::new("1").with_param("age>", ["18"]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_put_to_query_backed_key_is_rejected() {
        let f = fixture().await;
        let request = KeyRequest::new("q").with_param("age>", ["18"]);
        let err = f.engine.put(&request, json!({"name": "x"})).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_not_found() {
        let f = fixture().await;
        let err = f.engine.get(&KeyRequest::new("404")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_expire_override_is_staged_on_existing_key() {
        let f = fixture().await;
        f.engine.get(&KeyRequest::new("1")).await.unwrap();
        f.engine.drain().await;

        let (_, info) = f
            .engine
            .prepare(&KeyRequest::new("1").with_expire("-10"))
            .await
            .unwrap();
        assert_eq!(info.expire, "-10");
        assert_eq!(info.expire_old, "3600");
        assert!(info.has_pending_expire());
    }

    #[tokio::test]
    async fn test_batch_skips_bad_items() {
        let f = fixture().await;
        let results = f
            .engine
            .get_many(&KeyRequest::new(""), &["1", "", "404", "2"])
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap()["name"], "Ada");
        assert!(results[1].is_none());
        assert!(results[2].is_none());
        assert_eq!(results[3].as_ref().unwrap()["name"], "Alan");
    }

    #[tokio::test]
    async fn test_batch_treats_empty_value_as_hit() {
        let f = fixture().await;
        f.engine.put(&KeyRequest::new("7"), json!({})).await.unwrap();

        let single = f.engine.get(&KeyRequest::new("7")).await.unwrap();
        let batch = f.engine.get_many(&KeyRequest::new(""), &["7"]).await.unwrap();
        assert_eq!(batch, vec![Some(single)]);
    }

    #[tokio::test]
    async fn test_get_of_generated_id_is_rejected() {
        let f = fixture().await;
        let err = f.engine.get(&KeyRequest::generated()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
