// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local cache tier.
//!
//! Holds record values and the KeyInfo copies of recently used keys. Each
//! entry lives at most `ttl`, independent of the remote TTL proxies; a
//! background sweep recycles expired entries so idle keys do not pin memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::traits::Repository;
use crate::error::Result;
use crate::key_info::KeyInfo;
use crate::kv_pair::{KvIdType, KvPair};

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct LocalCache {
    values: DashMap<String, Entry<Map<String, Value>>>,
    key_infos: DashMap<String, Entry<KeyInfo>>,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            values: DashMap::new(),
            key_infos: DashMap::new(),
            ttl,
        }
    }

    /// Cached KeyInfo copy, if still live.
    pub fn key_info(&self, id_type: &KvIdType) -> Option<KeyInfo> {
        let now = Instant::now();
        self.key_infos
            .get(&id_type.key())
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    pub fn put_key_info(&self, id_type: &KvIdType, key_info: &KeyInfo) {
        self.key_infos.insert(
            id_type.key(),
            Entry {
                value: key_info.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn contains(&self, id_type: &KvIdType) -> bool {
        let now = Instant::now();
        self.values
            .get(&id_type.key())
            .is_some_and(|e| e.is_live(now))
    }

    /// Drop value and KeyInfo of one key.
    pub fn remove(&self, id_type: &KvIdType) {
        let key = id_type.key();
        self.values.remove(&key);
        self.key_infos.remove(&key);
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Evict every expired entry. Returns how many values were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.values.len();
        self.values.retain(|_, e| e.is_live(now));
        self.key_infos.retain(|_, e| e.is_live(now));
        let evicted = before.saturating_sub(self.values.len());

        crate::metrics::set_local_cache_items(self.values.len());
        if evicted > 0 {
            crate::metrics::record_local_evictions(evicted);
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips to true.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = cache.len(), "Local cache sweep");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Repository for LocalCache {
    fn tier(&self) -> &'static str {
        "local"
    }

    async fn find(&self, pair: &mut KvPair, _key_info: &mut KeyInfo) -> Result<bool> {
        let now = Instant::now();
        match self.values.get(&pair.key()) {
            Some(entry) if entry.is_live(now) => {
                pair.data = entry.value.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save(&self, pair: &KvPair, key_info: &mut KeyInfo) -> Result<bool> {
        let expires_at = Instant::now() + self.ttl;
        self.values.insert(
            pair.key(),
            Entry {
                value: pair.data.clone(),
                expires_at,
            },
        );
        self.key_infos.insert(
            pair.key(),
            Entry {
                value: key_info.clone(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, pair: &KvPair, _key_info: &KeyInfo) -> Result<()> {
        self.remove(&pair.id_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(id: &str, value: Value) -> KvPair {
        KvPair::from_value(KvIdType::data(id), value)
    }

    #[tokio::test]
    async fn test_save_then_find() {
        let cache = LocalCache::new(Duration::from_secs(60));
        let mut info = KeyInfo::new("user_table", "60");
        cache.save(&pair("1", json!({"name": "Ada"})), &mut info).await.unwrap();

        let mut found = KvPair::new(KvIdType::data("1"));
        assert!(cache.find(&mut found, &mut KeyInfo::default()).await.unwrap());
        assert_eq!(found.data["name"], "Ada");

        let cached = cache.key_info(&KvIdType::data("1")).unwrap();
        assert_eq!(cached.table, "user_table");
    }

    #[tokio::test]
    async fn test_miss_leaves_pair_untouched() {
        let cache = LocalCache::new(Duration::from_secs(60));
        let mut missing = KvPair::new(KvIdType::data("nope"));
        assert!(!cache.find(&mut missing, &mut KeyInfo::default()).await.unwrap());
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_kinds_do_not_collide() {
        let cache = LocalCache::new(Duration::from_secs(60));
        let mut info = KeyInfo::default();
        cache
            .save(&KvPair::from_value(KvIdType::new("1", "query"), json!([1])), &mut info)
            .await
            .unwrap();
        assert!(!cache.contains(&KvIdType::data("1")));
        assert!(cache.contains(&KvIdType::new("1", "query")));
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible_and_swept() {
        let cache = LocalCache::new(Duration::from_millis(20));
        let mut info = KeyInfo::default();
        cache.save(&pair("1", json!(1)), &mut info).await.unwrap();
        cache.save(&pair("2", json!(2)), &mut info).await.unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.contains(&KvIdType::data("1")));
        assert!(cache.key_info(&KvIdType::data("1")).is_none());

        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_background_sweeper_evicts() {
        let cache = Arc::new(LocalCache::new(Duration::from_millis(10)));
        let (tx, rx) = watch::channel(false);
        let handle = cache.spawn_sweeper(Duration::from_millis(5), rx);

        let mut info = KeyInfo::default();
        cache.save(&pair("1", json!(1)), &mut info).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_value_and_key_info() {
        let cache = LocalCache::new(Duration::from_secs(60));
        let mut info = KeyInfo::new("t", "60");
        let p = pair("1", json!(1));
        cache.save(&p, &mut info).await.unwrap();
        cache.delete(&p, &info).await.unwrap();
        assert!(!cache.contains(&p.id_type));
        assert!(cache.key_info(&p.id_type).is_none());
    }
}
