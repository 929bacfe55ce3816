// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`CacheBackend`].
//!
//! Mirrors the Redis semantics the engine relies on: hashes, string keys with
//! a native TTL, and an expiration event per key whose TTL runs out. Used
//! when no `redis_url` is configured and as the remote tier in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::traits::{CacheBackend, StorageError};

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    generation: u64,
}

pub struct InMemoryCacheBackend {
    hashes: DashMap<String, Vec<(String, String)>>,
    strings: Arc<DashMap<String, StringEntry>>,
    generation: AtomicU64,
    events: broadcast::Sender<String>,
    /// Mutating commands in issue order, e.g. `"SET ttl::data:1"`.
    /// Only kept when built with [`with_command_log`](Self::with_command_log).
    command_log: Option<Mutex<Vec<String>>>,
}

impl InMemoryCacheBackend {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            hashes: DashMap::new(),
            strings: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            events,
            command_log: None,
        }
    }

    /// A backend that records every mutating command, for asserting the
    /// exact command sequence in tests.
    #[must_use]
    pub fn with_command_log() -> Self {
        Self {
            command_log: Some(Mutex::new(Vec::new())),
            ..Self::new()
        }
    }

    /// Number of hash records.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    /// Snapshot of the mutating commands issued so far; empty when the
    /// log is off.
    #[must_use]
    pub fn command_log(&self) -> Vec<String> {
        self.command_log.as_ref().map(|log| log.lock().clone()).unwrap_or_default()
    }

    pub fn clear_command_log(&self) {
        if let Some(log) = &self.command_log {
            log.lock().clear();
        }
    }

    /// Expire a string key immediately, as if its TTL ran out.
    pub fn expire_now(&self, key: &str) -> bool {
        let expired = self.strings.remove(key).is_some();
        if expired {
            let _ = self.events.send(key.to_string());
        }
        expired
    }

    fn log(&self, command: &str, key: &str) {
        if let Some(log) = &self.command_log {
            log.lock().push(format!("{} {}", command, key));
        }
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn hash_get_all(&self, key: &str) -> Result<Option<Vec<(String, String)>>, StorageError> {
        Ok(self.hashes.get(key).map(|r| r.value().clone()))
    }

    async fn hash_get_fields(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        let hash = self.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| {
                hash.as_ref()
                    .and_then(|h| h.iter().find(|(name, _)| name == f).map(|(_, v)| v.clone()))
            })
            .collect())
    }

    async fn hash_replace(&self, key: &str, fields: &[(String, String)]) -> Result<(), StorageError> {
        self.log("HSET", key);
        if fields.is_empty() {
            self.hashes.remove(key);
        } else {
            self.hashes.insert(key.to_string(), fields.to_vec());
        }
        Ok(())
    }

    async fn hash_delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError> {
        self.log("HDEL", key);
        let now_empty = match self.hashes.get_mut(key) {
            Some(mut hash) => {
                hash.retain(|(name, _)| !fields.contains(name));
                hash.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.hashes.remove(key);
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.log("SET", key);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.strings.insert(
            key.to_string(),
            StringEntry { value: value.to_string(), generation },
        );

        let strings = Arc::clone(&self.strings);
        let events = self.events.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            // Only the write that armed this timer may expire the key.
            if strings.remove_if(&key, |_, e| e.generation == generation).is_some() {
                let _ = events.send(key);
            }
        });
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.strings.get(key).map(|r| r.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.strings.contains_key(key) || self.hashes.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.log("DEL", key);
        let removed_string = self.strings.remove(key).is_some();
        let removed_hash = self.hashes.remove(key).is_some();
        Ok(removed_string || removed_hash)
    }

    async fn subscribe_expired(
        &self,
        key_prefix: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<String>, StorageError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let prefix = key_prefix.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(key) if key.starts_with(&prefix) => {
                        if tx.send(key).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Expiration subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_hash_replace_and_get() {
        let backend = InMemoryCacheBackend::new();
        backend.hash_replace("data:1", &fields(&[("a", "1"), ("b", "2")])).await.unwrap();
        backend.hash_replace("data:1", &fields(&[("a", "3")])).await.unwrap();

        let all = backend.hash_get_all("data:1").await.unwrap().unwrap();
        assert_eq!(all, fields(&[("a", "3")]));

        let selected = backend
            .hash_get_fields("data:1", &["a".to_string(), "zz".to_string()])
            .await
            .unwrap();
        assert_eq!(selected, vec![Some("3".to_string()), None]);
    }

    #[tokio::test]
    async fn test_missing_hash_is_none() {
        let backend = InMemoryCacheBackend::new();
        assert!(backend.hash_get_all("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_delete_fields_drops_empty_hash() {
        let backend = InMemoryCacheBackend::new();
        backend.hash_replace("k", &fields(&[("a", "1")])).await.unwrap();
        backend.hash_delete_fields("k", &["a".to_string()]).await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_key_expires_and_notifies() {
        let backend = InMemoryCacheBackend::new();
        let mut rx = backend.subscribe_expired("ttl::", 8).await.unwrap();

        backend.set_with_ttl("other", "x", Duration::from_millis(10)).await.unwrap();
        backend.set_with_ttl("ttl::data:1", "60", Duration::from_millis(20)).await.unwrap();
        assert_eq!(backend.get_string("ttl::data:1").await.unwrap().as_deref(), Some("60"));

        let key = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "ttl::data:1");
        assert!(!backend.exists("ttl::data:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rearm_supersedes_old_timer() {
        let backend = InMemoryCacheBackend::new();
        backend.set_with_ttl("k", "1", Duration::from_millis(20)).await.unwrap();
        backend.set_with_ttl("k", "2", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.get_string("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_command_log_records_mutations() {
        let backend = InMemoryCacheBackend::with_command_log();
        backend.set_with_ttl("k", "1", Duration::from_secs(60)).await.unwrap();
        backend.delete("k").await.unwrap();
        assert_eq!(backend.command_log(), vec!["SET k", "DEL k"]);
        backend.clear_command_log();
        assert!(backend.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_default_backend_keeps_no_command_log() {
        let backend = InMemoryCacheBackend::new();
        for i in 0..1000 {
            let key = format!("data:{}", i);
            backend.hash_replace(&key, &fields(&[("a", "1")])).await.unwrap();
            backend.delete(&key).await.unwrap();
        }
        assert_eq!(backend.hash_count(), 0);
        assert!(backend.command_log().is_empty());
        assert!(backend.command_log.is_none());
    }

    #[tokio::test]
    async fn test_expire_now() {
        let backend = InMemoryCacheBackend::new();
        let mut rx = backend.subscribe_expired("", 8).await.unwrap();
        backend.set_with_ttl("k", "1", Duration::from_secs(60)).await.unwrap();
        assert!(backend.expire_now("k"));
        assert_eq!(rx.recv().await.as_deref(), Some("k"));
        assert!(!backend.expire_now("k"));
    }
}
