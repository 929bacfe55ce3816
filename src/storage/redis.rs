// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis [`CacheBackend`].
//!
//! Records are Redis hashes, proxy keys are plain strings with a native TTL
//! (`SET key value PX ms`). Expirations are observed through keyspace
//! notifications:
//!
//! ```text
//! CONFIG SET notify-keyspace-events Kx
//! PSUBSCRIBE __keyspace@*__:{prefix}{key_prefix}*
//!   → channel "__keyspace@0__:{prefix}ttl::data:42", payload "expired"
//! ```
//!
//! All keys are namespaced with an optional prefix (e.g. `"myapp:"`), which
//! is stripped again from notification channels.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::traits::{CacheBackend, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisBackend {
    client: Client,
    connection: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use kv_query_cache::storage::redis::RedisBackend;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys become "myapp:data:42", "myapp:ttl::data:42", ...
    /// let backend = RedisBackend::with_prefix("redis://localhost", Some("myapp:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::connect(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            client,
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Ask the server to publish expirations. Managed instances may refuse
    /// CONFIG; they must then be configured out of band.
    async fn enable_expiry_notifications(&self) {
        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Kx")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Could not enable keyspace notifications; expecting server config to have them");
        }
    }
}

/// `__keyspace@0__:{key}` → `{key}`.
fn keyspace_channel_key(channel: &str) -> Option<&str> {
    let rest = channel.strip_prefix("__keyspace@")?;
    let (_, key) = rest.split_once("__:")?;
    Some(key)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn hash_get_all(&self, key: &str) -> Result<Option<Vec<(String, String)>>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        let fields: Vec<(String, String)> = retry("redis_hgetall", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { conn.hgetall(&key).await }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        // HGETALL cannot tell a missing key from an empty hash; Redis never
        // keeps empty hashes.
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn hash_get_fields(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hmget", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let values: Vec<Option<String>> = cmd("HMGET").arg(&key).arg(fields).query_async(&mut conn).await?;
                Ok(values)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hash_replace(&self, key: &str, fields: &[(String, String)]) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hash_replace", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.atomic().del(&key).ignore();
                if !fields.is_empty() {
                    pipeline.hset_multiple(&key, fields).ignore();
                }
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn hash_delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_hdel", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: i64 = conn.hdel(&key, fields).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        // PX 0 is rejected by the server.
        let millis = ttl.as_millis().max(1) as u64;

        retry("redis_set_px", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = conn.get(&key).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_exists", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let exists: bool = conn.exists(&key).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::command(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: i64 = conn.del(&key).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn subscribe_expired(
        &self,
        key_prefix: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<String>, StorageError> {
        self.enable_expiry_notifications().await;

        let mut pubsub = retry("redis_pubsub_connect", &RetryConfig::connect(), || async {
            self.client.get_async_pubsub().await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        let pattern = format!("__keyspace@*__:{}{}*", self.prefix, key_prefix);
        pubsub
            .psubscribe(&pattern)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        debug!(pattern = %pattern, "Subscribed to keyspace notifications");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let prefix = self.prefix.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let event: String = match msg.get_payload() {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Undecodable keyspace notification");
                        continue;
                    }
                };
                if event != "expired" {
                    continue;
                }
                let Some(full_key) = keyspace_channel_key(msg.get_channel_name()) else {
                    continue;
                };
                let key = full_key.strip_prefix(prefix.as_str()).unwrap_or(full_key);
                if tx.send(key.to_string()).await.is_err() {
                    return;
                }
            }
            error!("Keyspace notification stream closed");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_channel_key() {
        assert_eq!(
            keyspace_channel_key("__keyspace@0__:app:ttl::data:42"),
            Some("app:ttl::data:42")
        );
        assert_eq!(keyspace_channel_key("__keyspace@15__:k"), Some("k"));
        assert_eq!(keyspace_channel_key("__keyevent@0__:expired"), None);
    }
}
