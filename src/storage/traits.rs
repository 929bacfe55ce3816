// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result as EngineResult;
use crate::key_info::{AnyKey, KeyInfo};
use crate::kv_pair::{KvPair, KvPairs};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    /// The backend could not be reached or did not answer in time.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// The backend answered and refused the statement.
    #[error("Statement rejected: {0}")]
    Rejected(String),
    /// A caller-supplied name cannot be used in a statement.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Codec error: {0}")]
    Codec(String),
}

/// A database row as an ordered field map.
pub type Row = Map<String, Value>;

/// Uniform contract of every tier in the chain.
///
/// `find` fills `pair.data` (and possibly `key_info`) in place and reports
/// whether the tier held the item. Batch variants walk the index-aligned
/// lists, keep going past per-item failures and return the AND of the
/// per-item results.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Tier label for logs and metrics.
    fn tier(&self) -> &'static str;

    async fn find(&self, pair: &mut KvPair, key_info: &mut KeyInfo) -> EngineResult<bool>;
    async fn save(&self, pair: &KvPair, key_info: &mut KeyInfo) -> EngineResult<bool>;
    async fn delete(&self, pair: &KvPair, key_info: &KeyInfo) -> EngineResult<()>;

    /// Per-item hits of a batch lookup; a failed item counts as a miss.
    async fn find_each(&self, pairs: &mut KvPairs, keys: &mut AnyKey) -> Vec<bool> {
        let mut hits = Vec::with_capacity(pairs.len());
        for i in 0..pairs.len() {
            let Some(pair) = pairs.get_mut(i) else { break };
            let key_info = keys.get_any(i);
            match self.find(pair, key_info).await {
                Ok(found) => hits.push(found),
                Err(e) => {
                    warn!(tier = self.tier(), id = %pair.id_type, error = %e, "Batch find failed for item");
                    hits.push(false);
                }
            }
        }
        hits
    }

    async fn find_all(&self, pairs: &mut KvPairs, keys: &mut AnyKey) -> EngineResult<bool> {
        Ok(self.find_each(pairs, keys).await.into_iter().all(|hit| hit))
    }

    async fn save_all(&self, pairs: &KvPairs, keys: &mut AnyKey) -> EngineResult<bool> {
        let mut all = true;
        for (i, pair) in pairs.iter().enumerate() {
            let key_info = keys.get_any(i);
            match self.save(pair, key_info).await {
                Ok(saved) => all &= saved,
                Err(e) => {
                    warn!(tier = self.tier(), id = %pair.id_type, error = %e, "Batch save failed for item");
                    all = false;
                }
            }
        }
        Ok(all)
    }

    async fn delete_all(&self, pairs: &KvPairs, keys: &mut AnyKey) -> EngineResult<bool> {
        let mut all = true;
        for (i, pair) in pairs.iter().enumerate() {
            let key_info = keys.get_any(i);
            if let Err(e) = self.delete(pair, key_info).await {
                warn!(tier = self.tier(), id = %pair.id_type, error = %e, "Batch delete failed for item");
                all = false;
            }
        }
        Ok(all)
    }
}

/// Remote key-value cache primitives: hash-shaped records, plain string keys
/// with native TTL, and key-expiration notifications.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// All fields of a hash in stored order, `None` when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<Option<Vec<(String, String)>>, StorageError>;

    /// Selected fields of a hash, aligned with `fields`.
    async fn hash_get_fields(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StorageError>;

    /// Replace the hash with exactly these fields.
    async fn hash_replace(&self, key: &str, fields: &[(String, String)]) -> Result<(), StorageError>;

    async fn hash_delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete any key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Stream of expired key names starting with `key_prefix`.
    async fn subscribe_expired(
        &self,
        key_prefix: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<String>, StorageError>;
}

/// Schema lookups the routing resolver needs.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// Unique indexes as `(name, columns)`; the primary key is named `PRIMARY`.
    async fn table_indexes(&self, table: &str) -> Result<Vec<(String, Vec<String>)>, StorageError>;

    /// Columns as `(name, type)` in table order.
    async fn table_columns(&self, table: &str) -> Result<Vec<(String, String)>, StorageError>;
}

/// Parameterized statement execution against the relational store.
#[async_trait]
pub trait SqlBackend: SchemaIntrospector {
    async fn select(
        &self,
        table: &str,
        clause: &str,
        params: &[Value],
        limit: Option<u32>,
    ) -> Result<Vec<Row>, StorageError>;

    /// Insert a row, returning the generated key when the table has one.
    async fn insert(&self, table: &str, row: &Row) -> Result<Option<i64>, StorageError>;

    /// Update rows matching the clause. Returns affected rows.
    async fn update(&self, table: &str, row: &Row, clause: &str, params: &[Value]) -> Result<u64, StorageError>;

    /// Delete rows matching the clause. Returns affected rows.
    async fn delete(&self, table: &str, clause: &str, params: &[Value]) -> Result<u64, StorageError>;
}
