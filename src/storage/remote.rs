// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote cache tier: one hash per record at `{kind}:{id}`, every field
//! JSON-encoded so numbers, nulls and nested values survive the round trip.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::traits::{CacheBackend, Repository, StorageError};
use crate::error::Result;
use crate::key_info::KeyInfo;
use crate::kv_pair::KvPair;

pub struct RemoteCacheRepository {
    backend: Arc<dyn CacheBackend>,
}

impl RemoteCacheRepository {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }
}

pub(crate) fn encode_fields(data: &Map<String, Value>) -> std::result::Result<Vec<(String, String)>, StorageError> {
    data.iter()
        .map(|(name, value)| {
            serde_json::to_string(value)
                .map(|encoded| (name.clone(), encoded))
                .map_err(|e| StorageError::Codec(format!("field '{}': {}", name, e)))
        })
        .collect()
}

pub(crate) fn decode_fields(fields: Vec<(String, String)>) -> std::result::Result<Map<String, Value>, StorageError> {
    fields
        .into_iter()
        .map(|(name, raw)| {
            serde_json::from_str(&raw)
                .map(|value| (name.clone(), value))
                .map_err(|e| StorageError::Codec(format!("field '{}': {}", name, e)))
        })
        .collect()
}

#[async_trait]
impl Repository for RemoteCacheRepository {
    fn tier(&self) -> &'static str {
        "remote"
    }

    async fn find(&self, pair: &mut KvPair, _key_info: &mut KeyInfo) -> Result<bool> {
        match self.backend.hash_get_all(&pair.key()).await? {
            Some(fields) => {
                pair.data = decode_fields(fields)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save(&self, pair: &KvPair, _key_info: &mut KeyInfo) -> Result<bool> {
        let fields = encode_fields(&pair.data)?;
        self.backend.hash_replace(&pair.key(), &fields).await?;
        Ok(true)
    }

    async fn delete(&self, pair: &KvPair, _key_info: &KeyInfo) -> Result<()> {
        self.backend.delete(&pair.key()).await?;
        Ok(())
    }
}
