// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! KeyInfo persistence: one flat hash per record at
//! `{metadata_kind}:{kind}:{id}`.
//!
//! Writes are gated by [`KeyInfo::is_new`]; a successful write marks the
//! caller's copy persisted so repeated saves of an unchanged record are free.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{CacheBackend, Repository};
use crate::error::Result;
use crate::key_info::KeyInfo;
use crate::kv_pair::{KvIdType, KvPair};

pub struct MetadataRepository {
    backend: Arc<dyn CacheBackend>,
    kind: String,
}

impl MetadataRepository {
    pub fn new(backend: Arc<dyn CacheBackend>, kind: impl Into<String>) -> Self {
        Self { backend, kind: kind.into() }
    }

    /// Metadata key of a record.
    pub fn metadata_key(&self, id_type: &KvIdType) -> String {
        KvIdType::new(id_type.key(), self.kind.as_str()).key()
    }

    /// Stored KeyInfo of a record, if any.
    pub async fn load(&self, id_type: &KvIdType) -> Result<Option<KeyInfo>> {
        match self.backend.hash_get_all(&self.metadata_key(id_type)).await? {
            Some(fields) => {
                let fields: HashMap<String, String> = fields.into_iter().collect();
                Ok(Some(KeyInfo::from_flat_map(&fields)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Repository for MetadataRepository {
    fn tier(&self) -> &'static str {
        "metadata"
    }

    /// Replaces `key_info` with the stored record when there is one.
    async fn find(&self, pair: &mut KvPair, key_info: &mut KeyInfo) -> Result<bool> {
        match self.load(&pair.id_type).await? {
            Some(stored) => {
                *key_info = stored;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save(&self, pair: &KvPair, key_info: &mut KeyInfo) -> Result<bool> {
        if !key_info.is_new {
            return Ok(true);
        }
        let fields = key_info.to_flat_map()?;
        self.backend
            .hash_replace(&self.metadata_key(&pair.id_type), &fields)
            .await?;
        key_info.mark_persisted();
        Ok(true)
    }

    async fn delete(&self, pair: &KvPair, _key_info: &KeyInfo) -> Result<()> {
        self.backend.delete(&self.metadata_key(&pair.id_type)).await?;
        Ok(())
    }
}
