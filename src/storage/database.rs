// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database tier: the durable source of truth.
//!
//! Every operation first runs the [`RoutingResolver`] so the KeyInfo carries
//! table, clause and params. Standard keys map to one row; query-backed keys
//! map to the row set of their query, stored as an array under
//! [`VALUE_FIELD`], and are read-only here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::traits::{Repository, Row, SqlBackend};
use crate::error::{EngineError, Result};
use crate::key_info::{KeyInfo, SchemaMemo};
use crate::kv_pair::{KvPair, VALUE_FIELD};
use crate::routing::RoutingResolver;

pub struct DatabaseRepository {
    sql: Arc<dyn SqlBackend>,
    resolver: Arc<RoutingResolver>,
}

impl DatabaseRepository {
    pub fn new(sql: Arc<dyn SqlBackend>, resolver: Arc<RoutingResolver>) -> Self {
        Self { sql, resolver }
    }

    /// Copy a generated primary key back into the record once
    /// [`save`](Repository::save) has routed it by that key.
    ///
    /// Returns whether the record changed.
    pub fn backfill(pair: &mut KvPair, key_info: &KeyInfo) -> bool {
        let SchemaMemo::Known(index) = &key_info.primary_index else {
            return false;
        };
        match (index.as_slice(), key_info.params.as_slice()) {
            ([column], [value]) if !pair.data.contains_key(column) && key_info.clause == format!("{} = ?", column) => {
                pair.data.insert(column.clone(), value.clone());
                true
            }
            _ => false,
        }
    }

    fn is_read_only(key_info: &KeyInfo) -> bool {
        key_info.is_query_backed() || key_info.query_info.as_ref().is_some_and(|q| q.is_valid())
    }
}

#[async_trait]
impl Repository for DatabaseRepository {
    fn tier(&self) -> &'static str {
        "database"
    }

    async fn find(&self, pair: &mut KvPair, key_info: &mut KeyInfo) -> Result<bool> {
        self.resolver.resolve(pair, key_info).await?;

        if key_info.is_query_backed() {
            let limit = key_info.query_info.as_ref().and_then(|q| q.limit);
            let rows = self
                .sql
                .select(&key_info.table, &key_info.clause, &key_info.params, limit)
                .await?;
            debug!(id = %pair.id_type, table = %key_info.table, rows = rows.len(), "Query-backed select");

            let mut data = Map::new();
            data.insert(
                VALUE_FIELD.to_string(),
                Value::Array(rows.into_iter().map(Value::Object).collect()),
            );
            pair.data = data;
            return Ok(true);
        }

        let row = self
            .sql
            .select(&key_info.table, &key_info.clause, &key_info.params, Some(1))
            .await?
            .into_iter()
            .next();
        match row {
            Some(row) => {
                pair.data = row;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Upsert: UPDATE by the resolved clause, INSERT when no row matches.
    /// Only columns the table knows are written.
    async fn save(&self, pair: &KvPair, key_info: &mut KeyInfo) -> Result<bool> {
        if Self::is_read_only(key_info) {
            return Err(EngineError::bad_request(format!(
                "{} is query-backed and cannot be written",
                pair.id_type
            )));
        }
        self.resolver.resolve(pair, key_info).await?;

        let table = key_info.table.clone();
        let columns = self.resolver.table_columns(&table, key_info).await?;
        let row: Row = pair
            .data
            .iter()
            .filter(|(name, _)| columns.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if row.is_empty() {
            return Err(EngineError::bad_request(format!(
                "{} carries no column of table '{}'",
                pair.id_type, table
            )));
        }

        let updated = self
            .sql
            .update(&table, &row, &key_info.clause, &key_info.params)
            .await?;
        if updated > 0 {
            return Ok(true);
        }

        // MySQL reports 0 affected rows when nothing changed.
        let existing = self
            .sql
            .select(&table, &key_info.clause, &key_info.params, Some(1))
            .await?;
        if !existing.is_empty() {
            return Ok(true);
        }

        let generated = self.sql.insert(&table, &row).await?;
        debug!(id = %pair.id_type, table = %table, ?generated, "Inserted row");

        if let (Some(generated), SchemaMemo::Known(index)) = (generated, &key_info.primary_index) {
            if let [column] = index.as_slice() {
                if !row.contains_key(column) {
                    key_info.clause = format!("{} = ?", column);
                    key_info.params = vec![Value::from(generated)];
                    key_info.is_new = true;
                }
            }
        }
        Ok(true)
    }

    async fn delete(&self, pair: &KvPair, key_info: &KeyInfo) -> Result<()> {
        if Self::is_read_only(key_info) {
            debug!(id = %pair.id_type, "Skipping database delete of query-backed key");
            return Ok(());
        }
        let mut key_info = key_info.clone();
        self.resolver.resolve(pair, &mut key_info).await?;
        let deleted = self
            .sql
            .delete(&key_info.table, &key_info.clause, &key_info.params)
            .await?;
        debug!(id = %pair.id_type, deleted, "Deleted rows");
        Ok(())
    }
}
