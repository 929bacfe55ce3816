// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing resolver: decides which table, WHERE clause and bound parameters
//! address a record in the database.
//!
//! # Resolution order
//!
//! ```text
//! valid QueryInfo attached   → query-backed: clause from the conditions,
//!                              empty values bound to the record id
//! Resolved key, stored clause → reuse it
//! otherwise                  → primary index (PRIMARY, else first unique):
//!                                all index columns in the record → c1 = ? AND c2 = ?
//!                                stored clause with matching width → reuse
//!                                some columns in the record       → degraded clause
//!                                none, single-column index        → index column = id
//! ```
//!
//! Schema lookups are memoized per table on the resolver and copied into the
//! KeyInfo's own memo fields.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::key_info::{KeyInfo, QueryKeyState, SchemaMemo};
use crate::kv_pair::KvPair;
use crate::query::{build_clause, coerce_param};
use crate::storage::traits::SchemaIntrospector;

pub struct RoutingResolver {
    schema: Arc<dyn SchemaIntrospector>,
    default_table: Option<String>,
    indexes: DashMap<String, SchemaMemo<Vec<String>>>,
    columns: DashMap<String, SchemaMemo<Vec<String>>>,
}

impl RoutingResolver {
    pub fn new(schema: Arc<dyn SchemaIntrospector>, default_table: Option<String>) -> Self {
        Self {
            schema,
            default_table,
            indexes: DashMap::new(),
            columns: DashMap::new(),
        }
    }

    /// Fill `key_info.table`, `clause`, `params` and `query_key` for `pair`.
    pub async fn resolve(&self, pair: &KvPair, key_info: &mut KeyInfo) -> Result<()> {
        let table = self.table_for(key_info)?;

        if key_info.primary_index == SchemaMemo::Missing {
            return Err(EngineError::server(format!("table '{}' has no usable unique index", table)));
        }

        if let Some(query) = key_info.query_info.take() {
            if query.is_valid() {
                let columns = self.table_columns(&table, key_info).await?;
                let unknown = query
                    .columns()
                    .find(|c| !columns.iter().any(|known| known == c))
                    .map(str::to_string);
                if let Some(unknown) = unknown {
                    key_info.query_info = Some(query);
                    return Err(EngineError::bad_request(format!(
                        "unknown column '{}' in table '{}'",
                        unknown, table
                    )));
                }

                let mut params = Vec::new();
                key_info.clause = build_clause(&query, &mut params, &coerce_param(pair.id()));
                key_info.params = params;
                key_info.query_key = QueryKeyState::Resolved(query.key());
                key_info.query_info = Some(query);
                return Ok(());
            }
            debug!(id = %pair.id_type, "Dropping query without conditions or limit");
            key_info.query_key = QueryKeyState::NotQueryBacked;
        } else if key_info.is_query_backed() && !key_info.clause.is_empty() {
            return Ok(());
        }

        self.resolve_standard(pair, key_info, &table).await
    }

    async fn resolve_standard(&self, pair: &KvPair, key_info: &mut KeyInfo, table: &str) -> Result<()> {
        let index = match self.primary_index(table, key_info).await? {
            Some(index) => index,
            None => {
                key_info.primary_index = SchemaMemo::Missing;
                key_info.query_key = QueryKeyState::NotQueryBacked;
                warn!(table, id = %pair.id_type, "No primary or unique index, record is unreachable");
                return Err(EngineError::server(format!(
                    "table '{}' has no usable unique index",
                    table
                )));
            }
        };
        if key_info.query_key == QueryKeyState::Unresolved {
            key_info.query_key = QueryKeyState::NotQueryBacked;
        }

        let available: Vec<&String> = index.iter().filter(|c| pair.data.contains_key(*c)).collect();

        if available.len() == index.len() {
            key_info.clause = equality_clause(&index);
            key_info.params = index.iter().map(|c| pair.data[c].clone()).collect();
            return Ok(());
        }

        if !key_info.clause.is_empty() && key_info.params.len() == index.len() {
            return Ok(());
        }

        if available.is_empty() {
            if let [column] = index.as_slice() {
                key_info.clause = format!("{} = ?", column);
                key_info.params = vec![coerce_param(pair.id())];
                return Ok(());
            }
            return Err(EngineError::bad_request(format!(
                "record carries none of the index columns {:?} of '{}'",
                index, table
            )));
        }

        // Degraded: only the index columns the record carries.
        let columns: Vec<String> = available.iter().map(|c| c.to_string()).collect();
        key_info.clause = equality_clause(&columns);
        key_info.params = columns.iter().map(|c| pair.data[c].clone()).collect();
        Ok(())
    }

    fn table_for(&self, key_info: &mut KeyInfo) -> Result<String> {
        if key_info.table.is_empty() {
            match &self.default_table {
                Some(table) => key_info.table = table.clone(),
                None => return Err(EngineError::bad_request("no table given and no default table configured")),
            }
        }
        Ok(key_info.table.clone())
    }

    /// Primary key columns, else the first unique index; `None` when the
    /// table offers neither.
    pub async fn primary_index(&self, table: &str, key_info: &mut KeyInfo) -> Result<Option<Vec<String>>> {
        if let SchemaMemo::Known(index) = &key_info.primary_index {
            return Ok(Some(index.clone()));
        }

        let memo = match self.indexes.get(table).map(|m| m.clone()) {
            Some(memo) => memo,
            None => {
                let indexes = self.schema.table_indexes(table).await?;
                let primary = indexes
                    .iter()
                    .find(|(name, _)| name == "PRIMARY")
                    .or_else(|| indexes.first())
                    .map(|(_, columns)| columns.clone())
                    .filter(|columns| !columns.is_empty());
                let memo = match primary {
                    Some(columns) => SchemaMemo::Known(columns),
                    None => SchemaMemo::Missing,
                };
                self.indexes.insert(table.to_string(), memo.clone());
                memo
            }
        };

        key_info.primary_index = memo.clone();
        Ok(match memo {
            SchemaMemo::Known(columns) => Some(columns),
            _ => None,
        })
    }

    /// Column names of the table. An unknown table is a bad request.
    pub async fn table_columns(&self, table: &str, key_info: &mut KeyInfo) -> Result<Vec<String>> {
        if let SchemaMemo::Known(columns) = &key_info.columns {
            return Ok(columns.clone());
        }

        let memo = match self.columns.get(table).map(|m| m.clone()) {
            Some(memo) => memo,
            None => {
                let columns: Vec<String> = self
                    .schema
                    .table_columns(table)
                    .await?
                    .into_iter()
                    .map(|(name, _)| name)
                    .collect();
                let memo = if columns.is_empty() {
                    SchemaMemo::Missing
                } else {
                    SchemaMemo::Known(columns)
                };
                self.columns.insert(table.to_string(), memo.clone());
                memo
            }
        };

        key_info.columns = memo.clone();
        match memo {
            SchemaMemo::Known(columns) => Ok(columns),
            _ => Err(EngineError::bad_request(format!("unknown table '{}'", table))),
        }
    }

    /// Forget memoized schema, e.g. after a migration.
    pub fn invalidate(&self, table: &str) {
        self.indexes.remove(table);
        self.columns.remove(table);
    }
}

fn equality_clause(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(" AND ")
}
