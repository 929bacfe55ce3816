// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the database tier.
//!
//! Generic row access over the sqlx `Any` driver (MySQL and SQLite). Rows
//! come back as ordered JSON field maps; parameters are bound from JSON
//! values:
//!
//! | JSON     | bound as        |
//! |----------|-----------------|
//! | null     | NULL            |
//! | bool     | BOOLEAN         |
//! | integer  | BIGINT          |
//! | float    | DOUBLE          |
//! | string   | TEXT            |
//! | array/object | JSON text   |
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns arrive as BLOB through `Any`, so text decoding falls
//! back to bytes. Schema introspection is dialect specific:
//! `information_schema` on MySQL, `pragma_*` table functions on SQLite.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _};

use super::traits::{Row, SchemaIntrospector, SqlBackend, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect, retrying unreachable servers a few times. A refused login
    /// or a bad URL fails at once.
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::connect(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(sql_error)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    /// Run a statement without parameters (DDL, fixtures). Returns affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64, StorageError> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(sql_error)
    }

    async fn fetch_rows(&self, op: &str, sql: &str, params: &[Value]) -> Result<Vec<AnyRow>, StorageError> {
        retry(op, &RetryConfig::command(), || async {
            bind_all(sqlx::query(sql), params)
                .fetch_all(&self.pool)
                .await
                .map_err(sql_error)
        })
        .await
    }

    async fn sqlite_indexes(&self, table: &str) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        let name = Value::String(table.to_string());
        let mut indexes = Vec::new();

        // Rowid primary keys never show up in pragma_index_list.
        let pk_rows = self
            .fetch_rows(
                "sql_pk_columns",
                "SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk",
                std::slice::from_ref(&name),
            )
            .await?;
        let pk: Vec<String> = pk_rows.iter().filter_map(|r| text_at(r, 0)).collect();
        if !pk.is_empty() {
            indexes.push(("PRIMARY".to_string(), pk));
        }

        let index_rows = self
            .fetch_rows(
                "sql_index_list",
                "SELECT name FROM pragma_index_list(?) WHERE \"unique\" = 1 AND origin != 'pk'",
                std::slice::from_ref(&name),
            )
            .await?;
        for index_name in index_rows.iter().filter_map(|r| text_at(r, 0)) {
            let column_rows = self
                .fetch_rows(
                    "sql_index_info",
                    "SELECT name FROM pragma_index_info(?) ORDER BY seqno",
                    &[Value::String(index_name.clone())],
                )
                .await?;
            let columns: Vec<String> = column_rows.iter().filter_map(|r| text_at(r, 0)).collect();
            if !columns.is_empty() {
                indexes.push((index_name, columns));
            }
        }
        Ok(indexes)
    }

    async fn mysql_indexes(&self, table: &str) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        let rows = self
            .fetch_rows(
                "sql_index_list",
                "SELECT INDEX_NAME, COLUMN_NAME FROM information_schema.STATISTICS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND NON_UNIQUE = 0 \
                 ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                &[Value::String(table.to_string())],
            )
            .await?;

        let mut indexes: Vec<(String, Vec<String>)> = Vec::new();
        for row in &rows {
            let (Some(index), Some(column)) = (text_at(row, 0), text_at(row, 1)) else {
                continue;
            };
            match indexes.iter_mut().find(|(name, _)| *name == index) {
                Some((_, columns)) => columns.push(column),
                None => indexes.push((index, vec![column])),
            }
        }
        Ok(indexes)
    }
}

#[async_trait]
impl SchemaIntrospector for SqlStore {
    async fn table_indexes(&self, table: &str) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        validate_identifier(table)?;
        if self.is_sqlite {
            self.sqlite_indexes(table).await
        } else {
            self.mysql_indexes(table).await
        }
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<(String, String)>, StorageError> {
        validate_identifier(table)?;
        let sql = if self.is_sqlite {
            "SELECT name, type FROM pragma_table_info(?) ORDER BY cid"
        } else {
            "SELECT COLUMN_NAME, DATA_TYPE FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION"
        };
        let rows = self
            .fetch_rows("sql_table_columns", sql, &[Value::String(table.to_string())])
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| Some((text_at(r, 0)?, text_at(r, 1).unwrap_or_default())))
            .collect())
    }
}

#[async_trait]
impl SqlBackend for SqlStore {
    async fn select(
        &self,
        table: &str,
        clause: &str,
        params: &[Value],
        limit: Option<u32>,
    ) -> Result<Vec<Row>, StorageError> {
        validate_identifier(table)?;
        let mut sql = format!("SELECT * FROM {}", table);
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = self.fetch_rows("sql_select", &sql, params).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<Option<i64>, StorageError> {
        validate_identifier(table)?;
        if row.is_empty() {
            return Err(StorageError::InvalidInput(format!("Refusing empty insert into {}", table)));
        }
        for column in row.keys() {
            validate_identifier(column)?;
        }

        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", table, columns.join(", "), placeholders);
        let values: Vec<Value> = row.values().cloned().collect();

        // Runs once: the row may have landed before the error surfaced.
        let result = bind_all(sqlx::query(&sql), &values)
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(result.last_insert_id())
    }

    async fn update(&self, table: &str, row: &Row, clause: &str, params: &[Value]) -> Result<u64, StorageError> {
        validate_identifier(table)?;
        if row.is_empty() {
            return Ok(0);
        }
        if clause.is_empty() {
            return Err(StorageError::InvalidInput(format!("Refusing unfiltered update of {}", table)));
        }
        for column in row.keys() {
            validate_identifier(column)?;
        }

        let assignments: Vec<String> = row.keys().map(|c| format!("{} = ?", c)).collect();
        let sql = format!("UPDATE {} SET {} WHERE {}", table, assignments.join(", "), clause);
        let mut values: Vec<Value> = row.values().cloned().collect();
        values.extend_from_slice(params);

        retry("sql_update", &RetryConfig::command(), || async {
            bind_all(sqlx::query(&sql), &values)
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
                .map_err(sql_error)
        })
        .await
    }

    async fn delete(&self, table: &str, clause: &str, params: &[Value]) -> Result<u64, StorageError> {
        validate_identifier(table)?;
        if clause.is_empty() {
            return Err(StorageError::InvalidInput(format!("Refusing unfiltered delete from {}", table)));
        }
        let sql = format!("DELETE FROM {} WHERE {}", table, clause);

        retry("sql_delete", &RetryConfig::command(), || async {
            bind_all(sqlx::query(&sql), params)
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
                .map_err(sql_error)
        })
        .await
    }
}

/// Table and column names are spliced into statements.
pub fn validate_identifier(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidInput(format!("Invalid SQL identifier '{}'", name)))
    }
}

/// Lock contention and lost connections are worth another attempt; any
/// other answer from the database is final.
fn sql_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("locked") || lowered.contains("deadlock") || lowered.contains("busy") {
                StorageError::Backend(message)
            } else {
                StorageError::Rejected(message)
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            StorageError::Backend(e.to_string())
        }
        other => StorageError::Rejected(other.to_string()),
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in params {
        query = bind_value(query, value);
    }
    query
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn decode_row(row: &AnyRow) -> Row {
    let mut map = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_value(row, idx));
    }
    map
}

/// Try the column as integer, float, text, then raw bytes.
fn decode_value(row: &AnyRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(idx) {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Some(s) = text_at(row, idx) {
        return Value::String(s);
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(idx) {
        return Value::Bool(b);
    }
    Value::Null
}

fn text_at(row: &AnyRow, idx: usize) -> Option<String> {
    row.try_get::<String, _>(idx).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(idx)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
    })
}
