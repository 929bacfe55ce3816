// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structured filters over a single table.
//!
//! # Architecture
//!
//! ```text
//! raw query params  ──parser──▶  QueryInfo { table, conditions, limit }
//!                                      │
//!                                      ├──key()────▶ content hash (query association id)
//!                                      └──clause───▶ "col op ? AND ..." + params
//! ```
//!
//! Only conjunctive column filters are supported: every column contributes
//! one parenthesized expression and columns are joined with `AND`.
//!
//! # Example
//!
//! ```
//! use kv_query_cache::query::{QueryInfo, build_clause};
//! use serde_json::{json, Value};
//!
//! let params = vec![
//!     ("id".to_string(), vec!["1".to_string(), "2".to_string(), "3".to_string()]),
//!     ("limit".to_string(), vec!["2".to_string()]),
//! ];
//! let query = QueryInfo::from_params("user_table", &params).unwrap();
//! assert_eq!(query.limit, Some(2));
//!
//! let mut bound = Vec::new();
//! let clause = build_clause(&query, &mut bound, &Value::Null);
//! assert_eq!(clause, "(id = ? OR id = ? OR id = ?)");
//! assert_eq!(bound, vec![json!(1), json!(2), json!(3)]);
//! ```

mod clause;
mod parser;

pub use clause::{build_clause, coerce_param, is_unary_operator, UNARY_OPERATORS};
pub use parser::{parse_conditions, QueryParams, OPERATOR_TOKENS};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Operator groups applying to one column, in insertion order.
///
/// Several operators may constrain the same column (`age > 18 AND age < 65`);
/// within an operator, values are kept unique and ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    groups: Vec<(String, Vec<String>)>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append values to the operator's group, skipping exact duplicates.
    pub fn push<I>(&mut self, operator: &str, values: I)
    where
        I: IntoIterator<Item = String>,
    {
        let idx = match self.groups.iter().position(|(op, _)| op == operator) {
            Some(idx) => idx,
            None => {
                self.groups.push((operator.to_string(), Vec::new()));
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[idx].1;
        for value in values {
            if !group.contains(&value) {
                group.push(value);
            }
        }
    }

    pub fn values(&self, operator: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|(op, _)| op == operator)
            .map(|(_, values)| values.as_slice())
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups.iter().map(|(op, values)| (op.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Table, per-column conditions and an optional row limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub table: String,
    conditions: Vec<(String, Condition)>,
    pub limit: Option<u32>,
}

impl QueryInfo {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            limit: None,
        }
    }

    /// Parse raw request parameters into a query over `table`.
    pub fn from_params(table: impl Into<String>, params: &QueryParams) -> Result<Self> {
        let mut query = Self::new(table);
        parse_conditions(&mut query, params)?;
        Ok(query)
    }

    /// Merge `(operator, values)` into the column's condition.
    pub fn add_condition<I>(&mut self, column: &str, operator: &str, values: I)
    where
        I: IntoIterator<Item = String>,
    {
        match self.conditions.iter_mut().find(|(col, _)| col == column) {
            Some((_, condition)) => condition.push(operator, values),
            None => {
                let mut condition = Condition::new();
                condition.push(operator, values);
                self.conditions.push((column.to_string(), condition));
            }
        }
    }

    pub fn condition(&self, column: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|(col, _)| col == column)
            .map(|(_, condition)| condition)
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(col, condition)| (col.as_str(), condition))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|(col, _)| col.as_str())
    }

    /// A query needs a limit or at least one condition to select anything.
    pub fn is_valid(&self) -> bool {
        self.limit.is_some() || !self.conditions.is_empty()
    }

    /// Content hash over table, conditions and limit (hex SHA-256).
    ///
    /// Equal shapes hash equally regardless of which record id they were
    /// issued for, so the hash doubles as the query association id.
    pub fn key(&self) -> String {
        const SEP: [u8; 1] = [0x1f];
        let mut hasher = Sha256::new();
        hasher.update(self.table.as_bytes());
        for (column, condition) in &self.conditions {
            hasher.update(SEP);
            hasher.update(column.as_bytes());
            for (op, values) in condition.groups() {
                hasher.update(SEP);
                hasher.update(op.as_bytes());
                for value in values {
                    hasher.update(SEP);
                    hasher.update(value.as_bytes());
                }
            }
        }
        hasher.update(SEP);
        if let Some(limit) = self.limit {
            hasher.update(limit.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_condition_dedups_within_operator() {
        let mut condition = Condition::new();
        condition.push("=", strings(&["1", "2"]));
        condition.push("=", strings(&["2", "3"]));
        assert_eq!(condition.values("="), Some(strings(&["1", "2", "3"]).as_slice()));
        assert_eq!(condition.len(), 1);
    }

    #[test]
    fn test_condition_keeps_operator_order() {
        let mut condition = Condition::new();
        condition.push(">", strings(&["10"]));
        condition.push("<", strings(&["20"]));
        let ops: Vec<&str> = condition.groups().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![">", "<"]);
    }

    #[test]
    fn test_is_valid_requires_limit_or_condition() {
        let mut query = QueryInfo::new("t");
        assert!(!query.is_valid());
        query.limit = Some(5);
        assert!(query.is_valid());

        let mut query = QueryInfo::new("t");
        query.add_condition("a", "=", strings(&["1"]));
        assert!(query.is_valid());
    }

    #[test]
    fn test_key_is_stable_and_content_sensitive() {
        let mut a = QueryInfo::new("users");
        a.add_condition("id", "=", strings(&["1", "2"]));
        let mut b = QueryInfo::new("users");
        b.add_condition("id", "=", strings(&["1", "2"]));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 64);

        b.limit = Some(1);
        assert_ne!(a.key(), b.key());

        let mut c = QueryInfo::new("accounts");
        c.add_condition("id", "=", strings(&["1", "2"]));
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut query = QueryInfo::new("users");
        query.add_condition("age", ">", strings(&["18"]));
        query.add_condition("age", "<", strings(&["65"]));
        query.limit = Some(10);

        let json = serde_json::to_string(&query).unwrap();
        let back: QueryInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, query);
        assert_eq!(back.key(), query.key());
    }
}
