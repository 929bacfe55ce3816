// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identified data records.
//!
//! A [`KvPair`] is the unit every tier reads and writes: a composite
//! [`KvIdType`] identity plus an ordered field map. Scalar values are folded
//! into the same shape under [`VALUE_FIELD`] so that one representation covers
//! both table rows and plain values.
//!
//! # Example
//!
//! ```
//! use kv_query_cache::{KvPair, KvIdType};
//! use serde_json::json;
//!
//! let row = KvPair::from_value(KvIdType::data("12467"), json!({"id": 12467, "name": "Ada"}));
//! assert_eq!(row.data["name"], "Ada");
//!
//! let scalar = KvPair::from_value(KvIdType::data("counter"), json!(42));
//! assert_eq!(scalar.value(), json!(42));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default record kind.
pub const DEFAULT_KIND: &str = "data";

/// Reserved field holding a scalar (non-object) value.
pub const VALUE_FIELD: &str = "_value";

/// Composite identity: the same id may exist once per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvIdType {
    pub id: String,
    pub kind: String,
}

impl KvIdType {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { id: id.into(), kind: kind.into() }
    }

    /// Identity in the default `data` kind.
    pub fn data(id: impl Into<String>) -> Self {
        Self::new(id, DEFAULT_KIND)
    }

    /// Storage key shared by every cache tier: `{kind}:{id}`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }

    /// Inverse of [`key`](Self::key). The kind never contains `:`, the id may.
    pub fn parse_key(key: &str) -> Option<Self> {
        let (kind, id) = key.split_once(':')?;
        if kind.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(id, kind))
    }
}

impl std::fmt::Display for KvIdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// An identified record with an ordered field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvPair {
    pub id_type: KvIdType,
    pub data: Map<String, Value>,
}

impl KvPair {
    /// Empty record, ready to be filled by a tier's `find`.
    pub fn new(id_type: KvIdType) -> Self {
        Self { id_type, data: Map::new() }
    }

    /// Wrap a logical value. Objects become the field map, anything else
    /// lands under [`VALUE_FIELD`].
    pub fn from_value(id_type: KvIdType, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert(VALUE_FIELD.to_string(), other);
                map
            }
        };
        Self { id_type, data }
    }

    pub fn id(&self) -> &str {
        &self.id_type.id
    }

    pub fn key(&self) -> String {
        self.id_type.key()
    }

    /// Logical value: the scalar when only [`VALUE_FIELD`] is set, else the
    /// whole field map.
    pub fn value(&self) -> Value {
        if self.data.len() == 1 {
            if let Some(v) = self.data.get(VALUE_FIELD) {
                return v.clone();
            }
        }
        Value::Object(self.data.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Index-aligned list of records, paired with an [`AnyKey`](crate::key_info::AnyKey).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvPairs {
    items: Vec<KvPair>,
}

impl KvPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty records for each id, all of the same kind.
    pub fn for_ids<S: AsRef<str>>(ids: &[S], kind: &str) -> Self {
        Self {
            items: ids
                .iter()
                .map(|id| KvPair::new(KvIdType::new(id.as_ref(), kind)))
                .collect(),
        }
    }

    pub fn push(&mut self, pair: KvPair) {
        self.items.push(pair);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&KvPair> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut KvPair> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KvPair> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<KvPair> {
        self.items
    }
}

impl From<Vec<KvPair>> for KvPairs {
    fn from(items: Vec<KvPair>) -> Self {
        Self { items }
    }
}

impl IntoIterator for KvPairs {
    type Item = KvPair;
    type IntoIter = std::vec::IntoIter<KvPair>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
