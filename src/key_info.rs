// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key routing and TTL-policy metadata.
//!
//! A [`KeyInfo`] remembers, for one record id, which table and clause reach
//! it in the database, which query shape (if any) it is bound to, and which
//! expire policy applies. It is persisted as a flat string map in the
//! metadata store and cached next to the value in the local cache.
//!
//! # Expire bookkeeping
//!
//! ```text
//! expire == expire_old   committed policy
//! expire != expire_old   pending change, not yet armed/persisted
//!    commit_expire()     → expire_old = expire
//!    rollback_expire()   → expire = expire_old
//!
//! expire == "5", expire_old == "-5"
//!                        armed forced override: later arms slide on the
//!                        magnitude, the signed form stays committed
//! ```

use std::collections::HashMap;

use serde_json::Value;

use crate::query::{coerce_param, QueryInfo};
use crate::storage::traits::StorageError;

/// Association between a key and a stored query shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueryKeyState {
    /// Not looked at yet.
    #[default]
    Unresolved,
    /// Definitively not query-backed (or resolution failed for good).
    NotQueryBacked,
    /// Bound to the query shape with this content hash.
    Resolved(String),
}

impl QueryKeyState {
    const NOT_QUERY_BACKED: &'static str = "null";

    fn to_stored(&self) -> String {
        match self {
            Self::Unresolved => String::new(),
            Self::NotQueryBacked => Self::NOT_QUERY_BACKED.to_string(),
            Self::Resolved(hash) => hash.clone(),
        }
    }

    fn from_stored(raw: &str) -> Self {
        match raw {
            "" => Self::Unresolved,
            Self::NOT_QUERY_BACKED => Self::NotQueryBacked,
            hash => Self::Resolved(hash.to_string()),
        }
    }

    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::Resolved(hash) => Some(hash),
            _ => None,
        }
    }
}

/// Memoized schema lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaMemo<T> {
    #[default]
    Unknown,
    /// The schema had nothing to offer; do not ask again.
    Missing,
    Known(T),
}

/// Routing and policy record for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    pub expire: String,
    pub expire_old: String,
    pub table: String,
    pub clause: String,
    pub params: Vec<Value>,
    pub query_key: QueryKeyState,
    /// Needs to be (re)written to the metadata store.
    pub is_new: bool,
    /// Cached value written since its last successful database write.
    pub unflushed: bool,
    /// Epoch millis.
    pub created_at: i64,
    pub query_info: Option<QueryInfo>,
    pub primary_index: SchemaMemo<Vec<String>>,
    pub columns: SchemaMemo<Vec<String>>,
}

impl Default for KeyInfo {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl KeyInfo {
    pub fn new(table: impl Into<String>, expire: impl Into<String>) -> Self {
        let expire = expire.into();
        Self {
            expire_old: expire.clone(),
            expire,
            table: table.into(),
            clause: String::new(),
            params: Vec::new(),
            query_key: QueryKeyState::Unresolved,
            is_new: true,
            unflushed: false,
            created_at: now_millis(),
            query_info: None,
            primary_index: SchemaMemo::Unknown,
            columns: SchemaMemo::Unknown,
        }
    }

    /// Deep copy for a new batch item: same routing shape, fresh identity.
    pub fn clone_as_new(&self) -> Self {
        let mut copy = self.clone();
        copy.is_new = true;
        copy.unflushed = false;
        copy.params.clear();
        copy.created_at = now_millis();
        copy
    }

    /// Stage a new expire spec; the committed one stays in `expire_old`.
    pub fn set_expire(&mut self, spec: impl Into<String>) {
        let spec = spec.into();
        if spec == self.expire {
            return;
        }
        if !self.has_pending_expire() {
            self.expire_old = self.expire.clone();
        }
        self.expire = spec;
    }

    pub fn has_pending_expire(&self) -> bool {
        self.expire != self.expire_old && self.expire_old.strip_prefix('-') != Some(self.expire.as_str())
    }

    /// Make the staged spec the committed one. A changed policy has to be
    /// persisted again.
    pub fn commit_expire(&mut self) {
        if self.has_pending_expire() {
            self.expire_old = self.expire.clone();
            self.is_new = true;
        }
    }

    pub fn rollback_expire(&mut self) {
        if self.has_pending_expire() {
            self.expire = self.expire_old.clone();
        }
    }

    pub fn is_query_backed(&self) -> bool {
        matches!(self.query_key, QueryKeyState::Resolved(_))
    }

    /// Whether the stored clause is the one a fresh request would build
    /// from the id alone: a single equality bound to the id itself.
    pub fn routes_by_id(&self, id: &str) -> bool {
        let single = self.clause.ends_with(" = ?") && self.clause.matches('?').count() == 1;
        single && self.params.len() == 1 && self.params[0] == coerce_param(id)
    }

    pub fn mark_persisted(&mut self) {
        self.is_new = false;
    }

    /// Flat field map stored in the metadata hash. Transient and memoized
    /// fields are left out; the attached query shape is kept so a
    /// query-backed key can be re-resolved with its limit.
    pub fn to_flat_map(&self) -> Result<Vec<(String, String)>, StorageError> {
        let params = serde_json::to_string(&self.params)
            .map_err(|e| StorageError::Codec(format!("KeyInfo params: {}", e)))?;
        let query = match &self.query_info {
            Some(query) => serde_json::to_string(query)
                .map_err(|e| StorageError::Codec(format!("KeyInfo query: {}", e)))?,
            None => String::new(),
        };
        Ok(vec![
            ("expire".to_string(), self.expire.clone()),
            ("expire_old".to_string(), self.expire_old.clone()),
            ("table".to_string(), self.table.clone()),
            ("clause".to_string(), self.clause.clone()),
            ("params".to_string(), params),
            ("query_key".to_string(), self.query_key.to_stored()),
            ("query".to_string(), query),
            ("unflushed".to_string(), self.unflushed.to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
        ])
    }

    /// Rebuild from the metadata hash. The result is not new: it came from
    /// the store.
    pub fn from_flat_map(fields: &HashMap<String, String>) -> Result<Self, StorageError> {
        let get = |name: &str| fields.get(name).cloned().unwrap_or_default();

        let params_raw = get("params");
        let params: Vec<Value> = if params_raw.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&params_raw)
                .map_err(|e| StorageError::Codec(format!("KeyInfo params: {}", e)))?
        };
        let query_raw = get("query");
        let query_info = if query_raw.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&query_raw)
                    .map_err(|e| StorageError::Codec(format!("KeyInfo query: {}", e)))?,
            )
        };
        let created_at = match fields.get("created_at") {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| StorageError::Codec(format!("KeyInfo created_at: {}", e)))?,
            None => now_millis(),
        };

        Ok(Self {
            expire: get("expire"),
            expire_old: get("expire_old"),
            table: get("table"),
            clause: get("clause"),
            params,
            query_key: QueryKeyState::from_stored(&get("query_key")),
            is_new: false,
            unflushed: get("unflushed") == "true",
            created_at,
            query_info,
            primary_index: SchemaMemo::Unknown,
            columns: SchemaMemo::Unknown,
        })
    }
}

/// Index-aligned KeyInfo list that grows on demand.
///
/// Batch operations address item `i` with [`get_any`](Self::get_any); the
/// list grows by cloning the first element, so callers never pre-size it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnyKey {
    items: Vec<KeyInfo>,
}

impl AnyKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a prototype that becomes element 0.
    pub fn with_first(first: KeyInfo) -> Self {
        Self { items: vec![first] }
    }

    /// Existing element at `index`, or a freshly appended one: a
    /// [`clone_as_new`](KeyInfo::clone_as_new) of element 0, or a brand-new
    /// KeyInfo when the list is empty.
    pub fn get_any(&mut self, index: usize) -> &mut KeyInfo {
        while self.items.len() <= index {
            let next = match self.items.first() {
                Some(first) => first.clone_as_new(),
                None => KeyInfo::default(),
            };
            self.items.push(next);
        }
        &mut self.items[index]
    }

    pub fn get(&self, index: usize) -> Option<&KeyInfo> {
        self.items.get(index)
    }

    pub fn push(&mut self, key_info: KeyInfo) {
        self.items.push(key_info);
    }

    pub fn into_vec(self) -> Vec<KeyInfo> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyInfo> {
        self.items.iter()
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat(info: &KeyInfo) -> HashMap<String, String> {
        info.to_flat_map().unwrap().into_iter().collect()
    }

    #[test]
    fn test_flat_map_round_trip() {
        let mut info = KeyInfo::new("user_table", "3600");
        info.clause = "id = ?".to_string();
        info.params = vec![json!(12467), json!("x")];
        info.query_key = QueryKeyState::Resolved("ab12".to_string());
        let mut query = QueryInfo::new("user_table");
        query.add_condition("age", ">", vec!["18".to_string()]);
        query.limit = Some(10);
        info.query_info = Some(query);
        info.unflushed = true;
        info.mark_persisted();

        let mut restored = KeyInfo::from_flat_map(&flat(&info)).unwrap();
        restored.created_at = info.created_at;
        assert_eq!(restored, info);
    }

    #[test]
    fn test_flat_map_query_key_states() {
        for state in [
            QueryKeyState::Unresolved,
            QueryKeyState::NotQueryBacked,
            QueryKeyState::Resolved("deadbeef".to_string()),
        ] {
            let mut info = KeyInfo::new("t", "60");
            info.query_key = state.clone();
            let restored = KeyInfo::from_flat_map(&flat(&info)).unwrap();
            assert_eq!(restored.query_key, state);
        }
    }

    #[test]
    fn test_from_flat_map_rejects_bad_params() {
        let mut fields = flat(&KeyInfo::new("t", "60"));
        fields.insert("params".to_string(), "not json".to_string());
        assert!(matches!(
            KeyInfo::from_flat_map(&fields),
            Err(StorageError::Codec(_))
        ));
    }

    #[test]
    fn test_expire_bookkeeping() {
        let mut info = KeyInfo::new("t", "60");
        info.mark_persisted();
        assert!(!info.has_pending_expire());

        info.set_expire("120");
        assert!(info.has_pending_expire());
        assert_eq!(info.expire_old, "60");

        // a second staged change keeps the committed value
        info.set_expire("+30");
        assert_eq!(info.expire_old, "60");

        info.rollback_expire();
        assert_eq!(info.expire, "60");
        assert!(!info.has_pending_expire());

        info.set_expire("120");
        info.commit_expire();
        assert_eq!(info.expire_old, "120");
        assert!(info.is_new);
    }

    #[test]
    fn test_forced_override_keeps_signed_form_committed() {
        let mut info = KeyInfo::new("t", "60");
        info.mark_persisted();
        info.set_expire("-5");
        assert!(info.has_pending_expire());

        // what arming a forced override leaves behind
        info.commit_expire();
        info.expire = "5".to_string();
        assert_eq!(info.expire_old, "-5");
        assert!(!info.has_pending_expire());

        // a no-op arm must not bring the sign back
        info.rollback_expire();
        assert_eq!(info.expire, "5");

        // forcing again is a fresh change
        info.set_expire("-5");
        assert!(info.has_pending_expire());
        assert_eq!(info.expire_old, "5");
    }

    #[test]
    fn test_routes_by_id() {
        let mut info = KeyInfo::new("t", "60");
        info.clause = "id = ?".to_string();
        info.params = vec![json!(42)];
        assert!(info.routes_by_id("42"));
        assert!(!info.routes_by_id("43"));

        info.params = vec![json!(7)];
        assert!(!info.routes_by_id("3f2a9c"));

        info.clause = "org = ? AND login = ?".to_string();
        info.params = vec![json!("x"), json!("ada")];
        assert!(!info.routes_by_id("ada"));
    }

    #[test]
    fn test_get_any_on_empty_creates_fresh() {
        let mut keys = AnyKey::new();
        let first = keys.get_any(0);
        assert!(first.is_new);
        assert!(first.table.is_empty());
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_get_any_grows_by_cloning_first() {
        let mut proto = KeyInfo::new("user_table", "3600");
        proto.clause = "id = ?".to_string();
        proto.params = vec![json!(1)];
        proto.mark_persisted();

        let mut keys = AnyKey::with_first(proto);
        assert_eq!(keys.len(), 1);

        let first = keys.get_any(0);
        assert!(!first.is_new);
        assert_eq!(keys.len(), 1);

        let second = keys.get_any(1);
        assert!(second.is_new);
        assert!(second.params.is_empty());
        assert_eq!(second.table, "user_table");
        assert_eq!(second.clause, "id = ?");
        assert_eq!(keys.len(), 2);

        keys.get_any(2);
        assert_eq!(keys.len(), 3);

        // element 0 is untouched by the growth
        assert!(!keys.get(0).unwrap().is_new);
        assert_eq!(keys.get(0).unwrap().params, vec![json!(1)]);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut keys = AnyKey::with_first(KeyInfo::new("t", "60"));
        keys.get_any(1).table = "other".to_string();
        assert_eq!(keys.get(0).unwrap().table, "t");
    }
}
