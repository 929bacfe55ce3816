// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine façade.

use crate::kv_pair::DEFAULT_KIND;
use crate::query::QueryParams;

/// Id placeholder asking the engine to generate one.
pub const GENERATED_ID: &str = "*";

/// Engine lifecycle state.
///
/// Use [`super::QueryCacheEngine::state()`] to check the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background tasks not started
    Created,
    /// Local cache sweeper and expiration listener running
    Running,
    /// Draining write-behind tasks
    ShuttingDown,
    /// Background tasks stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Address of one record as a caller supplies it.
///
/// ```
/// use kv_query_cache::KeyRequest;
///
/// let request = KeyRequest::new("42")
///     .with_table("user_table")
///     .with_expire("+10m")
///     .with_param("age>", ["18"]);
/// assert_eq!(request.kind, "data");
/// assert!(!request.is_generated());
/// assert!(KeyRequest::generated().is_generated());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    /// Record id, or [`GENERATED_ID`]
    pub id: String,
    pub kind: String,
    /// Table override; only allowed before the key is routed
    pub table: Option<String>,
    /// Expire spec override
    pub expire: Option<String>,
    /// Raw filter parameters, in request order
    pub params: QueryParams,
}

impl KeyRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DEFAULT_KIND.to_string(),
            table: None,
            expire: None,
            params: Vec::new(),
        }
    }

    /// Request for a fresh, engine-generated id.
    pub fn generated() -> Self {
        Self::new(GENERATED_ID)
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_expire(mut self, spec: impl Into<String>) -> Self {
        self.expire = Some(spec.into());
        self
    }

    #[must_use]
    pub fn with_param<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn is_generated(&self) -> bool {
        self.id == GENERATED_ID
    }

    /// Same routing options, different id.
    pub(crate) fn for_id(&self, id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..self.clone()
        }
    }
}

/// Result of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Total items in the batch
    pub total: usize,
    /// Successfully processed items
    pub succeeded: usize,
    /// Failed items
    pub failed: usize,
}

impl BatchResult {
    /// Check if all items succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}
