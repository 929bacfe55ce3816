// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine façade.
//!
//! The [`QueryCacheEngine`] turns caller requests into walks over the tier
//! chain:
//!
//! ```text
//! get     local ──miss──▶ remote ──miss──▶ database ──miss──▶ NotFound
//!           ▲               │ hit             │ hit
//!           └───fill────────┴─────────────────┤
//!                                             └─▶ write-behind: remote, proxy, metadata
//!
//! put     remote + local + metadata ──▶ write-behind: proxy, database
//! delete  local + remote + metadata + proxy ──▶ write-behind: database
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use kv_query_cache::{QueryCacheEngine, EngineConfig, EngineState, KeyRequest};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), kv_query_cache::EngineError> {
//! let config = EngineConfig {
//!     sql_url: Some("sqlite://cache.db?mode=rwc".into()),
//!     default_table: Some("user_table".into()),
//!     ..Default::default()
//! };
//! let engine = QueryCacheEngine::connect(config).await?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start();
//! let id = engine.put(&KeyRequest::generated(), json!({"email": "ada@example.com"})).await?;
//! let value = engine.get(&KeyRequest::new(id)).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{BatchResult, EngineState, KeyRequest, GENERATED_ID};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::ServiceContext;
use crate::expiration::ExpirationCoordinator;
use crate::storage::traits::{CacheBackend, SqlBackend};

/// Query-cache engine over a local cache, a remote cache and a database.
///
/// `Send + Sync`; share it by `Arc` between request handlers.
pub struct QueryCacheEngine {
    pub(super) ctx: Arc<ServiceContext>,
    pub(super) expiration: ExpirationCoordinator,
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryCacheEngine {
    /// Build an engine over already connected backends.
    pub fn new<S>(config: EngineConfig, cache: Arc<dyn CacheBackend>, sql: Arc<S>) -> Self
    where
        S: SqlBackend + 'static,
    {
        Self::from_context(Arc::new(ServiceContext::new(config, cache, sql)))
    }

    pub fn from_context(ctx: Arc<ServiceContext>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown, _) = watch::channel(false);
        Self {
            expiration: ExpirationCoordinator::new(Arc::clone(&ctx)),
            ctx,
            state: state_tx,
            state_rx,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn expiration(&self) -> &ExpirationCoordinator {
        &self.expiration
    }

    /// Number of cached values in the local tier.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.ctx.local.len()
    }

    /// Wait for every write-behind task spawned so far.
    pub async fn drain(&self) {
        self.ctx.executor.drain().await;
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }
}
