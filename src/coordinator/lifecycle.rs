// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: connect, start, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::storage::memory::InMemoryCacheBackend;
use crate::storage::redis::RedisBackend;
use crate::storage::sql::SqlStore;
use crate::storage::traits::CacheBackend;

use super::{EngineState, QueryCacheEngine};

impl QueryCacheEngine {
    /// Connect the backends named by `config`.
    ///
    /// SQL is required: it is the source of truth. Without a `redis_url`
    /// the remote tier runs on [`InMemoryCacheBackend`].
    #[tracing::instrument(skip(config), fields(has_redis))]
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let Some(sql_url) = config.sql_url.clone() else {
            return Err(EngineError::bad_request("sql_url is required"));
        };

        info!("Connecting to SQL (source of truth)...");
        let sql = match SqlStore::new(&sql_url, config.sql_max_connections).await {
            Ok(store) => {
                crate::metrics::set_backend_healthy("sql", true);
                Arc::new(store)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to SQL");
                crate::metrics::set_backend_healthy("sql", false);
                crate::metrics::record_connection_error("sql");
                return Err(e.into());
            }
        };

        let cache: Arc<dyn CacheBackend> = match config.redis_url.as_deref() {
            Some(redis_url) => {
                info!(prefix = ?config.redis_prefix, "Connecting to Redis (remote cache)...");
                match RedisBackend::with_prefix(redis_url, config.redis_prefix.as_deref()).await {
                    Ok(backend) => {
                        tracing::Span::current().record("has_redis", true);
                        crate::metrics::set_backend_healthy("redis", true);
                        Arc::new(backend)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect to Redis");
                        crate::metrics::set_backend_healthy("redis", false);
                        crate::metrics::record_connection_error("redis");
                        return Err(e.into());
                    }
                }
            }
            None => {
                tracing::Span::current().record("has_redis", false);
                warn!("No Redis URL configured, remote tier is process-local");
                Arc::new(InMemoryCacheBackend::new())
            }
        };

        Ok(Self::new(config, cache, sql))
    }

    /// Start the local cache sweeper and the expiration listener.
    ///
    /// Requests are served before `start` too; expired proxies are only
    /// acted upon once the listener runs.
    pub fn start(&self) {
        if self.state() != EngineState::Created {
            warn!(state = %self.state(), "Engine already started");
            return;
        }

        let sweep = Duration::from_millis(self.ctx.config.local_sweep_interval_ms.max(1));
        let sweeper = self.ctx.local.spawn_sweeper(sweep, self.shutdown.subscribe());
        let listener = self.expiration.spawn_listener(self.shutdown.subscribe());
        self.tasks.lock().extend([sweeper, listener]);

        self.set_state(EngineState::Running);
        info!(
            event_prefix = %self.ctx.config.event_prefix,
            local_ttl_secs = self.ctx.config.local_ttl_secs,
            "Query cache engine running"
        );
    }

    /// Drain write-behind tasks, then stop the background tasks.
    pub async fn shutdown(&self) {
        let shutdown_start = std::time::Instant::now();
        info!("Initiating query cache engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let pending = self.ctx.executor.in_flight();
        if pending > 0 {
            info!(pending, "Waiting for write-behind tasks");
        }
        self.ctx.executor.drain().await;

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.set_state(EngineState::Stopped);
        crate::metrics::record_latency("shutdown", shutdown_start.elapsed());
        info!("Query cache engine shutdown complete");
    }
}
