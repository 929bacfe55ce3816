// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared services, built once per engine and passed around by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::executor::WriteBehindExecutor;
use crate::routing::RoutingResolver;
use crate::storage::database::DatabaseRepository;
use crate::storage::local::LocalCache;
use crate::storage::metadata::MetadataRepository;
use crate::storage::remote::RemoteCacheRepository;
use crate::storage::traits::{CacheBackend, SqlBackend};

pub struct ServiceContext {
    pub config: EngineConfig,
    pub cache: Arc<dyn CacheBackend>,
    pub sql: Arc<dyn SqlBackend>,
    pub local: Arc<LocalCache>,
    pub remote: RemoteCacheRepository,
    pub metadata: MetadataRepository,
    pub database: DatabaseRepository,
    pub resolver: Arc<RoutingResolver>,
    pub executor: WriteBehindExecutor,
}

impl ServiceContext {
    /// Wire every tier over the given backends.
    pub fn new<S>(config: EngineConfig, cache: Arc<dyn CacheBackend>, sql: Arc<S>) -> Self
    where
        S: SqlBackend + 'static,
    {
        let resolver = Arc::new(RoutingResolver::new(sql.clone(), config.default_table.clone()));
        let sql: Arc<dyn SqlBackend> = sql;

        Self {
            local: Arc::new(LocalCache::new(Duration::from_secs(config.local_ttl_secs))),
            remote: RemoteCacheRepository::new(Arc::clone(&cache)),
            metadata: MetadataRepository::new(Arc::clone(&cache), config.metadata_kind.clone()),
            database: DatabaseRepository::new(Arc::clone(&sql), Arc::clone(&resolver)),
            executor: WriteBehindExecutor::new(),
            resolver,
            cache,
            sql,
            config,
        }
    }
}
