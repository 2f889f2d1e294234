// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-owned wiring of storage and sync.
//!
//! There are no globals: the host opens one [`CoreContext`], hands its parts
//! to whatever needs them, and closes it on shutdown.
//!
//! | `sql_url` | `fallback_to_local` | storage                                   |
//! |-----------|---------------------|-------------------------------------------|
//! | unset     | any                 | `LocalBackend`                            |
//! | set       | true                | `FallbackBackend(PooledSql, Local)`       |
//! | set, down | true                | same, already on `Local`                  |
//! | set       | false               | `PooledSqlBackend`                        |
//!
//! With the fallback enabled the database gets a single connection attempt.
//! If it is unreachable the context still opens: storage starts degraded and
//! so does sync, whose ledger creates its table once the pool answers.
//!
//! Sync needs the relational backend because the ledger shares its pool.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::{ConfigError, CoreConfig};
use crate::resilience::retry::RetryConfig;
use crate::storage::{FallbackBackend, LocalBackend, PooledSqlBackend, StorageBackend, StorageError};
use crate::sync::{
    EventBus, HealthMonitor, HealthMonitorHandle, InProcessEventBus, ObservationCache, RedisEventBus,
    SqlEventLedger, SyncCoordinator, SyncError,
};

/// Anything that can stop [`CoreContext::open`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub struct CoreContext {
    storage: Arc<dyn StorageBackend>,
    fallback: Option<Arc<FallbackBackend>>,
    coordinator: Option<Arc<SyncCoordinator>>,
    observations: Arc<ObservationCache>,
    monitor: Option<HealthMonitorHandle>,
}

impl CoreContext {
    #[instrument(skip_all, fields(sync = config.sync.enabled, server_id = %config.sync.server_id))]
    pub async fn open(config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let mut fallback = None;
        let mut sql = None;
        let mut sql_reachable = true;
        let storage: Arc<dyn StorageBackend> = match &config.storage.sql_url {
            None => Arc::new(LocalBackend::new()),
            Some(_) if config.storage.fallback_to_local => {
                let local = Arc::new(LocalBackend::new());
                // One attempt: an unreachable database means starting on local state
                let composed = match PooledSqlBackend::connect_with_retry(&config.storage, &RetryConfig::none()).await
                {
                    Ok(backend) => {
                        let backend = Arc::new(backend);
                        sql = Some(backend.clone());
                        FallbackBackend::new(backend, local)
                    }
                    Err(StorageError::Unavailable(reason)) => {
                        warn!(%reason, "Relational storage unreachable at startup; starting on local state");
                        let backend = Arc::new(PooledSqlBackend::connect_lazy(&config.storage)?);
                        sql = Some(backend.clone());
                        sql_reachable = false;
                        FallbackBackend::degraded(backend, local, &reason)
                    }
                    Err(e) => return Err(e.into()),
                };
                let composed = Arc::new(composed);
                fallback = Some(composed.clone());
                composed
            }
            Some(_) => {
                let backend = Arc::new(PooledSqlBackend::connect(&config.storage).await?);
                sql = Some(backend.clone());
                backend
            }
        };

        let observations = Arc::new(ObservationCache::new());
        let mut coordinator = None;
        let mut monitor = None;

        if config.sync.enabled {
            let Some(sql) = &sql else {
                return Err(SyncError::InvalidConfig("sync ledger requires storage.sql_url".into()).into());
            };

            let bus: Arc<dyn EventBus> = match &config.sync.redis_url {
                Some(url) => Arc::new(RedisEventBus::connect(url, &config.sync.channel).await?),
                None => Arc::new(InProcessEventBus::new(config.sync.bus_capacity)),
            };
            let ledger = if sql_reachable {
                SqlEventLedger::from_pool(sql.pool(), sql.is_sqlite(), &config.sync.ledger_schema).await?
            } else {
                SqlEventLedger::from_pool_deferred(sql.pool(), sql.is_sqlite(), &config.sync.ledger_schema)?
            };

            let interval = config.sync.health_interval();
            let sync = Arc::new(SyncCoordinator::new(config.sync.clone(), bus, Arc::new(ledger))?);
            if !sql_reachable {
                sync.mark_degraded("event ledger unreachable at startup");
            }
            sync.start(observations.handler()).await?;
            monitor = Some(HealthMonitor::new(sync.clone(), interval).spawn());
            coordinator = Some(sync);
        }

        info!(
            storage = storage.name(),
            fallback = fallback.is_some(),
            sync = coordinator.is_some(),
            "Crate core opened"
        );

        Ok(Self {
            storage,
            fallback,
            coordinator,
            observations,
            monitor,
        })
    }

    /// The backend gameplay code should call.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// The fallback composition, when one was built. Useful for status output.
    pub fn fallback(&self) -> Option<&Arc<FallbackBackend>> {
        self.fallback.as_ref()
    }

    pub fn coordinator(&self) -> Option<&Arc<SyncCoordinator>> {
        self.coordinator.as_ref()
    }

    pub fn observations(&self) -> &Arc<ObservationCache> {
        &self.observations
    }

    /// Sync status lines, or a single line when sync is off.
    pub async fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Storage: {}", self.storage.name())];
        if let Some(fallback) = &self.fallback {
            lines.push(format!("Storage tier: {}", fallback.active_tier()));
        }
        match &self.coordinator {
            Some(coordinator) => lines.extend(coordinator.status_lines().await),
            None => lines.push("Sync enabled: false".to_string()),
        }
        lines
    }

    /// Stop the health monitor, then close sync, then storage.
    pub async fn close(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.close().await;
        }
        self.storage.close().await;
        info!("Crate core closed");
    }
}
