// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Crate Sync
//!
//! Per-player crate state (cooldowns, keys, open locks, reward deliveries)
//! shared by several game servers, with cross-server event propagation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Gameplay logic                         │
//! │  • can this player open this crate now?                    │
//! └─────────────────────────────────────────────────────────────┘
//!            │ StorageBackend                    │ publish()
//!            ▼                                   ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │       FallbackBackend        │  │     SyncCoordinator      │
//! │  primary ──(Unavailable)──►  │  │  • EventBus (broadcast)  │
//! │  secondary, one-way          │  │  • EventLedger (durable) │
//! └──────────────────────────────┘  │  • echo suppression      │
//!     │                    │        └──────────────────────────┘
//!     ▼                    ▼                     ▲
//! PooledSqlBackend    LocalBackend         HealthMonitor
//! (MySQL / SQLite)    (in-memory)          (one-way degrade)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crate_sync::{CoreConfig, CoreContext, StorageConfig, SyncConfig, SyncEvent};
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = CoreContext::open(CoreConfig {
//!     storage: StorageConfig::sql("mysql://crates:secret@db/crates"),
//!     sync: SyncConfig::for_server("survival-1"),
//! })
//! .await?;
//!
//! let player = Uuid::new_v4();
//! let storage = context.storage();
//! if storage.acquire_lock(player, "vote").await? {
//!     if storage.consume_key(player, "vote").await? {
//!         storage.set_cooldown(player, "vote", crate_sync::now_millis()).await?;
//!         if let Some(sync) = context.coordinator() {
//!             sync.publish(&SyncEvent::key_consumed(sync.server_id(), player, "vote")).await;
//!         }
//!     }
//!     storage.release_lock(player, "vote").await?;
//! }
//!
//! context.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: the backend trait and its local, relational and fallback implementations
//! - [`migration`]: offline copy between backends
//! - [`sync`]: event bus, ledger, coordinator and health monitor
//! - [`context`]: explicit construction and shutdown of all of the above
//! - [`resilience`]: startup retry

pub mod config;
pub mod context;
pub mod metrics;
pub mod migration;
pub mod resilience;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::{ConfigError, ConsistencyMode, CoreConfig, StorageConfig, SyncConfig};
pub use context::{CoreContext, CoreError};
pub use metrics::LatencyTimer;
pub use migration::{MigrationReport, StorageMigrator};
pub use resilience::retry::RetryConfig;
pub use storage::{
    FallbackBackend, ImportOutcome, LocalBackend, PooledSqlBackend, StorageBackend, StorageError, Tier,
};
pub use sync::{
    EventBus, EventHandler, EventLedger, HealthMonitor, HealthMonitorHandle, InProcessEventBus, LedgerEntry,
    Observation, ObservationCache, PublishOutcome, RedisEventBus, SqlEventLedger, SyncCoordinator, SyncError,
    SyncEvent, SyncEventKind, SyncStatus,
};
pub use types::{
    now_millis, CooldownRecord, HistoryEntry, HistoryKind, KeyBalance, PendingReward, PlayerId, RewardStatus,
    SnapshotCounts, StorageSnapshot,
};
