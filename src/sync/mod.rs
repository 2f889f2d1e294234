// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-server synchronization.
//!
//! Each server broadcasts what it did (crate opened, reward granted, key
//! consumed, cooldown set) on an [`EventBus`] and appends it to a durable
//! [`EventLedger`]. Peers apply inbound events to their
//! [`ObservationCache`]; a server's own storage backend stays authoritative
//! for its own decisions.
//!
//! ```text
//!  server A                                   server B
//!  ────────                                   ────────
//!  publish(ev) ──► bus ───────────────────────► handle_inbound(ev)
//!        │          └──► handle_inbound(ev)          │
//!        ▼                 (echo, dropped)           ▼
//!     ledger                                  ObservationCache
//! ```
//!
//! Delivery is at-least-once to current subscribers with no ordering across
//! servers. Conflicts resolve last-write-wins by event timestamp.

pub mod bus;
pub mod cache;
pub mod coordinator;
pub mod event;
pub mod health;
pub mod ledger;
pub mod redis_bus;

use thiserror::Error;

pub use bus::{EventBus, EventHandler, InProcessEventBus};
pub use cache::{Observation, ObservationCache};
pub use coordinator::{PublishOutcome, SyncCoordinator, SyncStatus};
pub use event::{SyncEvent, SyncEventKind};
pub use health::{HealthMonitor, HealthMonitorHandle};
pub use ledger::{EventLedger, LedgerEntry, SqlEventLedger};
pub use redis_bus::RedisEventBus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Bus connection or publish failure
    #[error("event transport error: {0}")]
    Transport(String),
    /// Ledger write or query failure
    #[error("event ledger error: {0}")]
    Ledger(String),
    #[error("event serialization error: {0}")]
    Serialization(String),
    /// The bus or ledger has been closed
    #[error("sync component closed")]
    Closed,
    /// `start` was called on a coordinator that is already listening
    #[error("sync coordinator already started")]
    AlreadyStarted,
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        SyncError::Transport(e.to_string())
    }
}
