// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-player crate state records.
//!
//! These are the values that flow between the gameplay layer, the storage
//! backends and the migrator. Timestamps are epoch milliseconds throughout.
//!
//! # Example
//!
//! ```
//! use crate_sync::{StorageSnapshot, CooldownRecord, KeyBalance};
//! use uuid::Uuid;
//!
//! let player = Uuid::new_v4();
//! let snapshot = StorageSnapshot {
//!     cooldowns: vec![CooldownRecord { player, crate_id: "vote".into(), last_used: 1_700_000_000_000 }],
//!     key_balances: vec![KeyBalance { player, crate_id: "vote".into(), amount: 3 }],
//!     history: Vec::new(),
//! };
//!
//! let counts = snapshot.counts();
//! assert_eq!(counts.cooldowns, 1);
//! assert_eq!(counts.key_balances, 1);
//! assert_eq!(counts.history, 0);
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Players are identified by their account UUID.
pub type PlayerId = Uuid;

/// Current wall-clock time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Last time a player opened a crate. At most one per (player, crate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub player: PlayerId,
    pub crate_id: String,
    /// Epoch millis of the last open
    pub last_used: i64,
}

/// Number of keys a player holds for a crate. Zero balances are not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBalance {
    pub player: PlayerId,
    pub crate_id: String,
    pub amount: u32,
}

/// Kind of append-only bookkeeping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// A crate was opened
    Open,
    /// A reward was handed to the player
    Delivery,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Delivery => "delivery",
        }
    }
}

/// One row of open/delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub player: PlayerId,
    pub crate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_id: Option<String>,
    pub kind: HistoryKind,
    /// Epoch millis
    pub at: i64,
}

/// Delivery state of a queued reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RewardStatus {
    Pending,
    Delivered,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delivered => "DELIVERED",
        }
    }

    /// Parse the persisted column value. Unknown values read as pending so a
    /// reward is never silently lost.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("DELIVERED") {
            Self::Delivered
        } else {
            Self::Pending
        }
    }
}

impl std::fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reward that could not be granted immediately (e.g. the player was offline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReward {
    pub crate_id: String,
    pub reward_id: String,
    pub status: RewardStatus,
    /// Epoch millis when the reward was queued
    pub created_at: i64,
}

/// Point-in-time export of a backend, used for one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageSnapshot {
    pub cooldowns: Vec<CooldownRecord>,
    pub key_balances: Vec<KeyBalance>,
    pub history: Vec<HistoryEntry>,
}

impl StorageSnapshot {
    #[must_use]
    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            cooldowns: self.cooldowns.len(),
            key_balances: self.key_balances.len(),
            history: self.history.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cooldowns.is_empty() && self.key_balances.is_empty() && self.history.is_empty()
    }
}

/// Row counts per snapshot category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotCounts {
    pub cooldowns: usize,
    pub key_balances: usize,
    pub history: usize,
}

impl std::fmt::Display for SnapshotCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cooldowns={}, keys={}, history={}",
            self.cooldowns, self.key_balances, self.history
        )
    }
}
