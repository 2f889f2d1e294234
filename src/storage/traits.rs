// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    HistoryKind, PendingReward, PlayerId, StorageSnapshot,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Transient infrastructure fault (connect failure, pool exhaustion,
    /// severed connection). The only error that drives fallback.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    /// Invalid configuration detected at construction time.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
    /// Caller passed an argument the contract forbids.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Rows written by [`StorageBackend::import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub cooldowns: usize,
    pub key_balances: usize,
    /// History rows written (0 when the backend cannot hold history)
    pub history: usize,
    /// History rows discarded because the backend cannot hold history
    pub dropped_history: usize,
}

/// Persistence contract for cooldowns, key balances, locks and delivery
/// bookkeeping.
///
/// `consume_key` and `acquire_lock` report expected negatives as `Ok(false)`.
/// Only [`StorageError::Unavailable`] signals a transient fault.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Whether open/delivery history survives in this backend.
    fn supports_history(&self) -> bool;

    async fn get_cooldown(&self, player: PlayerId, crate_id: &str) -> Result<Option<i64>, StorageError>;

    /// Unconditional overwrite; the newest write wins.
    async fn set_cooldown(&self, player: PlayerId, crate_id: &str, at: i64) -> Result<(), StorageError>;

    async fn get_key_count(&self, player: PlayerId, crate_id: &str) -> Result<u32, StorageError>;

    /// `amount` must be positive.
    async fn add_key(&self, player: PlayerId, crate_id: &str, amount: u32) -> Result<(), StorageError>;

    /// Take one key. Returns `false` and leaves state untouched when the
    /// balance is already zero.
    async fn consume_key(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError>;

    /// Insert-or-fail. Returns `false` when the lock is already held.
    ///
    /// Locks never expire: a holder that dies without releasing leaves the
    /// lock held until an operator clears it.
    async fn acquire_lock(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError>;

    /// No-op when the lock is not held.
    async fn release_lock(&self, player: PlayerId, crate_id: &str) -> Result<(), StorageError>;

    /// Append an open to history. Non-transient failures are logged and
    /// swallowed; only `Unavailable` is returned.
    async fn log_open(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: Option<&str>,
        at: i64,
    ) -> Result<(), StorageError>;

    /// Append a reward delivery to history. Same failure policy as `log_open`.
    async fn record_delivery(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
        at: i64,
    ) -> Result<(), StorageError>;

    /// Queue a reward for later delivery.
    async fn queue_pending_reward(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<(), StorageError>;

    /// Rewards still waiting for delivery, oldest first.
    async fn pending_rewards(&self, player: PlayerId) -> Result<Vec<PendingReward>, StorageError>;

    /// Flip one pending reward to delivered. Returns `false` if none matched.
    async fn mark_reward_delivered(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<bool, StorageError>;

    /// Consistent export of cooldowns, balances and history.
    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError>;

    /// Remove all data, including locks and pending rewards.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Load a snapshot into this backend.
    /// Default implementation replays it through the primitive operations.
    async fn import(&self, snapshot: &StorageSnapshot) -> Result<ImportOutcome, StorageError> {
        let mut outcome = ImportOutcome::default();

        for record in &snapshot.cooldowns {
            self.set_cooldown(record.player, &record.crate_id, record.last_used).await?;
            outcome.cooldowns += 1;
        }
        for balance in &snapshot.key_balances {
            if balance.amount == 0 {
                continue;
            }
            self.add_key(balance.player, &balance.crate_id, balance.amount).await?;
            outcome.key_balances += 1;
        }

        if !self.supports_history() {
            outcome.dropped_history = snapshot.history.len();
            return Ok(outcome);
        }
        for entry in &snapshot.history {
            match entry.kind {
                HistoryKind::Open => {
                    self.log_open(entry.player, &entry.crate_id, entry.reward_id.as_deref(), entry.at).await?;
                }
                HistoryKind::Delivery => {
                    let reward = entry.reward_id.as_deref().unwrap_or_default();
                    self.record_delivery(entry.player, &entry.crate_id, reward, entry.at).await?;
                }
            }
            outcome.history += 1;
        }
        Ok(outcome)
    }

    /// Release every resource held by the backend. Idempotent.
    async fn close(&self);
}
