// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory reference backend.
//!
//! Used standalone on single-server setups and as the secondary tier of a
//! [`FallbackBackend`](super::fallback::FallbackBackend). History is not kept:
//! `log_open` and `record_delivery` only bump a counter.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::traits::{StorageBackend, StorageError};
use crate::types::{
    now_millis, CooldownRecord, KeyBalance, PendingReward, PlayerId, RewardStatus, StorageSnapshot,
};

type SlotKey = (PlayerId, String);

pub struct LocalBackend {
    cooldowns: DashMap<SlotKey, i64>,
    keys: DashMap<SlotKey, u32>,
    /// Lock holder map: value is the acquisition time
    locks: DashMap<SlotKey, i64>,
    pending: DashMap<PlayerId, Vec<PendingReward>>,
    discarded_history: AtomicU64,
}

impl LocalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cooldowns: DashMap::new(),
            keys: DashMap::new(),
            locks: DashMap::new(),
            pending: DashMap::new(),
            discarded_history: AtomicU64::new(0),
        }
    }

    /// Number of history rows dropped because this backend does not keep them.
    #[must_use]
    pub fn discarded_history(&self) -> u64 {
        self.discarded_history.load(Ordering::Relaxed)
    }

    /// Number of locks currently held.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    fn slot(player: PlayerId, crate_id: &str) -> SlotKey {
        (player, crate_id.to_string())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_history(&self) -> bool {
        false
    }

    async fn get_cooldown(&self, player: PlayerId, crate_id: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.cooldowns.get(&Self::slot(player, crate_id)).map(|r| *r.value()))
    }

    async fn set_cooldown(&self, player: PlayerId, crate_id: &str, at: i64) -> Result<(), StorageError> {
        self.cooldowns.insert(Self::slot(player, crate_id), at);
        Ok(())
    }

    async fn get_key_count(&self, player: PlayerId, crate_id: &str) -> Result<u32, StorageError> {
        Ok(self.keys.get(&Self::slot(player, crate_id)).map_or(0, |r| *r.value()))
    }

    async fn add_key(&self, player: PlayerId, crate_id: &str, amount: u32) -> Result<(), StorageError> {
        if amount == 0 {
            return Err(StorageError::InvalidInput("key amount must be positive".into()));
        }
        let mut balance = self.keys.entry(Self::slot(player, crate_id)).or_insert(0);
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    async fn consume_key(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        // The entry guard holds the shard lock, so check and decrement are atomic.
        match self.keys.entry(Self::slot(player, crate_id)) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current <= 1 {
                    entry.remove();
                    Ok(current == 1)
                } else {
                    *entry.get_mut() = current - 1;
                    Ok(true)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn acquire_lock(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        match self.locks.entry(Self::slot(player, crate_id)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(now_millis());
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, player: PlayerId, crate_id: &str) -> Result<(), StorageError> {
        self.locks.remove(&Self::slot(player, crate_id));
        Ok(())
    }

    async fn log_open(
        &self,
        player: PlayerId,
        crate_id: &str,
        _reward_id: Option<&str>,
        _at: i64,
    ) -> Result<(), StorageError> {
        self.discarded_history.fetch_add(1, Ordering::Relaxed);
        debug!(%player, crate_id, "Open history not kept by local backend");
        Ok(())
    }

    async fn record_delivery(
        &self,
        player: PlayerId,
        crate_id: &str,
        _reward_id: &str,
        _at: i64,
    ) -> Result<(), StorageError> {
        self.discarded_history.fetch_add(1, Ordering::Relaxed);
        debug!(%player, crate_id, "Delivery history not kept by local backend");
        Ok(())
    }

    async fn queue_pending_reward(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<(), StorageError> {
        self.pending.entry(player).or_default().push(PendingReward {
            crate_id: crate_id.to_string(),
            reward_id: reward_id.to_string(),
            status: RewardStatus::Pending,
            created_at: now_millis(),
        });
        Ok(())
    }

    async fn pending_rewards(&self, player: PlayerId) -> Result<Vec<PendingReward>, StorageError> {
        Ok(self
            .pending
            .get(&player)
            .map(|rewards| {
                rewards
                    .iter()
                    .filter(|r| r.status == RewardStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_reward_delivered(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<bool, StorageError> {
        let Some(mut rewards) = self.pending.get_mut(&player) else {
            return Ok(false);
        };
        let found = rewards.iter_mut().find(|r| {
            r.status == RewardStatus::Pending && r.crate_id == crate_id && r.reward_id == reward_id
        });
        match found {
            Some(reward) => {
                reward.status = RewardStatus::Delivered;
                self.discarded_history.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        let cooldowns = self
            .cooldowns
            .iter()
            .map(|r| CooldownRecord {
                player: r.key().0,
                crate_id: r.key().1.clone(),
                last_used: *r.value(),
            })
            .collect();
        let key_balances = self
            .keys
            .iter()
            .map(|r| KeyBalance {
                player: r.key().0,
                crate_id: r.key().1.clone(),
                amount: *r.value(),
            })
            .collect();

        Ok(StorageSnapshot {
            cooldowns,
            key_balances,
            history: Vec::new(),
        })
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.cooldowns.clear();
        self.keys.clear();
        self.locks.clear();
        self.pending.clear();
        Ok(())
    }

    async fn close(&self) {
        let _ = self.clear().await;
    }
}
