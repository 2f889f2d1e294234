// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary/secondary composition with a one-way breaker.
//!
//! States:
//! - Normal: every call goes to the primary
//! - Degraded: every call goes to the secondary; the primary is never tried again
//!
//! The first [`StorageError::Unavailable`] from the primary trips the breaker
//! and the same call is replayed on the secondary, so the caller never sees
//! the fault. Any other error is the primary's answer and is returned as is.
//!
//! `snapshot` is the exception: it reads the active tier and never trips.
//!
//! There is no half-open state. Once degraded, the process stays on the
//! secondary until restart.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::traits::{ImportOutcome, StorageBackend, StorageError};
use crate::types::{PendingReward, PlayerId, StorageSnapshot};

/// Which tier is serving calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Secondary,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

pub struct FallbackBackend {
    primary: Arc<dyn StorageBackend>,
    secondary: Arc<dyn StorageBackend>,
    degraded: AtomicBool,
}

impl FallbackBackend {
    pub fn new(primary: Arc<dyn StorageBackend>, secondary: Arc<dyn StorageBackend>) -> Self {
        Self {
            primary,
            secondary,
            degraded: AtomicBool::new(false),
        }
    }

    /// Composition that is already on the secondary, for a primary that
    /// could not be reached at startup.
    pub fn degraded(primary: Arc<dyn StorageBackend>, secondary: Arc<dyn StorageBackend>, reason: &str) -> Self {
        let backend = Self::new(primary, secondary);
        backend.trip("open", reason);
        backend
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn active_tier(&self) -> Tier {
        if self.is_degraded() {
            Tier::Secondary
        } else {
            Tier::Primary
        }
    }

    fn active(&self) -> &Arc<dyn StorageBackend> {
        match self.active_tier() {
            Tier::Primary => &self.primary,
            Tier::Secondary => &self.secondary,
        }
    }

    /// Switch to the secondary. Only the first caller logs.
    fn trip(&self, operation: &'static str, reason: &str) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            operation,
            reason,
            "Primary storage unavailable; switching to secondary until restart"
        );
        crate::metrics::record_fallback_transition(self.primary.name(), operation);
    }

    async fn route<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, StorageError>> + Send,
        T: Send,
    {
        if self.is_degraded() {
            return call(self.secondary.clone()).await;
        }
        match call(self.primary.clone()).await {
            Err(StorageError::Unavailable(reason)) => {
                self.trip(operation, &reason);
                call(self.secondary.clone()).await
            }
            other => other,
        }
    }

    /// Bookkeeping never fails the caller.
    async fn route_bookkeeping<F, Fut>(&self, operation: &'static str, call: F) -> Result<(), StorageError>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), StorageError>> + Send,
    {
        if let Err(e) = self.route(operation, call).await {
            warn!(operation, tier = %self.active_tier(), error = %e, "Bookkeeping write lost");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        self.active().name()
    }

    fn supports_history(&self) -> bool {
        self.active().supports_history()
    }

    async fn get_cooldown(&self, player: PlayerId, crate_id: &str) -> Result<Option<i64>, StorageError> {
        self.route("get_cooldown", |b| async move { b.get_cooldown(player, crate_id).await })
            .await
    }

    async fn set_cooldown(&self, player: PlayerId, crate_id: &str, at: i64) -> Result<(), StorageError> {
        self.route("set_cooldown", |b| async move { b.set_cooldown(player, crate_id, at).await })
            .await
    }

    async fn get_key_count(&self, player: PlayerId, crate_id: &str) -> Result<u32, StorageError> {
        self.route("get_key_count", |b| async move { b.get_key_count(player, crate_id).await })
            .await
    }

    async fn add_key(&self, player: PlayerId, crate_id: &str, amount: u32) -> Result<(), StorageError> {
        self.route("add_key", |b| async move { b.add_key(player, crate_id, amount).await })
            .await
    }

    async fn consume_key(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        self.route("consume_key", |b| async move { b.consume_key(player, crate_id).await })
            .await
    }

    async fn acquire_lock(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        self.route("acquire_lock", |b| async move { b.acquire_lock(player, crate_id).await })
            .await
    }

    async fn release_lock(&self, player: PlayerId, crate_id: &str) -> Result<(), StorageError> {
        self.route("release_lock", |b| async move { b.release_lock(player, crate_id).await })
            .await
    }

    async fn log_open(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: Option<&str>,
        at: i64,
    ) -> Result<(), StorageError> {
        self.route_bookkeeping("log_open", |b| async move {
            b.log_open(player, crate_id, reward_id, at).await
        })
        .await
    }

    async fn record_delivery(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
        at: i64,
    ) -> Result<(), StorageError> {
        self.route_bookkeeping("record_delivery", |b| async move {
            b.record_delivery(player, crate_id, reward_id, at).await
        })
        .await
    }

    async fn queue_pending_reward(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<(), StorageError> {
        self.route("queue_pending_reward", |b| async move {
            b.queue_pending_reward(player, crate_id, reward_id).await
        })
        .await
    }

    async fn pending_rewards(&self, player: PlayerId) -> Result<Vec<PendingReward>, StorageError> {
        self.route("pending_rewards", |b| async move { b.pending_rewards(player).await })
            .await
    }

    async fn mark_reward_delivered(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<bool, StorageError> {
        self.route("mark_reward_delivered", |b| async move {
            b.mark_reward_delivered(player, crate_id, reward_id).await
        })
        .await
    }

    /// Snapshot of the tier active when the call starts.
    ///
    /// Never trips: a primary that fails here returns its error, so a
    /// migration cannot silently export the other tier.
    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        self.active().snapshot().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.route("clear", |b| async move { b.clear().await }).await
    }

    async fn import(&self, snapshot: &StorageSnapshot) -> Result<ImportOutcome, StorageError> {
        self.route("import", |b| async move { b.import(snapshot).await }).await
    }

    async fn close(&self) {
        self.primary.close().await;
        self.secondary.close().await;
    }
}
