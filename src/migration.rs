// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline copy of one backend into another.
//!
//! Operator-invoked, never on the live request path. The run is destructive
//! for the target: it is cleared before the import.
//!
//! ```text
//! source.snapshot() ──► target.clear() ──► target.import() ──► target.snapshot()
//!                                                                     │
//!                                                    compare counts ◄─┘
//! ```
//!
//! Count mismatches are reported, not rolled back. History is silently
//! unrepresentable in some targets (see [`StorageBackend::supports_history`]);
//! those rows are counted as dropped and do not count as a mismatch.

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::storage::StorageBackend;
use crate::types::SnapshotCounts;

/// Result of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Every step completed without error
    pub success: bool,
    pub source: SnapshotCounts,
    pub target: SnapshotCounts,
    /// History rows the target could not hold
    pub dropped_history: usize,
    /// Categories whose target count differs from what was expected
    pub mismatches: Vec<&'static str>,
    pub message: String,
}

impl MigrationReport {
    fn failed(source: SnapshotCounts, message: String) -> Self {
        error!(%message, "Migration failed");
        Self {
            success: false,
            source,
            message,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageMigrator;

impl StorageMigrator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Copy everything `source` holds into `target`, replacing the target's
    /// contents.
    ///
    /// A fallback source exports the tier active when the run starts; if that
    /// tier fails the run stops before the target is touched.
    #[instrument(skip_all, fields(source = source.name(), target = target.name()))]
    pub async fn migrate(&self, source: &dyn StorageBackend, target: &dyn StorageBackend) -> MigrationReport {
        info!("Starting storage migration");

        let snapshot = match source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return MigrationReport::failed(
                    SnapshotCounts::default(),
                    format!("snapshot of {} failed: {}", source.name(), e),
                )
            }
        };
        let source_counts = snapshot.counts();
        info!(counts = %source_counts, "Source snapshot taken");

        if let Err(e) = target.clear().await {
            return MigrationReport::failed(source_counts, format!("clearing {} failed: {}", target.name(), e));
        }

        let outcome = match target.import(&snapshot).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return MigrationReport::failed(source_counts, format!("import into {} failed: {}", target.name(), e))
            }
        };
        if outcome.dropped_history > 0 {
            warn!(
                target = target.name(),
                dropped = outcome.dropped_history,
                "Target cannot store history; history rows were dropped"
            );
        }

        let target_counts = match target.snapshot().await {
            Ok(snapshot) => snapshot.counts(),
            Err(e) => {
                return MigrationReport::failed(
                    source_counts,
                    format!("verification snapshot of {} failed: {}", target.name(), e),
                )
            }
        };

        let expected_history = source_counts.history - outcome.dropped_history.min(source_counts.history);
        let mut mismatches = Vec::new();
        for (category, expected, actual) in [
            ("cooldowns", source_counts.cooldowns, target_counts.cooldowns),
            ("key_balances", source_counts.key_balances, target_counts.key_balances),
            ("history", expected_history, target_counts.history),
        ] {
            crate::metrics::record_migration(category, expected, actual);
            if expected != actual {
                warn!(category, expected, actual, "Migration count mismatch");
                mismatches.push(category);
            }
        }

        let mut message = format!("migrated {} -> {}: {}", source.name(), target.name(), target_counts);
        if outcome.dropped_history > 0 {
            message.push_str(&format!(" ({} history rows dropped)", outcome.dropped_history));
        }
        if !mismatches.is_empty() {
            message.push_str(&format!("; count mismatch in {}", mismatches.join(", ")));
        }
        info!(%message, "Migration complete");

        MigrationReport {
            success: true,
            source: source_counts,
            target: target_counts,
            dropped_history: outcome.dropped_history,
            mismatches,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalBackend, StorageError};
    use crate::types::{PendingReward, PlayerId, StorageSnapshot};
    use async_trait::async_trait;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_local_to_local_copies_state() {
        let source = LocalBackend::new();
        let target = LocalBackend::new();
        let player = Uuid::new_v4();

        source.set_cooldown(player, "vote", 5).await.unwrap();
        source.add_key(player, "vote", 2).await.unwrap();
        target.set_cooldown(Uuid::new_v4(), "stale", 1).await.unwrap();

        let report = StorageMigrator::new().migrate(&source, &target).await;
        assert!(report.success);
        assert!(report.mismatches.is_empty());
        assert_eq!(report.target.cooldowns, 1);
        assert_eq!(target.get_key_count(player, "vote").await.unwrap(), 2);
    }

    struct Unreachable;

    #[async_trait]
    impl StorageBackend for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }
        fn supports_history(&self) -> bool {
            true
        }
        async fn get_cooldown(&self, _: PlayerId, _: &str) -> Result<Option<i64>, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn set_cooldown(&self, _: PlayerId, _: &str, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn get_key_count(&self, _: PlayerId, _: &str) -> Result<u32, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn add_key(&self, _: PlayerId, _: &str, _: u32) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn consume_key(&self, _: PlayerId, _: &str) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn acquire_lock(&self, _: PlayerId, _: &str) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn release_lock(&self, _: PlayerId, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn log_open(&self, _: PlayerId, _: &str, _: Option<&str>, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn record_delivery(&self, _: PlayerId, _: &str, _: &str, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn queue_pending_reward(&self, _: PlayerId, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn pending_rewards(&self, _: PlayerId) -> Result<Vec<PendingReward>, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn mark_reward_delivered(&self, _: PlayerId, _: &str, _: &str) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn clear(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_unreadable_source_fails_without_touching_target() {
        let target = LocalBackend::new();
        let player = Uuid::new_v4();
        target.set_cooldown(player, "vote", 1).await.unwrap();

        let report = StorageMigrator::new().migrate(&Unreachable, &target).await;
        assert!(!report.success);
        assert!(report.message.contains("unreachable"));
        assert_eq!(target.get_cooldown(player, "vote").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_fallback_source_losing_primary_leaves_target_intact() {
        use crate::storage::FallbackBackend;
        use std::sync::Arc;

        let source = FallbackBackend::new(Arc::new(Unreachable), Arc::new(LocalBackend::new()));
        let target = LocalBackend::new();
        for _ in 0..9 {
            target.add_key(Uuid::new_v4(), "vote", 1).await.unwrap();
        }

        let report = StorageMigrator::new().migrate(&source, &target).await;
        assert!(!report.success);
        assert!(!source.is_degraded());
        assert_eq!(target.snapshot().await.unwrap().key_balances.len(), 9);
    }

    #[tokio::test]
    async fn test_unwritable_target_fails() {
        let source = LocalBackend::new();
        source.set_cooldown(Uuid::new_v4(), "vote", 1).await.unwrap();

        let report = StorageMigrator::new().migrate(&source, &Unreachable).await;
        assert!(!report.success);
        assert_eq!(report.source.cooldowns, 1);
    }
}
