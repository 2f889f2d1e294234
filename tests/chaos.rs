//! Chaos Testing for crate storage
//!
//! This module tests failure scenarios using:
//! 1. **FailingBackend wrapper** - precise error injection at specific call counts
//! 2. **Pool exhaustion** - real SQLite pool with every connection checked out
//! 3. **Closed pools** - backend shut down underneath a live fallback
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate_sync::{
    FallbackBackend, LocalBackend, PendingReward, PlayerId, PooledSqlBackend, StorageBackend, StorageConfig,
    StorageError, StorageSnapshot, Tier,
};

// =============================================================================
// Failing Backend Wrapper - Precise Error Injection
// =============================================================================

/// A wrapper that injects failures at specific call counts and counts every call.
/// Useful for verifying which tier served which call.
pub struct FailingBackend<S: StorageBackend> {
    inner: S,
    call_count: AtomicU64,
    fail_on_calls: Vec<u64>,
    /// Fail every call from this one on (0 = never)
    fail_from: u64,
    error: StorageError,
}

impl<S: StorageBackend> FailingBackend<S> {
    pub fn new(inner: S, fail_on_calls: Vec<u64>, error: StorageError) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            fail_from: 0,
            error,
        }
    }

    /// Fail every call after the first `n` succeed.
    pub fn fail_after(inner: S, n: u64, error: StorageError) -> Self {
        Self {
            fail_from: n + 1,
            ..Self::new(inner, vec![], error)
        }
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.fail_on_calls.contains(&call) || (self.fail_from > 0 && call >= self.fail_from);
        if fail {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

fn unavailable() -> StorageError {
    StorageError::Unavailable("injected: connection refused".into())
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for FailingBackend<S> {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn supports_history(&self) -> bool {
        self.inner.supports_history()
    }

    async fn get_cooldown(&self, player: PlayerId, crate_id: &str) -> Result<Option<i64>, StorageError> {
        self.maybe_fail()?;
        self.inner.get_cooldown(player, crate_id).await
    }

    async fn set_cooldown(&self, player: PlayerId, crate_id: &str, at: i64) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.set_cooldown(player, crate_id, at).await
    }

    async fn get_key_count(&self, player: PlayerId, crate_id: &str) -> Result<u32, StorageError> {
        self.maybe_fail()?;
        self.inner.get_key_count(player, crate_id).await
    }

    async fn add_key(&self, player: PlayerId, crate_id: &str, amount: u32) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.add_key(player, crate_id, amount).await
    }

    async fn consume_key(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        self.maybe_fail()?;
        self.inner.consume_key(player, crate_id).await
    }

    async fn acquire_lock(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        self.maybe_fail()?;
        self.inner.acquire_lock(player, crate_id).await
    }

    async fn release_lock(&self, player: PlayerId, crate_id: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.release_lock(player, crate_id).await
    }

    async fn log_open(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: Option<&str>,
        at: i64,
    ) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.log_open(player, crate_id, reward_id, at).await
    }

    async fn record_delivery(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
        at: i64,
    ) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.record_delivery(player, crate_id, reward_id, at).await
    }

    async fn queue_pending_reward(&self, player: PlayerId, crate_id: &str, reward_id: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.queue_pending_reward(player, crate_id, reward_id).await
    }

    async fn pending_rewards(&self, player: PlayerId) -> Result<Vec<PendingReward>, StorageError> {
        self.maybe_fail()?;
        self.inner.pending_rewards(player).await
    }

    async fn mark_reward_delivered(&self, player: PlayerId, crate_id: &str, reward_id: &str) -> Result<bool, StorageError> {
        self.maybe_fail()?;
        self.inner.mark_reward_delivered(player, crate_id, reward_id).await
    }

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        self.maybe_fail()?;
        self.inner.snapshot().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.clear().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

async fn sqlite_backend(dir: &tempfile::TempDir, pool_size: u32, timeout_ms: u64) -> PooledSqlBackend {
    let config = StorageConfig {
        sql_url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("chaos.db").display())),
        pool_size,
        checkout_timeout_ms: timeout_ms,
        ..Default::default()
    };
    PooledSqlBackend::connect(&config).await.expect("sqlite backend")
}

// =============================================================================
// Fallback Transitions
// =============================================================================

#[tokio::test]
async fn chaos_degraded_state_is_sticky_after_primary_recovers() {
    // Only the third call fails; the primary is healthy again afterwards
    let primary = Arc::new(FailingBackend::new(LocalBackend::new(), vec![3], unavailable()));
    let secondary = Arc::new(FailingBackend::new(LocalBackend::new(), vec![], unavailable()));
    let fallback = FallbackBackend::new(primary.clone(), secondary.clone());
    let player = Uuid::new_v4();

    fallback.add_key(player, "vote", 5).await.unwrap();
    fallback.get_key_count(player, "vote").await.unwrap();
    assert_eq!(fallback.active_tier(), Tier::Primary);

    // Third primary call fails and is replayed on the secondary
    fallback.set_cooldown(player, "vote", 100).await.unwrap();
    assert!(fallback.is_degraded());
    assert_eq!(primary.calls(), 3);
    assert_eq!(secondary.calls(), 1);

    for _ in 0..20 {
        fallback.get_cooldown(player, "vote").await.unwrap();
    }
    assert_eq!(primary.calls(), 3, "primary must never be retried once degraded");
    assert_eq!(secondary.calls(), 21);

    // Secondary never saw the keys added on the primary
    assert_eq!(fallback.get_key_count(player, "vote").await.unwrap(), 0);
    assert_eq!(fallback.get_cooldown(player, "vote").await.unwrap(), Some(100));
}

#[tokio::test]
async fn chaos_backend_errors_do_not_trip() {
    let primary = Arc::new(FailingBackend::new(
        LocalBackend::new(),
        vec![1],
        StorageError::Backend("syntax error".into()),
    ));
    let fallback = FallbackBackend::new(primary.clone(), Arc::new(LocalBackend::new()));
    let player = Uuid::new_v4();

    let result = fallback.get_cooldown(player, "vote").await;
    assert!(matches!(result, Err(StorageError::Backend(_))));
    assert!(!fallback.is_degraded());

    fallback.set_cooldown(player, "vote", 1).await.unwrap();
    assert_eq!(primary.calls(), 2);
}

#[tokio::test]
async fn chaos_bookkeeping_survives_both_tiers_failing() {
    let primary = Arc::new(FailingBackend::fail_after(LocalBackend::new(), 0, unavailable()));
    let secondary = Arc::new(FailingBackend::fail_after(
        LocalBackend::new(),
        0,
        StorageError::Backend("secondary broken".into()),
    ));
    let fallback = FallbackBackend::new(primary, secondary);
    let player = Uuid::new_v4();

    assert!(fallback.log_open(player, "vote", Some("diamond"), 1).await.is_ok());
    assert!(fallback.record_delivery(player, "vote", "diamond", 2).await.is_ok());
    assert!(fallback.is_degraded());

    // Non-bookkeeping calls still report the secondary's failure
    assert!(fallback.get_cooldown(player, "vote").await.is_err());
}

// =============================================================================
// Real Pool Faults
// =============================================================================

#[tokio::test]
async fn chaos_pool_exhaustion_times_out_then_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let sql = Arc::new(sqlite_backend(&dir, 1, 50).await);
    let secondary = Arc::new(LocalBackend::new());
    let fallback = FallbackBackend::new(sql.clone(), secondary.clone());
    let player = Uuid::new_v4();

    // Hold the only connection
    let held = sql.checkout().await.unwrap();

    let started = Instant::now();
    assert!(fallback.acquire_lock(player, "vote").await.unwrap());
    assert!(started.elapsed() >= Duration::from_millis(40));

    assert!(fallback.is_degraded());
    assert_eq!(secondary.held_locks(), 1);
    drop(held);

    // Pool is free again but the fallback stays on the secondary
    assert!(!fallback.acquire_lock(player, "vote").await.unwrap());
    assert!(sql.acquire_lock(player, "vote").await.unwrap());
}

#[tokio::test]
async fn chaos_closed_pool_routes_to_secondary() {
    let dir = tempfile::tempdir().unwrap();
    let sql = Arc::new(sqlite_backend(&dir, 2, 200).await);
    let fallback = FallbackBackend::new(sql.clone(), Arc::new(LocalBackend::new()));
    let player = Uuid::new_v4();

    fallback.add_key(player, "vote", 2).await.unwrap();
    assert_eq!(fallback.name(), "sql");

    sql.close().await;

    fallback.add_key(player, "vote", 1).await.unwrap();
    assert_eq!(fallback.name(), "local");
    assert!(fallback.consume_key(player, "vote").await.unwrap());
    assert!(!fallback.consume_key(player, "vote").await.unwrap());
}

#[tokio::test]
async fn chaos_three_concurrent_checkouts_with_pool_of_two() {
    let dir = tempfile::tempdir().unwrap();
    let sql = Arc::new(sqlite_backend(&dir, 2, 50).await);

    let mut handles = vec![];
    for _ in 0..3 {
        let sql = sql.clone();
        handles.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = sql.checkout().await;
            let waited = started.elapsed();
            // Keep the connection until everyone has tried
            tokio::time::sleep(Duration::from_millis(200)).await;
            (result.map(|_| ()), waited)
        }));
    }

    let mut failures = vec![];
    for handle in handles {
        let (result, waited) = handle.await.unwrap();
        if let Err(e) = result {
            failures.push((e, waited));
        }
    }

    assert_eq!(failures.len(), 1);
    let (error, waited) = &failures[0];
    assert!(error.is_unavailable());
    assert!(*waited >= Duration::from_millis(40), "failed too early: {:?}", waited);
}
