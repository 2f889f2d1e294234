// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pooled relational backend (MySQL in production, SQLite for single hosts and tests).
//!
//! Schema:
//! ```sql
//! CREATE TABLE crate_cooldowns      (player_id, crate_id, last_used,   PRIMARY KEY (player_id, crate_id))
//! CREATE TABLE crate_keys           (player_id, crate_id, amount,      PRIMARY KEY (player_id, crate_id))
//! CREATE TABLE crate_locks          (player_id, crate_id, acquired_at, PRIMARY KEY (player_id, crate_id))
//! CREATE TABLE crate_open_history   (id AUTOINCREMENT, player_id, crate_id, reward_id NULL, opened_at)
//! CREATE TABLE crate_reward_history (id AUTOINCREMENT, player_id, crate_id, reward_id, delivered_at)
//! CREATE TABLE crate_pending_rewards(id AUTOINCREMENT, player_id, crate_id, reward_id, status, created_at)
//! ```
//!
//! ## Multi-process contention
//!
//! Several server processes share one database, so the two contended writes
//! are single statements rather than read-then-write:
//! - `consume_key` is `UPDATE ... SET amount = amount - 1 WHERE ... AND amount > 0`.
//!   Zero affected rows means the balance was already zero.
//! - `acquire_lock` is a plain `INSERT`; the primary key rejects a second holder.
//!
//! ## Pool
//!
//! Checkout waits at most `checkout_timeout` and then reports
//! [`StorageError::Unavailable`]. Connections are pinged before reuse and
//! replaced when dead. Every borrowed connection returns to the pool on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::traits::{ImportOutcome, StorageBackend, StorageError};
use crate::config::StorageConfig;
use crate::metrics::LatencyTimer;
use crate::resilience::retry::{retry, RetryConfig};
use crate::types::{
    now_millis, CooldownRecord, HistoryEntry, HistoryKind, KeyBalance, PendingReward, PlayerId,
    RewardStatus, StorageSnapshot,
};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Map a driver error onto the storage taxonomy.
///
/// Connectivity faults become `Unavailable`; everything else (constraint or
/// syntax errors reported by the server) is a plain backend error.
pub(crate) fn map_sqlx(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::PoolTimedOut => {
            crate::metrics::record_pool_timeout();
            StorageError::Unavailable("timed out waiting for a pooled connection".into())
        }
        sqlx::Error::PoolClosed => StorageError::Unavailable("connection pool is closed".into()),
        sqlx::Error::Io(e) => StorageError::Unavailable(format!("i/o error: {}", e)),
        sqlx::Error::Tls(e) => StorageError::Unavailable(format!("tls error: {}", e)),
        sqlx::Error::Protocol(e) => StorageError::Unavailable(format!("protocol error: {}", e)),
        sqlx::Error::WorkerCrashed => StorageError::Unavailable("database worker crashed".into()),
        sqlx::Error::Configuration(e) => StorageError::InvalidConfig(e.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

fn parse_player(raw: &str) -> Result<PlayerId, StorageError> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Backend(format!("corrupt player id {:?}: {}", raw, e)))
}

pub struct PooledSqlBackend {
    pool: AnyPool,
    is_sqlite: bool,
    closed: AtomicBool,
}

impl PooledSqlBackend {
    /// Open the pool and create the schema, retrying transient failures.
    ///
    /// A zero pool size or timeout is a configuration error and fails
    /// before any connection attempt.
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::connect_with_retry(config, &RetryConfig::startup()).await
    }

    /// [`PooledSqlBackend::connect`] with an explicit startup retry policy.
    #[instrument(skip(config, retry_config), fields(pool_size = config.pool_size, checkout_timeout_ms = config.checkout_timeout_ms))]
    pub async fn connect_with_retry(config: &StorageConfig, retry_config: &RetryConfig) -> Result<Self, StorageError> {
        let (url, options) = Self::pool_options(config)?;
        let is_sqlite = url.starts_with("sqlite:");

        let pool = retry("sql_connect", retry_config, || {
            let options = options.clone();
            async move { options.connect(url).await.map_err(map_sqlx) }
        })
        .await?;

        let backend = Self {
            pool,
            is_sqlite,
            closed: AtomicBool::new(false),
        };

        if is_sqlite {
            backend.enable_wal_mode().await?;
        }
        backend.init_schema().await?;

        info!(
            dialect = if is_sqlite { "sqlite" } else { "mysql" },
            pool_size = config.pool_size,
            checkout_timeout_ms = config.checkout_timeout_ms,
            "Relational storage backend ready"
        );
        Ok(backend)
    }

    /// Backend whose pool connects on first use. No connection is attempted
    /// and no schema is created here.
    ///
    /// Stands in as the primary of a [`super::FallbackBackend`] that starts
    /// degraded because the database was unreachable at startup.
    pub fn connect_lazy(config: &StorageConfig) -> Result<Self, StorageError> {
        let (url, options) = Self::pool_options(config)?;
        let pool = options.connect_lazy(url).map_err(map_sqlx)?;
        debug!("Relational storage pool created without connecting");
        Ok(Self {
            pool,
            is_sqlite: url.starts_with("sqlite:"),
            closed: AtomicBool::new(false),
        })
    }

    fn pool_options(config: &StorageConfig) -> Result<(&str, AnyPoolOptions), StorageError> {
        config.validate()?;
        let url = config
            .sql_url
            .as_deref()
            .ok_or_else(|| StorageError::InvalidConfig("sql_url is required for the relational backend".into()))?;

        install_drivers();
        let options = AnyPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.checkout_timeout())
            .idle_timeout(config.idle_timeout())
            .test_before_acquire(true);
        Ok((url, options))
    }

    /// Shared handle to the pool (for the event ledger).
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    /// Borrow a connection directly. Times out as `Unavailable`.
    pub async fn checkout(&self) -> Result<PoolConnection<Any>, StorageError> {
        self.pool.acquire().await.map_err(map_sqlx)
    }

    /// Probe connectivity with `SELECT 1`.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                "CREATE TABLE IF NOT EXISTS crate_cooldowns (
                    player_id TEXT NOT NULL,
                    crate_id TEXT NOT NULL,
                    last_used INTEGER NOT NULL,
                    PRIMARY KEY (player_id, crate_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_keys (
                    player_id TEXT NOT NULL,
                    crate_id TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    PRIMARY KEY (player_id, crate_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_locks (
                    player_id TEXT NOT NULL,
                    crate_id TEXT NOT NULL,
                    acquired_at INTEGER NOT NULL,
                    PRIMARY KEY (player_id, crate_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_open_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    player_id TEXT NOT NULL,
                    crate_id TEXT NOT NULL,
                    reward_id TEXT,
                    opened_at INTEGER NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS crate_reward_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    player_id TEXT NOT NULL,
                    crate_id TEXT NOT NULL,
                    reward_id TEXT NOT NULL,
                    delivered_at INTEGER NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS crate_pending_rewards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    player_id TEXT NOT NULL,
                    crate_id TEXT NOT NULL,
                    reward_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )",
            ]
        } else {
            &[
                "CREATE TABLE IF NOT EXISTS crate_cooldowns (
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    last_used BIGINT NOT NULL,
                    PRIMARY KEY (player_id, crate_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_keys (
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    amount BIGINT NOT NULL,
                    PRIMARY KEY (player_id, crate_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_locks (
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    acquired_at BIGINT NOT NULL,
                    PRIMARY KEY (player_id, crate_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_open_history (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    reward_id VARCHAR(64),
                    opened_at BIGINT NOT NULL,
                    INDEX idx_open_player (player_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_reward_history (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    reward_id VARCHAR(64) NOT NULL,
                    delivered_at BIGINT NOT NULL,
                    INDEX idx_reward_player (player_id)
                )",
                "CREATE TABLE IF NOT EXISTS crate_pending_rewards (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    reward_id VARCHAR(64) NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    created_at BIGINT NOT NULL,
                    INDEX idx_pending_player (player_id, status)
                )",
            ]
        };

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }

    fn upsert_cooldown_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO crate_cooldowns (player_id, crate_id, last_used) VALUES (?, ?, ?)
             ON CONFLICT(player_id, crate_id) DO UPDATE SET last_used = excluded.last_used"
        } else {
            "INSERT INTO crate_cooldowns (player_id, crate_id, last_used) VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE last_used = VALUES(last_used)"
        }
    }

    fn upsert_keys_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO crate_keys (player_id, crate_id, amount) VALUES (?, ?, ?)
             ON CONFLICT(player_id, crate_id) DO UPDATE SET amount = crate_keys.amount + excluded.amount"
        } else {
            "INSERT INTO crate_keys (player_id, crate_id, amount) VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE amount = amount + VALUES(amount)"
        }
    }

    /// Record the operation outcome and pass the result through.
    fn observe<T>(&self, operation: &'static str, result: Result<T, StorageError>) -> Result<T, StorageError> {
        let status = match &result {
            Ok(_) => "success",
            Err(StorageError::Unavailable(_)) => "unavailable",
            Err(_) => "error",
        };
        crate::metrics::record_operation("sql", operation, status);
        result
    }

    /// Bookkeeping policy: only `Unavailable` reaches the caller.
    fn absorb(&self, operation: &'static str, result: Result<(), StorageError>) -> Result<(), StorageError> {
        match result {
            Err(StorageError::Unavailable(reason)) => Err(StorageError::Unavailable(reason)),
            Err(e) => {
                warn!(operation, error = %e, "History write failed; continuing");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn history_row(row: &AnyRow, kind: HistoryKind, at_column: &str) -> Result<HistoryEntry, StorageError> {
        let player: String = row.try_get("player_id").map_err(map_sqlx)?;
        Ok(HistoryEntry {
            player: parse_player(&player)?,
            crate_id: row.try_get("crate_id").map_err(map_sqlx)?,
            reward_id: row.try_get::<Option<String>, _>("reward_id").map_err(map_sqlx)?,
            kind,
            at: row.try_get(at_column).map_err(map_sqlx)?,
        })
    }
}

#[async_trait]
impl StorageBackend for PooledSqlBackend {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn supports_history(&self) -> bool {
        true
    }

    async fn get_cooldown(&self, player: PlayerId, crate_id: &str) -> Result<Option<i64>, StorageError> {
        let _timer = LatencyTimer::new("sql", "get_cooldown");
        let result = sqlx::query("SELECT last_used FROM crate_cooldowns WHERE player_id = ? AND crate_id = ?")
            .bind(player.to_string())
            .bind(crate_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
            .and_then(|row| match row {
                Some(row) => row.try_get::<i64, _>("last_used").map(Some).map_err(map_sqlx),
                None => Ok(None),
            });
        self.observe("get_cooldown", result)
    }

    async fn set_cooldown(&self, player: PlayerId, crate_id: &str, at: i64) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("sql", "set_cooldown");
        let result = sqlx::query(self.upsert_cooldown_sql())
            .bind(player.to_string())
            .bind(crate_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx);
        self.observe("set_cooldown", result)
    }

    async fn get_key_count(&self, player: PlayerId, crate_id: &str) -> Result<u32, StorageError> {
        let _timer = LatencyTimer::new("sql", "get_key_count");
        let result = sqlx::query("SELECT amount FROM crate_keys WHERE player_id = ? AND crate_id = ?")
            .bind(player.to_string())
            .bind(crate_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
            .and_then(|row| match row {
                Some(row) => row
                    .try_get::<i64, _>("amount")
                    .map(|amount| amount.clamp(0, i64::from(u32::MAX)) as u32)
                    .map_err(map_sqlx),
                None => Ok(0),
            });
        self.observe("get_key_count", result)
    }

    async fn add_key(&self, player: PlayerId, crate_id: &str, amount: u32) -> Result<(), StorageError> {
        if amount == 0 {
            return Err(StorageError::InvalidInput("key amount must be positive".into()));
        }
        let _timer = LatencyTimer::new("sql", "add_key");
        let result = sqlx::query(self.upsert_keys_sql())
            .bind(player.to_string())
            .bind(crate_id)
            .bind(i64::from(amount))
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx);
        self.observe("add_key", result)
    }

    async fn consume_key(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        let _timer = LatencyTimer::new("sql", "consume_key");
        let player = player.to_string();

        let result: Result<bool, StorageError> = async {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

            let updated = sqlx::query(
                "UPDATE crate_keys SET amount = amount - 1 WHERE player_id = ? AND crate_id = ? AND amount > 0",
            )
            .bind(&player)
            .bind(crate_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if updated.rows_affected() == 0 {
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(false);
            }

            sqlx::query("DELETE FROM crate_keys WHERE player_id = ? AND crate_id = ? AND amount <= 0")
                .bind(&player)
                .bind(crate_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;

            tx.commit().await.map_err(map_sqlx)?;
            Ok(true)
        }
        .await;

        self.observe("consume_key", result)
    }

    async fn acquire_lock(&self, player: PlayerId, crate_id: &str) -> Result<bool, StorageError> {
        let _timer = LatencyTimer::new("sql", "acquire_lock");
        let result = sqlx::query("INSERT INTO crate_locks (player_id, crate_id, acquired_at) VALUES (?, ?, ?)")
            .bind(player.to_string())
            .bind(crate_id)
            .bind(now_millis())
            .execute(&self.pool)
            .await;

        let result = match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!(%player, crate_id, "Lock already held");
                Ok(false)
            }
            Err(e) => Err(map_sqlx(e)),
        };
        self.observe("acquire_lock", result)
    }

    async fn release_lock(&self, player: PlayerId, crate_id: &str) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM crate_locks WHERE player_id = ? AND crate_id = ?")
            .bind(player.to_string())
            .bind(crate_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx);
        self.observe("release_lock", result)
    }

    async fn log_open(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: Option<&str>,
        at: i64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "INSERT INTO crate_open_history (player_id, crate_id, reward_id, opened_at) VALUES (?, ?, ?, ?)",
        )
        .bind(player.to_string())
        .bind(crate_id)
        .bind(reward_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_sqlx);
        let result = self.observe("log_open", result);
        self.absorb("log_open", result)
    }

    async fn record_delivery(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
        at: i64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "INSERT INTO crate_reward_history (player_id, crate_id, reward_id, delivered_at) VALUES (?, ?, ?, ?)",
        )
        .bind(player.to_string())
        .bind(crate_id)
        .bind(reward_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_sqlx);
        let result = self.observe("record_delivery", result);
        self.absorb("record_delivery", result)
    }

    async fn queue_pending_reward(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "INSERT INTO crate_pending_rewards (player_id, crate_id, reward_id, status, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(player.to_string())
        .bind(crate_id)
        .bind(reward_id)
        .bind(RewardStatus::Pending.as_str())
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_sqlx);
        self.observe("queue_pending_reward", result)
    }

    async fn pending_rewards(&self, player: PlayerId) -> Result<Vec<PendingReward>, StorageError> {
        let result: Result<Vec<PendingReward>, StorageError> = async {
            let rows = sqlx::query(
                "SELECT crate_id, reward_id, status, created_at FROM crate_pending_rewards
                 WHERE player_id = ? AND status = ? ORDER BY id",
            )
            .bind(player.to_string())
            .bind(RewardStatus::Pending.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

            rows.iter()
                .map(|row| {
                    let status: String = row.try_get("status").map_err(map_sqlx)?;
                    Ok(PendingReward {
                        crate_id: row.try_get("crate_id").map_err(map_sqlx)?,
                        reward_id: row.try_get("reward_id").map_err(map_sqlx)?,
                        status: RewardStatus::parse(&status),
                        created_at: row.try_get("created_at").map_err(map_sqlx)?,
                    })
                })
                .collect::<Result<Vec<_>, StorageError>>()
        }
        .await;
        self.observe("pending_rewards", result)
    }

    async fn mark_reward_delivered(
        &self,
        player: PlayerId,
        crate_id: &str,
        reward_id: &str,
    ) -> Result<bool, StorageError> {
        let player = player.to_string();
        let result: Result<bool, StorageError> = async {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

            let row = sqlx::query(
                "SELECT id FROM crate_pending_rewards
                 WHERE player_id = ? AND crate_id = ? AND reward_id = ? AND status = ?
                 ORDER BY id LIMIT 1",
            )
            .bind(&player)
            .bind(crate_id)
            .bind(reward_id)
            .bind(RewardStatus::Pending.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let Some(row) = row else {
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(false);
            };
            let id: i64 = row.try_get("id").map_err(map_sqlx)?;

            // Conditional on status so a concurrent delivery of the same row loses
            let updated = sqlx::query("UPDATE crate_pending_rewards SET status = ? WHERE id = ? AND status = ?")
                .bind(RewardStatus::Delivered.as_str())
                .bind(id)
                .bind(RewardStatus::Pending.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            if updated.rows_affected() == 0 {
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(false);
            }

            sqlx::query(
                "INSERT INTO crate_reward_history (player_id, crate_id, reward_id, delivered_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&player)
            .bind(crate_id)
            .bind(reward_id)
            .bind(now_millis())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            tx.commit().await.map_err(map_sqlx)?;
            Ok(true)
        }
        .await;
        self.observe("mark_reward_delivered", result)
    }

    #[instrument(skip(self))]
    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        let started = Instant::now();
        // One transaction so the three reads see the same point in time
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let cooldown_rows = sqlx::query("SELECT player_id, crate_id, last_used FROM crate_cooldowns")
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let key_rows = sqlx::query("SELECT player_id, crate_id, amount FROM crate_keys WHERE amount > 0")
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let open_rows = sqlx::query(
            "SELECT player_id, crate_id, reward_id, opened_at FROM crate_open_history ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        let delivery_rows = sqlx::query(
            "SELECT player_id, crate_id, reward_id, delivered_at FROM crate_reward_history ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        let mut snapshot = StorageSnapshot::default();
        for row in &cooldown_rows {
            let player: String = row.try_get("player_id").map_err(map_sqlx)?;
            snapshot.cooldowns.push(CooldownRecord {
                player: parse_player(&player)?,
                crate_id: row.try_get("crate_id").map_err(map_sqlx)?,
                last_used: row.try_get("last_used").map_err(map_sqlx)?,
            });
        }
        for row in &key_rows {
            let player: String = row.try_get("player_id").map_err(map_sqlx)?;
            let amount: i64 = row.try_get("amount").map_err(map_sqlx)?;
            snapshot.key_balances.push(KeyBalance {
                player: parse_player(&player)?,
                crate_id: row.try_get("crate_id").map_err(map_sqlx)?,
                amount: amount.clamp(0, i64::from(u32::MAX)) as u32,
            });
        }
        for row in &open_rows {
            snapshot.history.push(Self::history_row(row, HistoryKind::Open, "opened_at")?);
        }
        for row in &delivery_rows {
            snapshot.history.push(Self::history_row(row, HistoryKind::Delivery, "delivered_at")?);
        }

        debug!(counts = %snapshot.counts(), elapsed = ?started.elapsed(), "Snapshot taken");
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for table in [
            "crate_cooldowns",
            "crate_keys",
            "crate_locks",
            "crate_open_history",
            "crate_reward_history",
            "crate_pending_rewards",
        ] {
            // Table names come from the fixed list above
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    /// Import the whole snapshot in one transaction.
    #[instrument(skip(self, snapshot), fields(counts = %snapshot.counts()))]
    async fn import(&self, snapshot: &StorageSnapshot) -> Result<ImportOutcome, StorageError> {
        let mut outcome = ImportOutcome::default();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        for record in &snapshot.cooldowns {
            sqlx::query(self.upsert_cooldown_sql())
                .bind(record.player.to_string())
                .bind(&record.crate_id)
                .bind(record.last_used)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            outcome.cooldowns += 1;
        }

        for balance in snapshot.key_balances.iter().filter(|b| b.amount > 0) {
            sqlx::query(self.upsert_keys_sql())
                .bind(balance.player.to_string())
                .bind(&balance.crate_id)
                .bind(i64::from(balance.amount))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            outcome.key_balances += 1;
        }

        for entry in &snapshot.history {
            let sql = match entry.kind {
                HistoryKind::Open => {
                    "INSERT INTO crate_open_history (player_id, crate_id, reward_id, opened_at) VALUES (?, ?, ?, ?)"
                }
                HistoryKind::Delivery => {
                    "INSERT INTO crate_reward_history (player_id, crate_id, reward_id, delivered_at) VALUES (?, ?, ?, ?)"
                }
            };
            let reward = match entry.kind {
                HistoryKind::Open => entry.reward_id.clone(),
                HistoryKind::Delivery => Some(entry.reward_id.clone().unwrap_or_default()),
            };
            sqlx::query(sql)
                .bind(entry.player.to_string())
                .bind(&entry.crate_id)
                .bind(reward)
                .bind(entry.at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            outcome.history += 1;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(outcome)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        info!("Relational storage backend closed");
    }
}

impl std::fmt::Debug for PooledSqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSqlBackend")
            .field("is_sqlite", &self.is_sqlite)
            .field("pool_size", &self.pool.size())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
