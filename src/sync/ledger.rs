// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, append-only record of sync events.
//!
//! Schema (`{schema}` is the configured ledger prefix):
//! ```sql
//! CREATE TABLE {schema}_events (
//!     id            AUTOINCREMENT PRIMARY KEY,
//!     event_type    VARCHAR(32),
//!     origin_server VARCHAR(64),
//!     player_id     VARCHAR(36),
//!     crate_id      VARCHAR(64),
//!     reward_id     VARCHAR(64) NULL,
//!     created_at    BIGINT
//! )
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use super::event::{SyncEvent, SyncEventKind};
use super::SyncError;
use crate::config::is_identifier;
use crate::resilience::retry::{retry, RetryConfig};
use crate::types::PlayerId;

/// One stored event with its ledger position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Monotonic row id; usable as a replay cursor
    pub id: i64,
    pub event: SyncEvent,
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Newest first.
    async fn recent_for_player(&self, player: PlayerId, limit: usize) -> Result<Vec<LedgerEntry>, SyncError>;

    /// Entries with `id > after_id`, ascending.
    async fn entries_since(&self, after_id: i64, limit: usize) -> Result<Vec<LedgerEntry>, SyncError>;

    async fn is_healthy(&self) -> bool;

    async fn close(&self);
}

fn ledger_err(e: sqlx::Error) -> SyncError {
    match e {
        sqlx::Error::Configuration(e) => SyncError::InvalidConfig(e.to_string()),
        other => SyncError::Ledger(other.to_string()),
    }
}

/// Row limit as a SQL bind value; oversized limits saturate.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub struct SqlEventLedger {
    pool: AnyPool,
    table: String,
    is_sqlite: bool,
    /// Close the pool on `close()` only when this ledger opened it
    owns_pool: bool,
    schema_ready: OnceCell<()>,
    closed: AtomicBool,
}

impl SqlEventLedger {
    /// Ledger on an existing pool, typically the storage backend's.
    pub async fn from_pool(pool: AnyPool, is_sqlite: bool, schema: &str) -> Result<Self, SyncError> {
        Self::build(pool, is_sqlite, schema, false).await
    }

    /// Like [`SqlEventLedger::from_pool`], but the table is created on first
    /// use. For a pool whose database may not be reachable yet.
    pub fn from_pool_deferred(pool: AnyPool, is_sqlite: bool, schema: &str) -> Result<Self, SyncError> {
        Self::unready(pool, is_sqlite, schema, false)
    }

    /// Ledger with a pool of its own.
    pub async fn connect(url: &str, schema: &str, pool_size: u32) -> Result<Self, SyncError> {
        if !is_identifier(schema) {
            return Err(SyncError::InvalidConfig(format!("invalid ledger schema {:?}", schema)));
        }
        crate::storage::sql::install_drivers();
        let options = AnyPoolOptions::new().max_connections(pool_size.max(1));
        let pool = retry("ledger_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move { options.connect(url).await.map_err(ledger_err) }
        })
        .await?;
        Self::build(pool, url.starts_with("sqlite:"), schema, true).await
    }

    async fn build(pool: AnyPool, is_sqlite: bool, schema: &str, owns_pool: bool) -> Result<Self, SyncError> {
        let ledger = Self::unready(pool, is_sqlite, schema, owns_pool)?;
        ledger.ready().await?;
        info!(table = %ledger.table, "Event ledger ready");
        Ok(ledger)
    }

    fn unready(pool: AnyPool, is_sqlite: bool, schema: &str, owns_pool: bool) -> Result<Self, SyncError> {
        if !is_identifier(schema) {
            return Err(SyncError::InvalidConfig(format!("invalid ledger schema {:?}", schema)));
        }
        Ok(Self {
            pool,
            table: format!("{}_events", schema),
            is_sqlite,
            owns_pool,
            schema_ready: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Create the table once; a failed attempt is retried on the next call.
    async fn ready(&self) -> Result<(), SyncError> {
        self.schema_ready.get_or_try_init(|| self.init_schema()).await?;
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        // Table name is validated as an identifier in `unready`
        let statements = if self.is_sqlite {
            vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        event_type TEXT NOT NULL,
                        origin_server TEXT NOT NULL,
                        player_id TEXT NOT NULL,
                        crate_id TEXT NOT NULL,
                        reward_id TEXT,
                        created_at INTEGER NOT NULL
                    )",
                    self.table
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{0}_player ON {0} (player_id, id)",
                    self.table
                ),
            ]
        } else {
            vec![format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    event_type VARCHAR(32) NOT NULL,
                    origin_server VARCHAR(64) NOT NULL,
                    player_id VARCHAR(36) NOT NULL,
                    crate_id VARCHAR(64) NOT NULL,
                    reward_id VARCHAR(64),
                    created_at BIGINT NOT NULL,
                    INDEX idx_player (player_id, id)
                )",
                self.table
            )]
        };
        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(ledger_err)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Rows with an unknown event type or corrupt player id are skipped.
    fn decode(rows: &[AnyRow]) -> Result<Vec<LedgerEntry>, SyncError> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(ledger_err)?;
            let event_type: String = row.try_get("event_type").map_err(ledger_err)?;
            let player: String = row.try_get("player_id").map_err(ledger_err)?;

            let Some(kind) = SyncEventKind::parse(&event_type) else {
                warn!(id, %event_type, "Skipping ledger row with unknown event type");
                continue;
            };
            let Ok(player) = Uuid::parse_str(&player) else {
                warn!(id, "Skipping ledger row with corrupt player id");
                continue;
            };

            entries.push(LedgerEntry {
                id,
                event: SyncEvent {
                    kind,
                    origin_server: row.try_get("origin_server").map_err(ledger_err)?,
                    player,
                    crate_id: row.try_get("crate_id").map_err(ledger_err)?,
                    reward_id: row.try_get::<Option<String>, _>("reward_id").map_err(ledger_err)?,
                    timestamp: row.try_get("created_at").map_err(ledger_err)?,
                },
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl EventLedger for SqlEventLedger {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn append(&self, event: &SyncEvent) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.ready().await?;
        let sql = format!(
            "INSERT INTO {} (event_type, origin_server, player_id, crate_id, reward_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        );
        sqlx::query(&sql)
            .bind(event.kind.as_str())
            .bind(&event.origin_server)
            .bind(event.player.to_string())
            .bind(&event.crate_id)
            .bind(event.reward_id.as_deref())
            .bind(event.timestamp)
            .execute(&self.pool)
            .await
            .map_err(ledger_err)?;
        Ok(())
    }

    async fn recent_for_player(&self, player: PlayerId, limit: usize) -> Result<Vec<LedgerEntry>, SyncError> {
        self.ensure_open()?;
        self.ready().await?;
        let sql = format!(
            "SELECT id, event_type, origin_server, player_id, crate_id, reward_id, created_at
             FROM {} WHERE player_id = ? ORDER BY id DESC LIMIT ?",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(player.to_string())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(ledger_err)?;
        Self::decode(&rows)
    }

    async fn entries_since(&self, after_id: i64, limit: usize) -> Result<Vec<LedgerEntry>, SyncError> {
        self.ensure_open()?;
        self.ready().await?;
        let sql = format!(
            "SELECT id, event_type, origin_server, player_id, crate_id, reward_id, created_at
             FROM {} WHERE id > ? ORDER BY id ASC LIMIT ?",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(ledger_err)?;
        Self::decode(&rows)
    }

    async fn is_healthy(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owns_pool {
            self.pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_ledger(dir: &tempfile::TempDir) -> SqlEventLedger {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        SqlEventLedger::connect(&url, "crate_sync", 2).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = sqlite_ledger(&dir).await;
        let player = Uuid::new_v4();

        ledger.append(&SyncEvent::crate_opened("a", player, "vote", None).at(1)).await.unwrap();
        ledger.append(&SyncEvent::reward_granted("a", player, "vote", "diamond").at(2)).await.unwrap();
        ledger.append(&SyncEvent::key_consumed("b", Uuid::new_v4(), "vote").at(3)).await.unwrap();

        let recent = ledger.recent_for_player(player, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event.kind, SyncEventKind::RewardGranted);
        assert_eq!(recent[0].event.reward_id.as_deref(), Some("diamond"));
        assert_eq!(recent[1].event.reward_id, None);
        assert!(recent[0].id > recent[1].id);
    }

    #[tokio::test]
    async fn test_entries_since_is_an_ascending_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = sqlite_ledger(&dir).await;
        let player = Uuid::new_v4();
        for i in 0..5 {
            ledger.append(&SyncEvent::cooldown_set("a", player, "vote").at(i)).await.unwrap();
        }

        let first = ledger.entries_since(0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = ledger.entries_since(first[1].id, 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(rest[0].event.timestamp, 2);
    }

    #[tokio::test]
    async fn test_invalid_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        let result = SqlEventLedger::connect(&url, "bad-name", 1).await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unknown_url_scheme_fails_without_retry() {
        let started = std::time::Instant::now();
        let result = SqlEventLedger::connect("nosuchdb://localhost/crates", "crate_sync", 1).await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
        assert!(started.elapsed() < std::time::Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_unbounded_limit_reads_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = sqlite_ledger(&dir).await;
        let player = Uuid::new_v4();
        for i in 0..3 {
            ledger.append(&SyncEvent::cooldown_set("a", player, "vote").at(i)).await.unwrap();
        }

        assert_eq!(sql_limit(usize::MAX), i64::MAX);
        assert_eq!(ledger.entries_since(0, usize::MAX).await.unwrap().len(), 3);
        assert_eq!(ledger.recent_for_player(player, usize::MAX).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_deferred_ledger_creates_table_on_first_append() {
        crate::storage::sql::install_drivers();
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        let pool = AnyPoolOptions::new().max_connections(1).connect(&url).await.unwrap();

        let ledger = SqlEventLedger::from_pool_deferred(pool, true, "late").unwrap();
        let player = Uuid::new_v4();
        ledger.append(&SyncEvent::crate_opened("a", player, "vote", None)).await.unwrap();
        assert_eq!(ledger.recent_for_player(player, 1).await.unwrap().len(), 1);
        assert_eq!(ledger.table(), "late_events");
    }

    #[tokio::test]
    async fn test_closed_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = sqlite_ledger(&dir).await;
        assert!(ledger.is_healthy().await);
        ledger.close().await;

        assert!(!ledger.is_healthy().await);
        let event = SyncEvent::key_consumed("a", Uuid::new_v4(), "vote");
        assert_eq!(ledger.append(&event).await, Err(SyncError::Closed));
    }
}
