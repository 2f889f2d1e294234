//! Cross-server synchronization tests.
//!
//! Two coordinators ("A" and "B") share one in-process bus, which stands in
//! for the network transport. Each has its own observation cache.
//!
//! Run with: `cargo test --test sync`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate_sync::{
    EventBus, EventLedger, HealthMonitor, InProcessEventBus, LedgerEntry, ObservationCache, PlayerId,
    PublishOutcome, SqlEventLedger, SyncConfig, SyncCoordinator, SyncError, SyncEvent,
};

/// Ledger kept in memory with switchable health.
#[derive(Default)]
struct MemoryLedger {
    events: Mutex<Vec<SyncEvent>>,
    down: AtomicBool,
}

#[async_trait]
impl EventLedger for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, event: &SyncEvent) -> Result<(), SyncError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Ledger("connection lost".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn recent_for_player(&self, player: PlayerId, limit: usize) -> Result<Vec<LedgerEntry>, SyncError> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, e)| e.player == player)
            .take(limit)
            .map(|(i, e)| LedgerEntry { id: i as i64 + 1, event: e.clone() })
            .collect())
    }

    async fn entries_since(&self, after_id: i64, limit: usize) -> Result<Vec<LedgerEntry>, SyncError> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .enumerate()
            .map(|(i, e)| LedgerEntry { id: i as i64 + 1, event: e.clone() })
            .filter(|entry| entry.id > after_id)
            .take(limit)
            .collect())
    }

    async fn is_healthy(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn close(&self) {}
}

struct Server {
    coordinator: Arc<SyncCoordinator>,
    cache: Arc<ObservationCache>,
}

async fn server(id: &str, bus: Arc<InProcessEventBus>, ledger: Arc<MemoryLedger>) -> Server {
    let coordinator = Arc::new(SyncCoordinator::new(SyncConfig::for_server(id), bus, ledger).unwrap());
    let cache = Arc::new(ObservationCache::new());
    coordinator.start(cache.handler()).await.unwrap();
    Server { coordinator, cache }
}

/// Wait until `check` passes or a second has gone by.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn event_from_a_applies_on_b_but_not_on_a() {
    let bus = Arc::new(InProcessEventBus::new(64));
    let ledger = Arc::new(MemoryLedger::default());
    let a = server("A", bus.clone(), ledger.clone()).await;
    let b = server("B", bus.clone(), ledger.clone()).await;
    let player = Uuid::new_v4();

    let event = SyncEvent::cooldown_set("A", player, "vote").at(1_000);
    let outcome = a.coordinator.publish(&event).await;
    assert_eq!(outcome, PublishOutcome::Delivered { bus_ok: true, ledger_ok: true });

    assert!(eventually(|| b.cache.cooldown(player, "vote") == Some(1_000)).await);
    // The echo reaches A's own subscription asynchronously
    for _ in 0..100 {
        if a.coordinator.status().await.echoes_suppressed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = a.coordinator.status().await;
    assert_eq!(status.echoes_suppressed, 1);
    assert_eq!(status.inbound_applied, 0);
    assert_eq!(a.cache.cooldown(player, "vote"), None);
    assert_eq!(ledger.events.lock().len(), 1);
}

#[tokio::test]
async fn last_write_wins_across_servers() {
    let bus = Arc::new(InProcessEventBus::new(64));
    let ledger = Arc::new(MemoryLedger::default());
    let a = server("A", bus.clone(), ledger.clone()).await;
    let b = server("B", bus.clone(), ledger.clone()).await;
    let c = server("C", bus.clone(), ledger.clone()).await;
    let player = Uuid::new_v4();

    // Newer write lands first, the older one must not overwrite it on C
    a.coordinator.publish(&SyncEvent::cooldown_set("A", player, "vote").at(2_000)).await;
    b.coordinator.publish(&SyncEvent::cooldown_set("B", player, "vote").at(1_000)).await;

    assert!(eventually(|| ledger.events.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.cache.cooldown(player, "vote"), Some(2_000));
}

#[tokio::test]
async fn degraded_coordinator_publishes_nothing() {
    let bus = Arc::new(InProcessEventBus::new(64));
    let ledger = Arc::new(MemoryLedger::default());
    let a = server("A", bus.clone(), ledger.clone()).await;
    let b = server("B", bus.clone(), ledger.clone()).await;
    let player = Uuid::new_v4();

    ledger.down.store(true, Ordering::SeqCst);
    let monitor = HealthMonitor::new(a.coordinator.clone(), Duration::from_secs(60));
    assert!(!monitor.tick().await);
    ledger.down.store(false, Ordering::SeqCst);

    let outcome = a.coordinator.publish(&SyncEvent::key_consumed("A", player, "vote")).await;
    assert_eq!(outcome, PublishOutcome::Skipped);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.cache.is_empty());
    assert!(ledger.events.lock().is_empty());

    // Recovery of the ledger does not undo the degradation
    assert!(monitor.tick().await);
    assert!(a.coordinator.is_degraded());
    let lines = a.coordinator.status_lines().await;
    assert!(lines.contains(&"Degraded: true".to_string()));
    assert!(lines.contains(&"Failures: publish=0, ledger=0, health=1".to_string()));
}

#[tokio::test]
async fn bus_failure_still_reaches_ledger() {
    let bus = Arc::new(InProcessEventBus::new(8));
    let ledger = Arc::new(MemoryLedger::default());
    let a = server("A", bus.clone(), ledger.clone()).await;
    bus.close().await;

    let outcome = a.coordinator.publish(&SyncEvent::key_consumed("A", Uuid::new_v4(), "vote")).await;
    assert_eq!(outcome, PublishOutcome::Delivered { bus_ok: false, ledger_ok: true });
    assert_eq!(a.coordinator.status().await.publish_failures, 1);
    assert!(!bus.is_healthy().await);
}

#[tokio::test]
async fn sql_ledger_replays_published_events() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
    let ledger = Arc::new(SqlEventLedger::connect(&url, "crate_sync", 2).await.unwrap());
    let coordinator = SyncCoordinator::new(
        SyncConfig::for_server("A"),
        Arc::new(InProcessEventBus::new(8)),
        ledger.clone(),
    )
    .unwrap();
    let player = Uuid::new_v4();

    coordinator.publish(&SyncEvent::crate_opened("A", player, "vote", Some("gem".into()))).await;
    coordinator.publish(&SyncEvent::reward_granted("A", player, "vote", "gem")).await;

    let replay = ledger.entries_since(0, 100).await.unwrap();
    assert_eq!(replay.len(), 2);
    assert_eq!(replay[0].event.reward_id.as_deref(), Some("gem"));
    assert!(replay[0].id < replay[1].id);

    coordinator.close().await;
    assert!(!ledger.is_healthy().await);
}
