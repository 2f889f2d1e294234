// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic bus/ledger probe that can switch outbound sync off.
//!
//! Runs on its own task, off the request path. An unhealthy observation
//! degrades the coordinator permanently; a later healthy tick does not
//! restore it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::coordinator::SyncCoordinator;

pub struct HealthMonitor {
    coordinator: Arc<SyncCoordinator>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(coordinator: Arc<SyncCoordinator>, interval: Duration) -> Self {
        Self { coordinator, interval }
    }

    /// Probe once. Returns whether both components were healthy.
    pub async fn tick(&self) -> bool {
        let bus = self.coordinator.bus();
        let ledger = self.coordinator.ledger();
        let (bus_healthy, ledger_healthy) = tokio::join!(bus.is_healthy(), ledger.is_healthy());

        crate::metrics::record_health_probe("bus", bus_healthy);
        crate::metrics::record_health_probe("ledger", ledger_healthy);

        if !bus_healthy {
            self.coordinator.record_health_failure();
            warn!(bus = bus.name(), "Event bus health probe failed");
        }
        if !ledger_healthy {
            self.coordinator.record_health_failure();
            warn!(ledger = ledger.name(), "Event ledger health probe failed");
        }

        let healthy = bus_healthy && ledger_healthy;
        if healthy {
            debug!("Sync health probe ok");
        } else {
            self.coordinator.mark_degraded("health probe failed");
        }
        healthy
    }

    /// Run [`tick`](Self::tick) every interval until stopped.
    pub fn spawn(self) -> HealthMonitorHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Sync health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!("Sync health monitor stopped");
        });

        HealthMonitorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Owner of a running monitor task.
pub struct HealthMonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    /// Stop the monitor and wait for its task to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!(error = %e, "Sync health monitor task failed");
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sync::bus::InProcessEventBus;
    use crate::sync::event::SyncEvent;
    use crate::sync::ledger::{EventLedger, LedgerEntry};
    use crate::sync::SyncError;
    use crate::types::PlayerId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Ledger whose health is controlled by the test.
    struct SwitchLedger {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl EventLedger for SwitchLedger {
        fn name(&self) -> &'static str {
            "switch"
        }
        async fn append(&self, _: &SyncEvent) -> Result<(), SyncError> {
            Ok(())
        }
        async fn recent_for_player(&self, _: PlayerId, _: usize) -> Result<Vec<LedgerEntry>, SyncError> {
            Ok(Vec::new())
        }
        async fn entries_since(&self, _: i64, _: usize) -> Result<Vec<LedgerEntry>, SyncError> {
            Ok(Vec::new())
        }
        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        async fn close(&self) {}
    }

    fn setup() -> (Arc<SwitchLedger>, Arc<SyncCoordinator>) {
        let ledger = Arc::new(SwitchLedger { healthy: AtomicBool::new(true) });
        let coordinator = Arc::new(
            SyncCoordinator::new(
                SyncConfig::for_server("a"),
                Arc::new(InProcessEventBus::new(4)),
                ledger.clone(),
            )
            .unwrap(),
        );
        (ledger, coordinator)
    }

    #[tokio::test]
    async fn test_degradation_is_one_way() {
        let (ledger, coordinator) = setup();
        let monitor = HealthMonitor::new(coordinator.clone(), Duration::from_secs(60));

        assert!(monitor.tick().await);
        assert!(!coordinator.is_degraded());

        ledger.healthy.store(false, Ordering::SeqCst);
        assert!(!monitor.tick().await);
        assert!(coordinator.is_degraded());

        ledger.healthy.store(true, Ordering::SeqCst);
        assert!(monitor.tick().await);
        assert!(coordinator.is_degraded());
        assert_eq!(coordinator.status().await.health_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_ticks_until_stopped() {
        let (ledger, coordinator) = setup();
        ledger.healthy.store(false, Ordering::SeqCst);

        let handle = HealthMonitor::new(coordinator.clone(), Duration::from_secs(10)).spawn();
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_secs(25)).await;
        // Ticks at 0s, 10s, 20s
        assert_eq!(coordinator.status().await.health_failures, 3);
        assert!(coordinator.is_degraded());

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(coordinator.status().await.health_failures, 3);
    }
}
