// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound broadcast plus inbound filtering for one server.
//!
//! # Failure policy
//!
//! Nothing here fails the gameplay code that asked for a publish. Bus and
//! ledger faults are logged and counted, and show up only in
//! [`SyncCoordinator::status_lines`]. Once degraded, publishes are skipped
//! outright; no backlog is kept for the unhealthy transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bus::{EventBus, EventHandler};
use super::event::SyncEvent;
use super::ledger::EventLedger;
use super::SyncError;
use crate::config::{ConsistencyMode, SyncConfig};

/// What happened to one outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sync disabled, degraded or closed; nothing was attempted
    Skipped,
    Delivered { bus_ok: bool, ledger_ok: bool },
}

impl PublishOutcome {
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// Both the bus and the ledger accepted the event.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Delivered { bus_ok: true, ledger_ok: true })
    }
}

/// Point-in-time diagnostics for the operator status command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub consistency: String,
    pub server_id: String,
    pub bus: &'static str,
    pub bus_healthy: bool,
    pub ledger: &'static str,
    pub ledger_healthy: bool,
    pub degraded: bool,
    pub published: u64,
    pub publish_failures: u64,
    pub ledger_failures: u64,
    pub health_failures: u64,
    pub echoes_suppressed: u64,
    pub inbound_applied: u64,
}

fn health_label(healthy: bool) -> &'static str {
    if healthy {
        "healthy"
    } else {
        "unhealthy"
    }
}

impl SyncStatus {
    /// Human-readable lines, one fact each.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Sync enabled: {}", self.enabled),
            format!("Consistency: {}", self.consistency),
            format!("Server id: {}", self.server_id),
            format!("Transport: {} ({})", self.bus, health_label(self.bus_healthy)),
            format!("Ledger: {} ({})", self.ledger, health_label(self.ledger_healthy)),
            format!("Degraded: {}", self.degraded),
            format!(
                "Failures: publish={}, ledger={}, health={}",
                self.publish_failures, self.ledger_failures, self.health_failures
            ),
            format!(
                "Events: published={}, applied={}, echoes suppressed={}",
                self.published, self.inbound_applied, self.echoes_suppressed
            ),
        ]
    }
}

pub struct SyncCoordinator {
    config: SyncConfig,
    bus: Arc<dyn EventBus>,
    ledger: Arc<dyn EventLedger>,
    /// One-way; see [`SyncCoordinator::mark_degraded`]
    degraded: AtomicBool,
    closed: AtomicBool,
    started: AtomicBool,
    handler: RwLock<Option<EventHandler>>,
    published: AtomicU64,
    publish_failures: AtomicU64,
    ledger_failures: AtomicU64,
    health_failures: AtomicU64,
    echoes_suppressed: AtomicU64,
    inbound_applied: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        bus: Arc<dyn EventBus>,
        ledger: Arc<dyn EventLedger>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        if config.consistency == ConsistencyMode::Strong {
            info!("Strong consistency requested; recorded for status only");
        }
        Ok(Self {
            config,
            bus,
            ledger,
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            handler: RwLock::new(None),
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            ledger_failures: AtomicU64::new(0),
            health_failures: AtomicU64::new(0),
            echoes_suppressed: AtomicU64::new(0),
            inbound_applied: AtomicU64::new(0),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<dyn EventLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Stop outbound sync for the rest of this coordinator's life.
    ///
    /// There is no way back: recovery means restarting the process.
    pub fn mark_degraded(&self, reason: &str) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(server_id = %self.config.server_id, reason, "Sync degraded; outbound events suppressed until restart");
        crate::metrics::set_sync_degraded(true);
    }

    pub(crate) fn record_health_failure(&self) {
        self.health_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Broadcast and persist one event. Never fails the caller.
    pub async fn publish(&self, event: &SyncEvent) -> PublishOutcome {
        if !self.config.enabled || self.is_degraded() || self.closed.load(Ordering::Acquire) {
            crate::metrics::record_publish("all", "skipped");
            return PublishOutcome::Skipped;
        }

        let (bus_result, ledger_result) = tokio::join!(self.bus.publish(event), self.ledger.append(event));

        let bus_ok = match bus_result {
            Ok(()) => {
                crate::metrics::record_publish("bus", "ok");
                true
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_publish("bus", "failed");
                warn!(bus = self.bus.name(), kind = %event.kind, error = %e, "Event broadcast failed");
                false
            }
        };
        let ledger_ok = match ledger_result {
            Ok(()) => {
                crate::metrics::record_publish("ledger", "ok");
                true
            }
            Err(e) => {
                self.ledger_failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_publish("ledger", "failed");
                warn!(ledger = self.ledger.name(), kind = %event.kind, error = %e, "Ledger append failed");
                false
            }
        };

        self.published.fetch_add(1, Ordering::Relaxed);
        PublishOutcome::Delivered { bus_ok, ledger_ok }
    }

    /// Subscribe to the bus and route inbound events through
    /// [`handle_inbound`](Self::handle_inbound) to `handler`.
    ///
    /// Does nothing when sync is disabled.
    pub async fn start(self: &Arc<Self>, handler: EventHandler) -> Result<(), SyncError> {
        if !self.config.enabled {
            debug!("Sync disabled; not subscribing");
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyStarted);
        }
        *self.handler.write() = Some(handler);

        // Weak so a subscription task never keeps a closed coordinator alive
        let weak: Weak<Self> = Arc::downgrade(self);
        let subscribed = self
            .bus
            .subscribe(Arc::new(move |event| {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.handle_inbound(event);
                }
            }))
            .await;
        if let Err(e) = subscribed {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        info!(
            server_id = %self.config.server_id,
            bus = self.bus.name(),
            channel = %self.config.channel,
            "Sync coordinator listening"
        );
        Ok(())
    }

    /// Drop echoes of our own events, hand the rest to the handler.
    /// Returns whether the event was dispatched.
    pub fn handle_inbound(&self, event: SyncEvent) -> bool {
        if event.origin_server == self.config.server_id {
            self.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_echo_suppressed();
            return false;
        }
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            return false;
        };
        crate::metrics::record_inbound_applied(event.kind.as_str());
        handler(event);
        self.inbound_applied.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub async fn status(&self) -> SyncStatus {
        let (bus_healthy, ledger_healthy) = tokio::join!(self.bus.is_healthy(), self.ledger.is_healthy());
        SyncStatus {
            enabled: self.config.enabled,
            consistency: self.config.consistency.to_string(),
            server_id: self.config.server_id.clone(),
            bus: self.bus.name(),
            bus_healthy,
            ledger: self.ledger.name(),
            ledger_healthy,
            degraded: self.is_degraded(),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            ledger_failures: self.ledger_failures.load(Ordering::Relaxed),
            health_failures: self.health_failures.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            inbound_applied: self.inbound_applied.load(Ordering::Relaxed),
        }
    }

    pub async fn status_lines(&self) -> Vec<String> {
        self.status().await.lines()
    }

    /// Close the bus and the ledger. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler.write().take();
        self.bus.close().await;
        self.ledger.close().await;
        info!(server_id = %self.config.server_id, "Sync coordinator closed");
    }
}
