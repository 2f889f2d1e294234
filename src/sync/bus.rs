// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event::SyncEvent;
use super::SyncError;

/// Callback invoked for every event a subscription receives.
pub type EventHandler = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Best-effort broadcast of sync events to current subscribers.
///
/// Events published while nobody is subscribed are lost. Handlers run on
/// the bus's own tasks, never on the publisher's.
#[async_trait]
pub trait EventBus: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Start delivering events to `handler` until the bus is closed.
    async fn subscribe(&self, handler: EventHandler) -> Result<(), SyncError>;

    async fn is_healthy(&self) -> bool;

    /// Stop all subscriptions and reject further publishes. Idempotent.
    async fn close(&self);
}

/// Single-process bus over a tokio broadcast channel.
///
/// Several coordinators in one process can share it, which is how the
/// cross-server behavior is exercised without a network transport.
pub struct InProcessEventBus {
    sender: broadcast::Sender<SyncEvent>,
    subscribers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl InProcessEventBus {
    /// `capacity` events are buffered per subscriber before it lags.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn publish(&self, event: &SyncEvent) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        // Err only means nobody is listening
        if self.sender.send(event.clone()).is_err() {
            debug!(kind = %event.kind, "Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, handler: EventHandler) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let mut receiver = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.subscribers.lock().push(task);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.subscribers.lock().drain(..) {
            task.abort();
        }
    }
}
