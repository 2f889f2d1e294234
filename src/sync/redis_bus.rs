// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis pub/sub transport.
//!
//! Events are JSON strings on one channel. Publishing and health probes share
//! a `ConnectionManager` (auto-reconnecting). Every subscription owns a
//! dedicated pub/sub connection on its own task, because a connection in
//! subscribe mode cannot issue other commands.
//!
//! Pub/sub is fire-and-forget: a server that is disconnected while an event
//! is published never sees it. The ledger is the durable record.
//!
//! When a subscription's stream ends (server restart, killed client) its task
//! reconnects and resubscribes with backoff. Until it is back the bus reports
//! itself unhealthy, which is what lets the health monitor notice.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, PubSub};
use redis::Client;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::bus::{EventBus, EventHandler};
use super::event::SyncEvent;
use super::SyncError;
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisEventBus {
    client: Client,
    connection: ConnectionManager,
    channel: String,
    subscribers: Mutex<Vec<JoinHandle<()>>>,
    /// Subscriptions whose stream ended and are not yet resubscribed
    lost_subscriptions: Arc<AtomicUsize>,
    closed: AtomicBool,
}

async fn open_subscription(client: &Client, channel: &str) -> Result<PubSub, SyncError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Deliver until the stream ends.
async fn pump(pubsub: PubSub, channel: &str, handler: &EventHandler) {
    let mut messages = std::pin::pin!(pubsub.into_on_message());
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "Unreadable pub/sub payload");
                continue;
            }
        };
        match SyncEvent::from_json(&payload) {
            Ok(event) => handler(event),
            Err(e) => warn!(channel, error = %e, "Dropping malformed sync event"),
        }
    }
}

/// Keep trying until the channel is subscribed again.
async fn resubscribe(client: &Client, channel: &str) -> PubSub {
    let policy = RetryConfig::startup();
    loop {
        match retry("redis_bus_resubscribe", &policy, || open_subscription(client, channel)).await {
            Ok(pubsub) => return pubsub,
            Err(e) => {
                warn!(channel, error = %e, "Resubscribe failed; backing off");
                sleep(policy.max_delay).await;
            }
        }
    }
}

impl RedisEventBus {
    pub async fn connect(url: &str, channel: &str) -> Result<Self, SyncError> {
        let client = Client::open(url).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let connection = retry("redis_bus_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await.map_err(SyncError::from)
        })
        .await?;

        info!(channel, "Redis event bus connected");
        Ok(Self {
            client,
            connection,
            channel: channel.to_string(),
            subscribers: Mutex::new(Vec::new()),
            lost_subscriptions: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscriptions currently reconnecting.
    #[must_use]
    pub fn lost_subscriptions(&self) -> usize {
        self.lost_subscriptions.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, event: &SyncEvent) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let payload = event.to_json()?;
        let mut conn = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(kind = %event.kind, receivers, "Event published");
        Ok(())
    }

    async fn subscribe(&self, handler: EventHandler) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let mut pubsub = open_subscription(&self.client, &self.channel).await?;

        let client = self.client.clone();
        let channel = self.channel.clone();
        let lost = self.lost_subscriptions.clone();
        let task = tokio::spawn(async move {
            loop {
                pump(pubsub, &channel, &handler).await;
                warn!(channel, "Pub/sub stream ended; resubscribing");
                lost.fetch_add(1, Ordering::AcqRel);
                pubsub = resubscribe(&client, &channel).await;
                lost.fetch_sub(1, Ordering::AcqRel);
                info!(channel, "Pub/sub subscription restored");
            }
        });
        self.subscribers.lock().push(task);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || self.lost_subscriptions() > 0 {
            return false;
        }
        let mut conn = self.connection.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        matches!(result.as_deref(), Ok("PONG"))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.subscribers.lock().drain(..) {
            task.abort();
        }
        info!(channel = %self.channel, "Redis event bus closed");
    }
}
