//! Queue transport.
//!
//! Each message is appended to a broker list and popped by exactly one
//! consumer. Producers refresh a TTL on every push so abandoned queues expire,
//! and periodically check the queue depth to drop messages when consumers
//! fall behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::dispatch::process_message;
use super::{namespaced, ChannelRegistry, Opened};
use crate::broker::{BrokerConnection, ConnectionPool};
use crate::envelope;
use crate::interfaces::broker::BrokerError;
use crate::interfaces::transport::{Listener, ListenerId, Result, Transport, TransportKind};

/// Delay before popping again after a broker failure.
const POP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Queue limits applied by producers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Emits between depth checks on a channel.
    pub check_interval: u32,
    /// Depth above which a checked emit is dropped.
    pub max_depth: usize,
    /// Expiry refreshed on the queue key by every push.
    #[serde(rename = "ttl_secs", with = "crate::config::duration_secs")]
    pub ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            check_interval: 10,
            max_depth: 100,
            ttl: Duration::from_secs(30),
        }
    }
}

/// Push/pull transport over a broker.
pub struct PushPullTransport {
    pool: Arc<ConnectionPool>,
    registry: ChannelRegistry,
    queue: QueueConfig,
    /// Emits since the last depth check, per queue key.
    emit_counts: Mutex<HashMap<String, u32>>,
}

impl PushPullTransport {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_queue_config(pool, QueueConfig::default())
    }

    pub fn with_queue_config(pool: Arc<ConnectionPool>, queue: QueueConfig) -> Self {
        info!(
            endpoint = %pool.endpoint(),
            check_interval = queue.check_interval,
            max_depth = queue.max_depth,
            ttl_secs = queue.ttl.as_secs(),
            "Push/pull transport initialized"
        );
        Self {
            pool,
            registry: ChannelRegistry::new(),
            queue,
            emit_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue
    }

    fn key(&self, channel: &str) -> Result<String> {
        namespaced(TransportKind::PushPull, channel)
    }

    /// Whether this emit must check the queue depth. Resets the counter when
    /// it does.
    fn take_depth_check(&self, key: &str) -> bool {
        let mut counts = self.emit_counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(key.to_string()).or_insert(0);
        if *count >= self.queue.check_interval {
            *count = 0;
            return true;
        }
        false
    }

    fn count_emit(&self, key: &str) {
        let mut counts = self.emit_counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Pop payloads one at a time and dispatch them until the connection closes.
async fn consume(connection: Arc<BrokerConnection>, registry: ChannelRegistry, key: String) {
    while !connection.is_closing() {
        match connection.blpop(&key).await {
            Ok(Some(payload)) => {
                process_message(&registry, &key, &payload).await;
            }
            Ok(None) => {}
            Err(BrokerError::Closed(_)) => break,
            // Already reported to the error sink.
            Err(_) => {
                tokio::select! {
                    _ = connection.closing() => break,
                    _ = tokio::time::sleep(POP_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!(channel = %key, connection.id = %connection.id(), "Consumer stopped");
}

#[async_trait]
impl Transport for PushPullTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PushPull
    }

    async fn on(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        let key = self.key(channel)?;
        let (id, _) = self
            .registry
            .add(&key, listener, || {
                let connection = self.pool.open();
                debug!(channel = %key, connection.id = %connection.id(), "Consumer started");
                let consumer = tokio::spawn(consume(
                    Arc::clone(&connection),
                    self.registry.clone(),
                    key.clone(),
                ));
                // Queued messages wait for the consumer; there is nothing to
                // wait for here.
                Opened {
                    connection,
                    consumer,
                    ready: watch::channel(true).1,
                }
            })
            .await;
        Ok(id)
    }

    async fn emit(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        let key = self.key(channel)?;
        let payload = envelope::encode(args);

        // Depth check, push and expiry refresh run as one unit per producer.
        let writer = self.pool.writer().await;

        if self.take_depth_check(&key) {
            if let Ok(depth) = writer.llen(&key).await {
                if depth > self.queue.max_depth {
                    warn!(
                        channel = %key,
                        depth,
                        max_depth = self.queue.max_depth,
                        "Message queue is full, dropping push"
                    );
                    return Ok(());
                }
            }
        }

        self.count_emit(&key);
        if let Ok(depth) = writer.rpush(&key, &payload).await {
            debug!(channel = %key, depth, "RPUSH");
            let _ = writer.expire(&key, self.queue.ttl).await;
        }
        Ok(())
    }

    async fn remove_listener(&self, channel: &str, id: ListenerId) -> Result<()> {
        let key = self.key(channel)?;
        // The queue itself is left in place: other consumers may share it.
        self.registry.remove(&key, id).await;
        Ok(())
    }

    async fn remove_all_listeners(&self, channel: &str) -> Result<()> {
        let key = self.key(channel)?;
        if self.registry.remove_all(&key).await {
            let writer = self.pool.writer().await;
            if let Ok(true) = writer.del(&key).await {
                debug!(channel = %key, "Queue deleted");
            }
        }
        Ok(())
    }

    async fn listener_count(&self, channel: &str) -> usize {
        match self.key(channel) {
            Ok(key) => self.registry.count(&key).await,
            Err(_) => 0,
        }
    }
}
