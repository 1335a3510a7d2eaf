//! Broadcast transport.
//!
//! Every subscriber of a channel receives every message published while it is
//! subscribed. Nothing is stored for absent subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use super::dispatch::process_message;
use super::{namespaced, ChannelRegistry, Opened};
use crate::broker::{BrokerConnection, ConnectionPool};
use crate::envelope;
use crate::interfaces::broker::BrokerError;
use crate::interfaces::transport::{Listener, ListenerId, Result, Transport, TransportKind};

/// Delay before subscribing again after a subscription failed or ended.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Publish/subscribe transport over a broker.
pub struct PubSubTransport {
    pool: Arc<ConnectionPool>,
    registry: ChannelRegistry,
}

impl PubSubTransport {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        info!(endpoint = %pool.endpoint(), "Pub/sub transport initialized");
        Self {
            pool,
            registry: ChannelRegistry::new(),
        }
    }

    fn key(&self, channel: &str) -> Result<String> {
        namespaced(TransportKind::PubSub, channel)
    }
}

/// Subscribe and forward broadcast payloads to the channel's listeners until
/// the connection closes. A failed or ended subscription is retried after
/// `RESUBSCRIBE_DELAY`.
async fn consume(
    connection: Arc<BrokerConnection>,
    registry: ChannelRegistry,
    key: String,
    ready: watch::Sender<bool>,
) {
    'subscription: while !connection.is_closing() {
        let subscribed = connection.subscribe(&key).await;
        ready.send_replace(true);

        match subscribed {
            Ok(mut stream) => {
                debug!(channel = %key, connection.id = %connection.id(), "Subscribed");
                loop {
                    let payload = tokio::select! {
                        _ = connection.closing() => break 'subscription,
                        next = stream.next() => match next {
                            Some(payload) => payload,
                            None => break,
                        },
                    };
                    process_message(&registry, &key, &payload).await;
                }
                connection.connection_lost(format!("subscription to {key} ended"));
            }
            Err(BrokerError::Closed(_)) => break,
            // Already reported to the error sink.
            Err(_) => {}
        }

        tokio::select! {
            _ = connection.closing() => break,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
    debug!(channel = %key, connection.id = %connection.id(), "Subscriber stopped");
}

#[async_trait]
impl Transport for PubSubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    async fn on(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        let key = self.key(channel)?;
        let (id, mut ready) = self
            .registry
            .add(&key, listener, || {
                let connection = self.pool.open();
                let (ready_tx, ready) = watch::channel(false);
                let consumer = tokio::spawn(consume(
                    Arc::clone(&connection),
                    self.registry.clone(),
                    key.clone(),
                    ready_tx,
                ));
                Opened {
                    connection,
                    consumer,
                    ready,
                }
            })
            .await;

        // Outside the registry lock: other channels keep dispatching while
        // this one subscribes.
        let _ = ready.wait_for(|subscribed| *subscribed).await;
        Ok(id)
    }

    async fn emit(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        let key = self.key(channel)?;
        let payload = envelope::encode(args);
        let writer = self.pool.writer().await;
        // Failures go to the error sink.
        let _ = writer.publish(&key, &payload).await;
        Ok(())
    }

    async fn remove_listener(&self, channel: &str, id: ListenerId) -> Result<()> {
        let key = self.key(channel)?;
        self.registry.remove(&key, id).await;
        Ok(())
    }

    async fn remove_all_listeners(&self, channel: &str) -> Result<()> {
        let key = self.key(channel)?;
        if self.registry.remove_all(&key).await {
            debug!(channel = %key, "Unsubscribed");
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
