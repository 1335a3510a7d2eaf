//! Channel transports.
//!
//! This module contains:
//! - `PubSubTransport`: broadcast delivery
//! - `PushPullTransport`: queue delivery with backpressure and expiry
//! - The channel registry both share: per-channel listener lists and the
//!   dedicated inbound connection that exists exactly while a channel has
//!   listeners

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::broker::BrokerConnection;
use crate::interfaces::transport::{Listener, ListenerId, Result, TransportError, TransportKind};

pub mod dispatch;
pub mod pubsub;
pub mod pushpull;

pub use pubsub::PubSubTransport;
pub use pushpull::{PushPullTransport, QueueConfig};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Broker key for a logical channel name.
///
/// Rejects empty names: addressing a channel that cannot exist is a
/// programmer error.
pub fn namespaced(kind: TransportKind, channel: &str) -> Result<String> {
    if channel.trim().is_empty() {
        return Err(TransportError::InvalidChannel(channel.to_string()));
    }
    Ok(format!("{}{}", kind.prefix(), channel))
}

/// Inbound side of a channel, created with its first listener.
pub(crate) struct Opened {
    pub(crate) connection: Arc<BrokerConnection>,
    pub(crate) consumer: JoinHandle<()>,
    /// Becomes true once the consumer has made its first attempt to receive.
    pub(crate) ready: watch::Receiver<bool>,
}

/// One subscribed channel.
pub(crate) struct Channel {
    /// In registration order.
    listeners: Vec<(ListenerId, Listener)>,
    connection: Arc<BrokerConnection>,
    consumer: JoinHandle<()>,
    ready: watch::Receiver<bool>,
}

impl Channel {
    fn close(self) {
        self.connection.close();
        // The consumer exits on its own once it observes the close; it may be
        // mid-dispatch and must not be cut off there.
        drop(self.consumer);
    }
}

/// Listener lists keyed by namespaced channel name.
#[derive(Clone, Default)]
pub(crate) struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a listener to an existing channel, or create the channel with
    /// `open`. `open` must not wait on the broker: it runs under the registry
    /// lock and only starts the consumer.
    ///
    /// Returns the listener id and the channel's readiness flag.
    pub(crate) async fn add<F>(
        &self,
        key: &str,
        listener: Listener,
        open: F,
    ) -> (ListenerId, watch::Receiver<bool>)
    where
        F: FnOnce() -> Opened,
    {
        let id = next_listener_id();
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(key) {
            channel.listeners.push((id, listener));
            return (id, channel.ready.clone());
        }

        let opened = open();
        let ready = opened.ready.clone();
        channels.insert(
            key.to_string(),
            Channel {
                listeners: vec![(id, listener)],
                connection: opened.connection,
                consumer: opened.consumer,
                ready: opened.ready,
            },
        );
        (id, ready)
    }

    /// Remove one listener. Returns true if the channel was torn down.
    pub(crate) async fn remove(&self, key: &str, id: ListenerId) -> bool {
        let mut channels = self.channels.write().await;
        let Some(channel) = channels.get_mut(key) else {
            return false;
        };
        channel.listeners.retain(|(existing, _)| *existing != id);
        if !channel.listeners.is_empty() {
            return false;
        }
        if let Some(channel) = channels.remove(key) {
            debug!(channel = %key, "Last listener removed");
            channel.close();
        }
        true
    }

    /// Remove every listener. Returns true if the channel existed.
    pub(crate) async fn remove_all(&self, key: &str) -> bool {
        match self.channels.write().await.remove(key) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Listeners in dispatch order: most recently registered first.
    pub(crate) async fn dispatch_order(&self, key: &str) -> Vec<Listener> {
        let channels = self.channels.read().await;
        channels
            .get(key)
            .map(|channel| {
                channel
                    .listeners
                    .iter()
                    .rev()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) async fn count(&self, key: &str) -> usize {
        self.channels
            .read()
            .await
            .get(key)
            .map_or(0, |channel| channel.listeners.len())
    }

    /// Inbound connection of a channel, if it is subscribed.
    pub(crate) async fn connection(&self, key: &str) -> Option<Arc<BrokerConnection>> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|channel| Arc::clone(&channel.connection))
    }
}
