//! Channel transport interface.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::interfaces::broker::BrokerError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors returned synchronously by transport operations.
///
/// Broker failures during delivery are not returned here; they go to the
/// engine's error sink.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Callback invoked with the argument sequence of each delivered message.
pub type Listener = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery semantic of a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TransportKind {
    /// Broadcast: every subscriber receives every message.
    #[default]
    #[serde(rename = "pub/sub")]
    PubSub,
    /// Queue: every message is popped by exactly one consumer.
    #[serde(rename = "push/pull")]
    PushPull,
}

impl TransportKind {
    /// Channel namespace prefix on the broker.
    pub fn prefix(&self) -> &'static str {
        match self {
            TransportKind::PubSub => "stackio_pubsub_",
            TransportKind::PushPull => "stackio_pushpull_",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::PubSub => write!(f, "pub/sub"),
            TransportKind::PushPull => write!(f, "push/pull"),
        }
    }
}

/// Named channels with an event-emitter surface.
///
/// Implementations:
/// - `PubSubTransport`: broadcast delivery
/// - `PushPullTransport`: queue delivery with backpressure and expiry
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivery semantic of this transport.
    fn kind(&self) -> TransportKind;

    /// Register a listener on `channel`.
    ///
    /// The first listener on a channel opens its dedicated inbound connection.
    /// Listeners are invoked most-recently-registered first.
    async fn on(&self, channel: &str, listener: Listener) -> Result<ListenerId>;

    /// Alias for [`Transport::on`].
    async fn add_listener(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        self.on(channel, listener).await
    }

    /// Encode `args` into an envelope and send it on `channel`.
    ///
    /// `Ok` means accepted for delivery, not delivered.
    async fn emit(&self, channel: &str, args: Vec<Value>) -> Result<()>;

    /// Remove one listener. Removing the last one tears the channel down.
    /// Unknown listeners are ignored.
    async fn remove_listener(&self, channel: &str, id: ListenerId) -> Result<()>;

    /// Remove every listener on `channel` and tear it down.
    async fn remove_all_listeners(&self, channel: &str) -> Result<()>;

    /// Number of listeners currently registered on `channel`.
    async fn listener_count(&self, channel: &str) -> usize;
}
