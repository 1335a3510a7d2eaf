//! Broker driver interface.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::broker::Endpoint;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Command {command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    #[error("Connection #{0} is closed")]
    Closed(u64),

    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Raw message payloads delivered by a subscription.
pub type PayloadStream = BoxStream<'static, String>;

/// Opens connections for one endpoint scheme.
///
/// Implementations:
/// - `RedisDriver`: Redis (`redis://`)
/// - `MemoryBroker`: in-process broker (`memory://`)
#[async_trait]
pub trait Driver: Send + Sync {
    /// Scheme this driver is selected by.
    fn scheme(&self) -> &'static str;

    /// Establish a connection, authenticating with the endpoint's credential
    /// before returning.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>>;
}

/// One established broker connection.
///
/// Commands mirror the key/list/channel primitives the transports need and
/// nothing more.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Broadcast a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel`. The subscription is active once this returns.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream>;

    /// Append a payload to the list at `key`. Returns the new length.
    async fn rpush(&self, key: &str, payload: &str) -> Result<usize>;

    /// Block until an element can be popped from the head of `key`.
    ///
    /// Each element is handed to exactly one popping connection.
    async fn blpop(&self, key: &str) -> Result<Option<String>>;

    /// Length of the list at `key` (0 if absent).
    async fn llen(&self, key: &str) -> Result<usize>;

    /// Set a time-to-live on `key`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key`. Returns true if it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;
}
