//! Broker connection management.
//!
//! This module contains:
//! - `BrokerConnection`: one tracked connection with a sequential id
//! - `ConnectionPool`: per-engine pool owning the shared outbound connection
//! - `ErrorSink`: asynchronous delivery of transport failures
//! - Drivers: Redis (`redis://`), in-memory (`memory://`)

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::interfaces::broker::{BrokerError, Connection, Driver, PayloadStream, Result};

pub mod endpoint;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use endpoint::{Endpoint, DEFAULT_ENDPOINT};
pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisDriver;

/// Capacity of the error broadcast channel.
const ERROR_CHANNEL_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique, monotonically increasing connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// A transport failure reported outside the call that caused it.
#[derive(Debug)]
pub struct TransportFailure {
    pub connection: ConnectionId,
    pub error: BrokerError,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {}: {}", self.connection, self.error)
    }
}

/// Fire-and-forget sink for asynchronous transport failures.
///
/// Failures are always logged; subscribers additionally receive them. With no
/// subscribers the failure is only logged.
#[derive(Clone)]
pub struct ErrorSink {
    sender: broadcast::Sender<Arc<TransportFailure>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Report a failure. Never blocks, never fails.
    pub fn report(&self, connection: ConnectionId, error: BrokerError) {
        error!(connection.id = %connection, error = %error, "Transport error");
        let _ = self.sender.send(Arc::new(TransportFailure { connection, error }));
    }

    /// Receive failures reported from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TransportFailure>> {
        self.sender.subscribe()
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

/// One tracked broker connection.
///
/// Construction only assigns an id; the driver connects (and authenticates)
/// on the first command. Failures are reported to the error sink and also
/// returned so callers can skip follow-up work, but callers never propagate
/// them to users. A connection-level failure discards the driver connection,
/// so the next command connects afresh.
pub struct BrokerConnection {
    id: ConnectionId,
    endpoint: Endpoint,
    driver: Arc<dyn Driver>,
    current: StdMutex<Option<Arc<dyn Connection>>>,
    connecting: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    errors: ErrorSink,
}

impl BrokerConnection {
    fn new(driver: Arc<dyn Driver>, endpoint: Endpoint, errors: ErrorSink) -> Self {
        let id = ConnectionId::next();
        let (state, _) = watch::channel(ConnectionState::Open);
        debug!(connection.id = %id, endpoint = %endpoint, "Created client");
        Self {
            id,
            endpoint,
            driver,
            current: StdMutex::new(None),
            connecting: Mutex::new(()),
            state,
            errors,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// True once `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    /// Resolves once the connection starts closing.
    pub async fn closing(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s != ConnectionState::Open).await;
    }

    /// Begin closing. Pending and future commands fail with `Closed`.
    pub fn close(&self) {
        if self.state.send_replace(ConnectionState::Closing) == ConnectionState::Open {
            debug!(connection.id = %self.id, "Client disconnected");
        }
        self.state.send_replace(ConnectionState::Closed);
        self.slot().take();
    }

    /// Report a failure noticed outside a command, such as a subscription
    /// ending, and drop the driver connection.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        if self.is_closing() {
            return;
        }
        self.slot().take();
        self.errors
            .report(self.id, BrokerError::Connection(reason.into()));
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Connection>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        if self.is_closing() {
            return Err(BrokerError::Closed(self.id.0));
        }
        let cached = self.slot().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        // One connect attempt at a time; later callers reuse its result.
        let _connecting = self.connecting.lock().await;
        let cached = self.slot().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn: Arc<dyn Connection> = Arc::from(self.driver.connect(&self.endpoint).await?);
        *self.slot() = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Forward failures to the sink. Errors caused by our own close are
    /// expected. A connection failure on `conn` discards it.
    fn observe<T>(&self, conn: Option<&Arc<dyn Connection>>, result: Result<T>) -> Result<T> {
        match result {
            Err(BrokerError::Closed(id)) => Err(BrokerError::Closed(id)),
            Err(e) if self.is_closing() => {
                debug!(connection.id = %self.id, error = %e, "Error after close ignored");
                Err(BrokerError::Closed(self.id.0))
            }
            Err(e) => {
                if let (BrokerError::Connection(_), Some(failed)) = (&e, conn) {
                    let mut slot = self.slot();
                    if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
                        debug!(connection.id = %self.id, "Discarding broken connection");
                        *slot = None;
                    }
                }
                let message = e.to_string();
                self.errors.report(self.id, e);
                Err(BrokerError::Connection(message))
            }
            ok => ok,
        }
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.publish(channel, payload).await;
        self.observe(Some(&conn), result)
    }

    pub async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.subscribe(channel).await;
        self.observe(Some(&conn), result)
    }

    pub async fn rpush(&self, key: &str, payload: &str) -> Result<usize> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.rpush(key, payload).await;
        self.observe(Some(&conn), result)
    }

    /// Blocking pop that gives up as soon as the connection starts closing.
    pub async fn blpop(&self, key: &str) -> Result<Option<String>> {
        let conn = self.observe(None, self.connection().await)?;
        let result = tokio::select! {
            _ = self.closing() => Err(BrokerError::Closed(self.id.0)),
            popped = conn.blpop(key) => popped,
        };
        self.observe(Some(&conn), result)
    }

    pub async fn llen(&self, key: &str) -> Result<usize> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.llen(key).await;
        self.observe(Some(&conn), result)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.expire(key, ttl).await;
        self.observe(Some(&conn), result)
    }

    pub async fn del(&self, key: &str) -> Result<bool> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.del(key).await;
        self.observe(Some(&conn), result)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.observe(None, self.connection().await)?;
        let result = conn.exists(key).await;
        self.observe(Some(&conn), result)
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("state", &self.state())
            .finish()
    }
}

/// Connections of one engine.
///
/// Owns the single shared outbound connection used for every publish and
/// push, and opens dedicated inbound connections for channels. Writes to the
/// outbound connection go through [`ConnectionPool::writer`] one at a time.
pub struct ConnectionPool {
    driver: Arc<dyn Driver>,
    endpoint: Endpoint,
    errors: ErrorSink,
    outbound: OnceLock<Arc<BrokerConnection>>,
    write_lock: Mutex<()>,
}

impl ConnectionPool {
    pub fn new(driver: Arc<dyn Driver>, endpoint: Endpoint, errors: ErrorSink) -> Self {
        Self {
            driver,
            endpoint,
            errors,
            outbound: OnceLock::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Build a pool for an endpoint string, selecting the driver by scheme.
    pub fn from_endpoint(endpoint: &str, errors: ErrorSink) -> Result<Self> {
        let endpoint = Endpoint::parse(endpoint)?;
        let driver = resolve_driver(&endpoint)?;
        Ok(Self::new(driver, endpoint, errors))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    /// Open a new dedicated connection.
    pub fn open(&self) -> Arc<BrokerConnection> {
        Arc::new(BrokerConnection::new(
            Arc::clone(&self.driver),
            self.endpoint.clone(),
            self.errors.clone(),
        ))
    }

    /// The shared outbound connection, opened on first use.
    pub fn outbound(&self) -> &Arc<BrokerConnection> {
        self.outbound.get_or_init(|| self.open())
    }

    /// Exclusive access to the outbound connection for a sequence of writes.
    pub async fn writer(&self) -> OutboundWriter<'_> {
        let guard = self.write_lock.lock().await;
        OutboundWriter {
            _guard: guard,
            conn: self.outbound(),
        }
    }
}

/// Held while writing to the shared outbound connection.
pub struct OutboundWriter<'a> {
    _guard: MutexGuard<'a, ()>,
    conn: &'a Arc<BrokerConnection>,
}

impl std::ops::Deref for OutboundWriter<'_> {
    type Target = BrokerConnection;

    fn deref(&self) -> &BrokerConnection {
        self.conn
    }
}

/// Select the driver for an endpoint's scheme.
///
/// Unknown schemes are a configuration error and fail immediately.
pub fn resolve_driver(endpoint: &Endpoint) -> Result<Arc<dyn Driver>> {
    match endpoint.scheme() {
        #[cfg(feature = "redis")]
        "redis" => Ok(Arc::new(RedisDriver::new())),
        #[cfg(not(feature = "redis"))]
        "redis" => Err(BrokerError::UnsupportedScheme(
            "redis (rebuild with --features redis)".to_string(),
        )),
        "memory" => Ok(Arc::new(MemoryBroker::named(endpoint.host()))),
        other => Err(BrokerError::UnsupportedScheme(other.to_string())),
    }
}
