//! In-memory broker for standalone mode and tests.
//!
//! Implements the same key/channel primitives as Redis inside one process:
//! broadcast channels without durability, lists with exactly-once blocking
//! pops, and key expiry measured on the tokio clock (so paused-clock tests
//! can fast-forward it).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::Endpoint;
use crate::interfaces::broker::{BrokerError, Connection, Driver, PayloadStream, Result};

/// Buffered messages per subscribed channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct List {
    items: VecDeque<String>,
    expires_at: Option<Instant>,
}

impl List {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct State {
    lists: HashMap<String, List>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl State {
    /// Live list at `key`, dropping it first if it has expired.
    fn list(&mut self, key: &str) -> Option<&mut List> {
        let now = Instant::now();
        if self.lists.get(key).is_some_and(|l| l.is_expired(now)) {
            debug!(key = %key, "Key expired");
            self.lists.remove(key);
        }
        self.lists.get_mut(key)
    }

    fn pop(&mut self, key: &str) -> Option<String> {
        let list = self.list(key)?;
        let item = list.items.pop_front();
        if list.items.is_empty() {
            self.lists.remove(key);
        }
        item
    }
}

struct Shared {
    state: Mutex<State>,
    pushed: Notify,
    password: Option<String>,
    connections: AtomicUsize,
}

/// In-process broker.
///
/// Cloning shares the same broker. Connections opened through the [`Driver`]
/// impl all see the same lists and channels.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A broker that rejects connections not presenting `password`.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self::build(Some(password.into()))
    }

    fn build(password: Option<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                pushed: Notify::new(),
                password,
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Process-global broker registered under `name` (`memory://<name>`).
    pub fn named(name: &str) -> Self {
        static REGISTRY: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.entry(name.to_string()).or_default().clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of connections established so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Current length of the list at `key`.
    pub fn list_len(&self, key: &str) -> usize {
        self.state().list(key).map_or(0, |l| l.items.len())
    }

    /// Whether `key` holds a live list.
    pub fn key_exists(&self, key: &str) -> bool {
        self.state().list(key).is_some()
    }

    /// Append directly to a list, bypassing any connection.
    pub fn push_raw(&self, key: &str, payload: impl Into<String>) {
        self.state()
            .lists
            .entry(key.to_string())
            .or_default()
            .items
            .push_back(payload.into());
        self.shared.pushed.notify_waiters();
    }

    /// Publish directly to a channel, bypassing any connection.
    pub fn publish_raw(&self, channel: &str, payload: impl Into<String>) -> usize {
        match self.state().channels.get(channel) {
            Some(sender) => sender.send(payload.into()).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state()
            .channels
            .get(channel)
            .map_or(0, |s| s.receiver_count())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryBroker {
    fn scheme(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        if let Some(password) = &self.shared.password {
            if endpoint.auth() != Some(password.as_str()) {
                return Err(BrokerError::Connection(format!(
                    "authentication failed for {}",
                    endpoint
                )));
            }
        }
        self.shared.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let receivers = self.broker.publish_raw(channel, payload);
        debug!(channel = %channel, receivers, "Published to memory channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let receiver = {
            let mut state = self.broker.state();
            let sender = state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
            sender.subscribe()
        };
        let stream = BroadcastStream::new(receiver)
            .filter_map(|msg| futures::future::ready(msg.ok()))
            .boxed();
        Ok(stream)
    }

    async fn rpush(&self, key: &str, payload: &str) -> Result<usize> {
        let len = {
            let mut state = self.broker.state();
            // Drop an expired list so the push starts a fresh key without a TTL.
            state.list(key);
            let list = state.lists.entry(key.to_string()).or_default();
            list.items.push_back(payload.to_string());
            list.items.len()
        };
        self.broker.shared.pushed.notify_waiters();
        Ok(len)
    }

    async fn blpop(&self, key: &str) -> Result<Option<String>> {
        loop {
            let pushed = self.broker.shared.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(item) = self.broker.state().pop(key) {
                return Ok(Some(item));
            }
            pushed.await;
        }
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.broker.list_len(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.broker.state();
        match state.list(key) {
            Some(list) => {
                list.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.broker.state();
        let existed = state.list(key).is_some();
        state.lists.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.broker.key_exists(key))
    }
}
