//! Test utilities and fault-injecting drivers.
//!
//! `FlakyDriver` wraps an in-memory broker and can break every connection it
//! has handed out, or stall subscriptions to one channel, so tests can
//! exercise reconnection and isolation without a real broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::broker::{Endpoint, MemoryBroker};
use crate::interfaces::broker::{BrokerError, Connection, Driver, PayloadStream, Result};

struct Faults {
    broker: MemoryBroker,
    connects: AtomicUsize,
    /// Bumped to break every connection opened before the bump.
    generation: watch::Sender<u64>,
    slow_subscribe: Option<(String, Duration)>,
}

/// Memory broker driver with injectable connection failures.
#[derive(Clone)]
pub struct FlakyDriver {
    faults: Arc<Faults>,
}

impl FlakyDriver {
    pub fn new(broker: MemoryBroker) -> Self {
        Self::build(broker, None)
    }

    /// Delay every SUBSCRIBE to `channel` by `delay`.
    pub fn with_slow_subscribe(broker: MemoryBroker, channel: &str, delay: Duration) -> Self {
        Self::build(broker, Some((channel.to_string(), delay)))
    }

    fn build(broker: MemoryBroker, slow_subscribe: Option<(String, Duration)>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            faults: Arc::new(Faults {
                broker,
                connects: AtomicUsize::new(0),
                generation,
                slow_subscribe,
            }),
        }
    }

    /// Connections established so far.
    pub fn connects(&self) -> usize {
        self.faults.connects.load(Ordering::SeqCst)
    }

    /// Break every open connection: commands fail, blocked pops and
    /// subscriptions end.
    pub fn drop_connections(&self) {
        self.faults.generation.send_modify(|g| *g += 1);
    }
}

#[async_trait]
impl Driver for FlakyDriver {
    fn scheme(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        let generation = *self.faults.generation.borrow();
        let inner = self.faults.broker.connect(endpoint).await?;
        self.faults.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyConnection {
            inner,
            faults: Arc::clone(&self.faults),
            generation,
        }))
    }
}

struct FlakyConnection {
    inner: Box<dyn Connection>,
    faults: Arc<Faults>,
    generation: u64,
}

impl FlakyConnection {
    fn check(&self) -> Result<()> {
        if *self.faults.generation.borrow() != self.generation {
            return Err(BrokerError::Connection("connection reset".to_string()));
        }
        Ok(())
    }

    /// Resolves once this connection has been broken.
    fn broken(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut generation = self.faults.generation.subscribe();
        let mine = self.generation;
        async move {
            let _ = generation.wait_for(|g| *g != mine).await;
        }
    }
}

#[async_trait]
impl Connection for FlakyConnection {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check()?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        self.check()?;
        if let Some((slow, delay)) = &self.faults.slow_subscribe {
            if slow == channel {
                tokio::time::sleep(*delay).await;
            }
        }
        let stream = self.inner.subscribe(channel).await?;
        Ok(stream.take_until(self.broken()).boxed())
    }

    async fn rpush(&self, key: &str, payload: &str) -> Result<usize> {
        self.check()?;
        self.inner.rpush(key, payload).await
    }

    async fn blpop(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.broken() => Err(BrokerError::Connection("connection reset".to_string())),
            popped = self.inner.blpop(key) => popped,
        }
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.check()?;
        self.inner.llen(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.exists(key).await
    }
}
