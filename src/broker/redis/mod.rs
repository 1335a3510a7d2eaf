//! Redis broker driver.
//!
//! Commands go through a multiplexed connection; subscriptions open their own
//! pub/sub connection on the same client. Credentials from the endpoint are
//! sent as `AUTH` during the connection handshake.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, FromRedisValue, RedisError};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};
use url::Url;

use super::Endpoint;
use crate::interfaces::broker::{BrokerError, Connection, Driver, PayloadStream, Result};

const DEFAULT_PORT: u16 = 6379;

/// Driver for `redis://` endpoints.
#[derive(Debug, Default, Clone)]
pub struct RedisDriver;

impl RedisDriver {
    pub fn new() -> Self {
        Self
    }

    /// Connection URL for the client, with the endpoint credential as password.
    fn client_url(endpoint: &Endpoint) -> Result<Url> {
        let raw = format!(
            "redis://{}:{}",
            endpoint.host(),
            endpoint.port_or(DEFAULT_PORT)
        );
        let mut url = Url::parse(&raw).map_err(|e| BrokerError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if let Some(auth) = endpoint.auth() {
            url.set_password(Some(auth))
                .map_err(|_| BrokerError::InvalidEndpoint {
                    endpoint: endpoint.to_string(),
                    reason: "credential cannot be encoded".to_string(),
                })?;
        }
        Ok(url)
    }
}

#[async_trait]
impl Driver for RedisDriver {
    fn scheme(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        let url = Self::client_url(endpoint)?;
        let client = Client::open(url.as_str()).map_err(connection_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;

        info!(endpoint = %endpoint, "Connected to Redis");

        Ok(Box::new(RedisConnection { client, conn }))
    }
}

struct RedisConnection {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisConnection {
    async fn query<T: FromRedisValue>(&self, command: &'static str, args: &[&str]) -> Result<T> {
        let mut conn = self.conn.clone();
        ::redis::cmd(command)
            .arg(args)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error(command, e))
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let receivers: usize = self.query("PUBLISH", &[channel, payload]).await?;
        debug!(channel = %channel, receivers, "PUBLISH");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(connection_error)?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| command_error("SUBSCRIBE", e))?;
        debug!(channel = %channel, "SUBSCRIBE");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| futures::future::ready(msg.get_payload::<String>().ok()))
            .boxed();
        Ok(stream)
    }

    async fn rpush(&self, key: &str, payload: &str) -> Result<usize> {
        self.query("RPUSH", &[key, payload]).await
    }

    async fn blpop(&self, key: &str) -> Result<Option<String>> {
        let popped: Option<(String, String)> = self.query("BLPOP", &[key, "0"]).await?;
        Ok(popped.map(|(_key, value)| value))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.query("LLEN", &[key]).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let secs = ttl.as_secs().max(1).to_string();
        self.query("EXPIRE", &[key, &secs]).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: usize = self.query("DEL", &[key]).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.query("EXISTS", &[key]).await
    }
}

fn connection_error(e: RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn command_error(command: &'static str, e: RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() {
        return BrokerError::Connection(e.to_string());
    }
    BrokerError::Command {
        command,
        message: e.to_string(),
    }
}
