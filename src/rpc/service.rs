//! Exposed services.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use super::{Result, RpcError};
use crate::interfaces::transport::Transport;
use crate::transport::PushPullTransport;

/// Handler for one method: receives the caller's context, the call arguments
/// and the reply handle.
pub type Handler = Arc<dyn Fn(Value, Vec<Value>, Reply) -> BoxFuture<'static, ()> + Send + Sync>;

/// Method table of a service.
///
/// ```ignore
/// let service = Service::new()
///     .method("repeat", |_ctx, args, reply| async move {
///         let _ = reply.send(args[0].clone(), false).await;
///     });
/// ```
#[derive(Clone, Default)]
pub struct Service {
    methods: HashMap<String, Handler>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method. A later method with the same name replaces the earlier.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, Vec<Value>, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |ctx: Value, args: Vec<Value>, reply: Reply| -> BoxFuture<'static, ()> {
                Box::pin(handler(ctx, args, reply))
            },
        );
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.methods.get(method)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.method_names().find(|name| name.trim().is_empty()) {
            Some(name) => Err(RpcError::InvalidMethod(name.to_string())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.method_names().collect();
        names.sort_unstable();
        f.debug_struct("Service").field("methods", &names).finish()
    }
}

/// Sends replies for one request back to its caller.
///
/// Cloneable, so a handler may hand it to spawned work and stream replies.
#[derive(Clone)]
pub struct Reply {
    transport: Arc<PushPullTransport>,
    channel: Arc<str>,
    id: u64,
}

impl Reply {
    pub(crate) fn new(transport: Arc<PushPullTransport>, channel: Arc<str>, id: u64) -> Self {
        Self {
            transport,
            channel,
            id,
        }
    }

    /// Correlation id of the request being answered.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send `data` to the caller. With `keep_open` the caller expects more
    /// replies; without it this is the final one.
    pub async fn send(&self, data: Value, keep_open: bool) -> Result<()> {
        let reply = json!({
            "close": !keep_open,
            "data": data,
            "id": self.id,
        });
        self.transport.emit(&self.channel, vec![reply]).await?;
        debug!(correlation_id = self.id, keep_open, "Reply sent");
        Ok(())
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}
