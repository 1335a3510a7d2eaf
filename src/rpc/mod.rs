//! Correlated request/reply over channels.
//!
//! An [`Engine`] owns one base transport (pub/sub or push/pull, chosen at
//! construction) for events and requests, plus a private push/pull transport
//! for replies. Replies always travel over push/pull so they wait in the
//! queue until the caller pops them.
//!
//! ```text
//! caller                      broker                        exposer
//!   |-- emit rpc_<service> --> [base channel] --------------> handler
//!   |                                                            |
//!   |<-- pop <---------------- [rpc_response_channel] <-- reply.send
//! ```

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::broker::{
    resolve_driver, ConnectionPool, Endpoint, ErrorSink, TransportFailure,
};
use crate::config::EngineOptions;
use crate::interfaces::broker::Driver;
use crate::interfaces::transport::{Listener, ListenerId, Transport, TransportError, TransportKind};
use crate::transport::{namespaced, PubSubTransport, PushPullTransport};

pub mod message;
pub mod service;
pub mod stub;

pub use message::{RpcReply, RpcRequest};
pub use service::{Handler, Reply, Service};
pub use stub::{next_id, ResponseHandler, Stub};

use stub::PendingTable;

/// Channel on which `expose` announces new services.
pub const NEW_SERVICE_CHANNEL: &str = "_new_rpc_service";

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors returned synchronously by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid service name: {0:?}")]
    InvalidService(String),

    #[error("Invalid method name: {0:?}")]
    InvalidMethod(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn request_channel(service: &str) -> Result<String> {
    if service.trim().is_empty() {
        return Err(RpcError::InvalidService(service.to_string()));
    }
    Ok(format!("rpc_{service}"))
}

/// Messaging engine: channel operations plus RPC.
pub struct Engine {
    options: EngineOptions,
    pool: Arc<ConnectionPool>,
    base: Arc<dyn Transport>,
    replies: Arc<PushPullTransport>,
    reply_channel: Arc<str>,
    pending: Arc<PendingTable>,
}

impl Engine {
    /// Build an engine for the configured endpoint.
    ///
    /// Fails immediately on a malformed endpoint or an unsupported scheme. No
    /// connection is made until the first channel operation.
    pub fn new(options: EngineOptions) -> Result<Self> {
        let endpoint = Endpoint::parse(&options.transport).map_err(TransportError::from)?;
        let driver = resolve_driver(&endpoint).map_err(TransportError::from)?;
        Self::build(options, endpoint, driver)
    }

    /// Build an engine with an explicit driver instead of resolving one from
    /// the endpoint scheme.
    pub fn with_driver(options: EngineOptions, driver: Arc<dyn Driver>) -> Result<Self> {
        let endpoint = Endpoint::parse(&options.transport).map_err(TransportError::from)?;
        Self::build(options, endpoint, driver)
    }

    fn build(options: EngineOptions, endpoint: Endpoint, driver: Arc<dyn Driver>) -> Result<Self> {
        namespaced(TransportKind::PushPull, &options.rpc.reply_channel)?;

        let pool = Arc::new(ConnectionPool::new(driver, endpoint, ErrorSink::new()));
        let replies = Arc::new(PushPullTransport::with_queue_config(
            Arc::clone(&pool),
            options.queue.clone(),
        ));
        let base: Arc<dyn Transport> = match options.kind {
            TransportKind::PubSub => Arc::new(PubSubTransport::new(Arc::clone(&pool))),
            TransportKind::PushPull => Arc::new(PushPullTransport::with_queue_config(
                Arc::clone(&pool),
                options.queue.clone(),
            )),
        };

        info!(
            kind = %options.kind,
            endpoint = %pool.endpoint(),
            reply_channel = %options.rpc.reply_channel,
            "Engine initialized"
        );

        Ok(Self {
            reply_channel: Arc::from(options.rpc.reply_channel.as_str()),
            options,
            pool,
            base,
            replies,
            pending: Arc::new(PendingTable::default()),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.base.kind()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The base transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.base
    }

    /// Asynchronous transport failures reported from now on.
    pub fn errors(&self) -> broadcast::Receiver<Arc<TransportFailure>> {
        self.pool.errors().subscribe()
    }

    pub async fn on(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        Ok(self.base.on(channel, listener).await?)
    }

    pub async fn add_listener(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        Ok(self.base.add_listener(channel, listener).await?)
    }

    pub async fn emit(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        Ok(self.base.emit(channel, args).await?)
    }

    pub async fn remove_listener(&self, channel: &str, id: ListenerId) -> Result<()> {
        Ok(self.base.remove_listener(channel, id).await?)
    }

    pub async fn remove_all_listeners(&self, channel: &str) -> Result<()> {
        Ok(self.base.remove_all_listeners(channel).await?)
    }

    pub async fn listener_count(&self, channel: &str) -> usize {
        self.base.listener_count(channel).await
    }

    /// Serve `handlers` as `service`.
    ///
    /// Requests for methods the service does not have are logged and ignored;
    /// their callers time out. Returns the listener id on `rpc_<service>`,
    /// which [`Engine::remove_listener`] accepts to stop serving.
    pub async fn expose(&self, service: &str, handlers: Service) -> Result<ListenerId> {
        let channel = request_channel(service)?;
        handlers.validate()?;

        let listener: Listener = {
            let handlers = Arc::new(handlers);
            let replies = Arc::clone(&self.replies);
            let reply_channel = Arc::clone(&self.reply_channel);
            let service = service.to_string();
            Arc::new(move |args: Vec<Value>| {
                let Some(request) = RpcRequest::from_args(&args) else {
                    return;
                };
                let Some(handler) = handlers.get(&request.method) else {
                    warn!(
                        service = %service,
                        method = %request.method,
                        correlation_id = request.id,
                        "Ignoring request for unknown method"
                    );
                    return;
                };
                let reply = Reply::new(Arc::clone(&replies), Arc::clone(&reply_channel), request.id);
                tokio::spawn(handler(request.ctx, request.args, reply));
            })
        };

        let id = self.base.on(&channel, listener).await?;
        self.base
            .emit(NEW_SERVICE_CHANNEL, vec![json!(service)])
            .await?;
        info!(service = %service, kind = %self.kind(), "Service exposed");
        Ok(id)
    }

    /// Stub for calling `method` on `service` with `ctx` as the call context.
    pub fn call(&self, service: &str, method: &str, ctx: Value) -> Result<Stub> {
        request_channel(service)?;
        if method.trim().is_empty() {
            return Err(RpcError::InvalidMethod(method.to_string()));
        }
        Ok(Stub::new(
            service,
            method,
            ctx,
            Arc::clone(&self.base),
            Arc::clone(&self.replies),
            Arc::clone(&self.reply_channel),
            self.options.rpc.reply_timeout,
            Arc::clone(&self.pending),
        ))
    }

    /// Round trip to the broker over the shared outbound connection.
    ///
    /// Channel operations never report broker failures directly; binaries use
    /// this to wait for the broker at startup.
    pub async fn ping(&self) -> Result<()> {
        let key = namespaced(TransportKind::PushPull, &self.reply_channel)?;
        let writer = self.pool.writer().await;
        writer.exists(&key).await.map_err(TransportError::from)?;
        Ok(())
    }

    /// Calls of this engine still listening for replies.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Listeners currently registered on the reply channel.
    pub async fn reply_listener_count(&self) -> usize {
        self.replies.listener_count(&self.reply_channel).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("kind", &self.kind())
            .field("endpoint", &self.pool.endpoint().to_string())
            .field("reply_channel", &self.reply_channel)
            .finish()
    }
}
