//! Calling side of RPC.
//!
//! A [`Stub`] sends requests for one service method. Each call that expects
//! replies registers a listener on the engine's reply channel, filtered by the
//! request's correlation id, and a watcher task that removes the listener
//! after the final reply or once the call has been idle for the reply timeout.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::message::{RpcReply, RpcRequest};
use super::Result;
use crate::interfaces::transport::{Listener, ListenerId, Transport};
use crate::transport::PushPullTransport;

/// Correlation ids stay below 2^53 so they survive JSON number handling in
/// every language.
const MAX_CORRELATION_ID: u64 = 1 << 53;

/// Receives `(data, more)` for every reply to one call.
pub type ResponseHandler = Arc<dyn Fn(Value, bool) + Send + Sync>;

/// Random correlation id.
///
/// Ids are not coordinated between processes; two callers sharing a reply
/// channel can collide, with odds of roughly n²/2^54 for n calls in flight.
pub fn next_id() -> u64 {
    rand::rng().random_range(0..MAX_CORRELATION_ID)
}

/// Correlation ids of this engine's calls still awaiting replies.
#[derive(Default)]
pub(crate) struct PendingTable {
    active: Mutex<HashSet<u64>>,
}

impl PendingTable {
    /// Reserve an id not used by any active call of this engine.
    fn reserve(&self) -> u64 {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = next_id();
            if active.insert(id) {
                return id;
            }
        }
    }

    fn release(&self, id: u64) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// State shared between a pending call's reply listener and its watcher.
struct PendingRequest {
    id: u64,
    replied: AtomicBool,
    finished: AtomicBool,
    closed: Notify,
    activity: Notify,
}

impl PendingRequest {
    fn new(id: u64) -> Self {
        Self {
            id,
            replied: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            closed: Notify::new(),
            activity: Notify::new(),
        }
    }

    /// Handle one message from the reply channel.
    fn deliver(&self, args: &[Value], handler: &ResponseHandler) {
        let Some(reply) = RpcReply::from_args(args) else {
            return;
        };
        if reply.id != self.id || self.finished.load(Ordering::Acquire) {
            return;
        }

        self.replied.store(true, Ordering::Release);
        if reply.close {
            // Later replies may still be dispatched before the listener is gone.
            self.finished.store(true, Ordering::Release);
        }
        handler(reply.data, !reply.close);

        if reply.close {
            self.closed.notify_one();
        } else {
            self.activity.notify_one();
        }
    }
}

/// Register a reply listener for `id` and start its watcher.
async fn register(
    replies: &Arc<PushPullTransport>,
    channel: &Arc<str>,
    pending_table: &Arc<PendingTable>,
    id: u64,
    idle_timeout: Duration,
    handler: ResponseHandler,
) -> Result<()> {
    let pending = Arc::new(PendingRequest::new(id));

    let listener: Listener = {
        let pending = Arc::clone(&pending);
        Arc::new(move |args: Vec<Value>| pending.deliver(&args, &handler))
    };
    let listener_id = replies.on(channel, listener).await?;

    tokio::spawn(watch(
        pending,
        Arc::downgrade(replies),
        Arc::clone(channel),
        listener_id,
        Arc::clone(pending_table),
        idle_timeout,
    ));
    Ok(())
}

/// Remove the reply listener after the final reply, or after `idle_timeout`
/// without any reply.
async fn watch(
    pending: Arc<PendingRequest>,
    replies: Weak<PushPullTransport>,
    channel: Arc<str>,
    listener: ListenerId,
    pending_table: Arc<PendingTable>,
    idle_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = pending.closed.notified() => break,
            _ = pending.activity.notified() => continue,
            _ = tokio::time::sleep(idle_timeout) => {
                pending.finished.store(true, Ordering::Release);
                debug!(
                    correlation_id = pending.id,
                    replied = pending.replied.load(Ordering::Acquire),
                    "Cleaning response channel"
                );
                break;
            }
        }
    }

    if let Some(replies) = replies.upgrade() {
        let _ = replies.remove_listener(&channel, listener).await;
    }
    pending_table.release(pending.id);
}

/// Callable handle for one remote method.
///
/// Cheap to clone; every call gets a fresh correlation id.
#[derive(Clone)]
pub struct Stub {
    service: Arc<str>,
    method: Arc<str>,
    ctx: Value,
    base: Arc<dyn Transport>,
    replies: Arc<PushPullTransport>,
    reply_channel: Arc<str>,
    reply_timeout: Duration,
    pending: Arc<PendingTable>,
}

impl Stub {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        service: &str,
        method: &str,
        ctx: Value,
        base: Arc<dyn Transport>,
        replies: Arc<PushPullTransport>,
        reply_channel: Arc<str>,
        reply_timeout: Duration,
        pending: Arc<PendingTable>,
    ) -> Self {
        Self {
            service: Arc::from(service),
            method: Arc::from(method),
            ctx,
            base,
            replies,
            reply_channel,
            reply_timeout,
            pending,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Send a request without listening for replies. Returns its correlation id.
    pub async fn send(&self, args: Vec<Value>) -> Result<u64> {
        let id = next_id();
        self.emit_request(id, args).await?;
        Ok(id)
    }

    /// Send a request and call `on_reply(data, more)` for each reply.
    ///
    /// `more` is false on the final reply. If the service never answers, or
    /// stops answering for the reply timeout, `on_reply` is simply not called
    /// again.
    pub async fn invoke<F>(&self, args: Vec<Value>, on_reply: F) -> Result<u64>
    where
        F: Fn(Value, bool) + Send + Sync + 'static,
    {
        let id = self.pending.reserve();
        if let Err(e) = register(
            &self.replies,
            &self.reply_channel,
            &self.pending,
            id,
            self.reply_timeout,
            Arc::new(on_reply),
        )
        .await
        {
            self.pending.release(id);
            return Err(e);
        }
        self.emit_request(id, args).await?;
        Ok(id)
    }

    /// Send a request and receive its replies as `(data, more)` pairs.
    ///
    /// The receiver ends after the final reply or the reply timeout.
    pub async fn stream(&self, args: Vec<Value>) -> Result<mpsc::UnboundedReceiver<(Value, bool)>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.invoke(args, move |data, more| {
            let _ = tx.send((data, more));
        })
        .await?;
        Ok(rx)
    }

    async fn emit_request(&self, id: u64, args: Vec<Value>) -> Result<()> {
        let request = RpcRequest {
            method: self.method.to_string(),
            args,
            id,
            ctx: self.ctx.clone(),
        };
        let payload = serde_json::to_value(&request)?;
        self.base
            .emit(&format!("rpc_{}", self.service), vec![payload])
            .await?;
        debug!(
            service = %self.service,
            method = %self.method,
            correlation_id = id,
            "RPC request sent"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("ctx", &self.ctx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_in_range() {
        for _ in 0..1000 {
            assert!(next_id() < MAX_CORRELATION_ID);
        }
    }

    #[test]
    fn test_pending_table_reserves_unique_ids() {
        let table = PendingTable::default();
        let ids: HashSet<u64> = (0..100).map(|_| table.reserve()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(table.len(), 100);

        for id in ids {
            table.release(id);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_deliver_filters_by_id_and_stops_after_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: ResponseHandler = {
            let seen = Arc::clone(&seen);
            Arc::new(move |data: Value, more: bool| seen.lock().unwrap().push((data, more)))
        };
        let pending = PendingRequest::new(5);
        let reply = |id: u64, close: bool, data: i64| {
            vec![serde_json::json!({"close": close, "data": data, "id": id})]
        };

        pending.deliver(&reply(4, true, 0), &handler);
        pending.deliver(&reply(5, false, 1), &handler);
        pending.deliver(&reply(5, true, 2), &handler);
        pending.deliver(&reply(5, true, 3), &handler);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(serde_json::json!(1), true), (serde_json::json!(2), false)]
        );
        assert!(pending.replied.load(Ordering::Acquire));
    }
}
