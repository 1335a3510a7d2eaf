//! Listener dispatch.
//!
//! Decodes an inbound payload and hands its arguments to every local
//! listener of the channel, most recently registered first.

use serde_json::Value;
use tracing::debug;

use super::ChannelRegistry;
use crate::envelope;

/// Result of processing one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Delivered to this many listeners (possibly zero).
    Delivered(usize),
    /// Envelope carried `data: null`; nothing dispatched.
    Empty,
    /// Payload could not be decoded; nothing dispatched.
    DecodeError,
}

/// Call every listener of `key` with `args`.
///
/// The listener list is snapshotted first so listeners may add or remove
/// listeners without deadlocking.
pub(crate) async fn dispatch_to_listeners(
    registry: &ChannelRegistry,
    key: &str,
    args: Vec<Value>,
) -> usize {
    let listeners = registry.dispatch_order(key).await;
    for listener in &listeners {
        listener(args.clone());
    }
    listeners.len()
}

/// Decode → dispatch cycle for one payload.
pub(crate) async fn process_message(
    registry: &ChannelRegistry,
    key: &str,
    payload: &str,
) -> DispatchResult {
    let Some(envelope) = envelope::Envelope::decode(payload) else {
        return DispatchResult::DecodeError;
    };
    match envelope.into_args() {
        Some(args) => {
            let delivered = dispatch_to_listeners(registry, key, args).await;
            debug!(channel = %key, listeners = delivered, "Dispatched message");
            DispatchResult::Delivered(delivered)
        }
        None => {
            debug!(channel = %key, "Ignoring envelope without data");
            DispatchResult::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::transport::Opened;
    use crate::broker::{ConnectionPool, Endpoint, ErrorSink, MemoryBroker};
    use crate::interfaces::transport::Listener;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(MemoryBroker::new()),
            Endpoint::parse("memory://dispatch").unwrap(),
            ErrorSink::new(),
        )
    }

    /// Channel whose consumer never receives anything.
    fn idle(pool: &ConnectionPool) -> Opened {
        Opened {
            connection: pool.open(),
            consumer: tokio::spawn(async {}),
            ready: tokio::sync::watch::channel(true).1,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Listener {
        let log = Arc::clone(log);
        let name = name.to_string();
        Arc::new(move |_args: Vec<Value>| log.lock().unwrap().push(name.clone()))
    }

    async fn registry_with(names: &[&str], log: &Arc<Mutex<Vec<String>>>) -> ChannelRegistry {
        let pool = pool();
        let registry = ChannelRegistry::new();
        for name in names {
            registry
                .add("chan", recorder(log, name), || idle(&pool))
                .await;
        }
        registry
    }

    #[tokio::test]
    async fn test_dispatch_reverse_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&["first", "second", "third"], &log).await;

        let result = process_message(&registry, "chan", r#"{"data":[1],"version":1}"#).await;

        assert_eq!(result, DispatchResult::Delivered(3));
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_process_message_decode_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&["only"], &log).await;

        let result = process_message(&registry, "chan", "{broken").await;

        assert_eq!(result, DispatchResult::DecodeError);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_message_null_data() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&["only"], &log).await;

        let result = process_message(&registry, "chan", r#"{"data":null,"version":1}"#).await;

        assert_eq!(result, DispatchResult::Empty);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_passes_exact_args() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ChannelRegistry::new();
        let pool = pool();
        let sink = Arc::clone(&seen);
        registry
            .add(
                "chan",
                Arc::new(move |args: Vec<Value>| sink.lock().unwrap().push(args)),
                || idle(&pool),
            )
            .await;

        dispatch_to_listeners(&registry, "chan", vec![json!("a"), json!({"b": 2})]).await;

        assert_eq!(*seen.lock().unwrap(), vec![vec![json!("a"), json!({"b": 2})]]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_channel() {
        let registry = ChannelRegistry::new();
        assert_eq!(dispatch_to_listeners(&registry, "nobody", vec![]).await, 0);
    }
}
