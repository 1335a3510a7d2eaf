//! Engine contract tests.
//!
//! Every test takes a broker endpoint and a unique prefix; channel and
//! service names are derived from the prefix so runs against a shared broker
//! do not interfere.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use stackio::{Engine, EngineOptions, Listener, Service, TransportKind};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine of the given kind with a reply channel private to this run.
pub fn make_engine(endpoint: &str, prefix: &str, kind: TransportKind) -> Engine {
    Engine::new(
        EngineOptions::new()
            .with_kind(kind)
            .with_transport(endpoint)
            .with_reply_channel(format!("{prefix}_replies")),
    )
    .expect("engine should build")
}

/// Listener forwarding every delivery into a channel.
pub fn forwarding() -> (Listener, mpsc::UnboundedReceiver<Vec<Value>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |args: Vec<Value>| {
        let _ = tx.send(args);
    });
    (listener, rx)
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
}

/// Poll `condition` until it holds or the receive timeout passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn echo_service() -> Service {
    Service::new()
        .method("repeat", |_ctx, args, reply| async move {
            let value = args.into_iter().next().unwrap_or(Value::Null);
            let _ = reply.send(value, false).await;
        })
        .method("stream", |_ctx, _args, reply| async move {
            let _ = reply.send(json!(1), true).await;
            let _ = reply.send(json!(2), false).await;
        })
}

// =============================================================================
// Channel tests
// =============================================================================

pub async fn test_pubsub_delivers_after_subscribe(endpoint: &str, prefix: &str) {
    let engine = make_engine(endpoint, prefix, TransportKind::PubSub);
    let channel = format!("{prefix}_news");

    engine
        .emit(&channel, vec![json!("before")])
        .await
        .expect("emit should succeed");

    let (listener, mut rx) = forwarding();
    engine.on(&channel, listener).await.expect("on should succeed");
    for n in 0..3 {
        engine
            .emit(&channel, vec![json!(n), json!({"n": n})])
            .await
            .expect("emit should succeed");
    }

    for n in 0..3 {
        assert_eq!(next(&mut rx).await, Some(vec![json!(n), json!({"n": n})]));
    }
    engine.remove_all_listeners(&channel).await.expect("remove should succeed");
}

pub async fn test_listeners_newest_first(endpoint: &str, prefix: &str) {
    let engine = make_engine(endpoint, prefix, TransportKind::PubSub);
    let channel = format!("{prefix}_order");
    let (tx, mut rx) = mpsc::unbounded_channel();

    for name in ["first", "second", "third"] {
        let tx = tx.clone();
        engine
            .add_listener(
                &channel,
                Arc::new(move |_args: Vec<Value>| {
                    let _ = tx.send(name);
                }),
            )
            .await
            .expect("add_listener should succeed");
    }
    engine.emit(&channel, vec![]).await.expect("emit should succeed");

    assert_eq!(next(&mut rx).await, Some("third"));
    assert_eq!(next(&mut rx).await, Some("second"));
    assert_eq!(next(&mut rx).await, Some("first"));
    engine.remove_all_listeners(&channel).await.expect("remove should succeed");
}

pub async fn test_pushpull_each_message_once(endpoint: &str, prefix: &str) {
    let channel = format!("{prefix}_jobs");
    let producer = make_engine(endpoint, prefix, TransportKind::PushPull);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let consumer = make_engine(endpoint, prefix, TransportKind::PushPull);
        let tx = tx.clone();
        consumer
            .on(
                &channel,
                Arc::new(move |args: Vec<Value>| {
                    let _ = tx.send(args);
                }),
            )
            .await
            .expect("on should succeed");
        consumers.push(consumer);
    }
    drop(tx);

    for n in 0..20u64 {
        producer
            .emit(&channel, vec![json!(n)])
            .await
            .expect("emit should succeed");
    }

    let mut seen = HashSet::new();
    for _ in 0..20 {
        let args = next(&mut rx).await.expect("consumer dropped");
        let n = args[0].as_u64().expect("numeric payload");
        assert!(seen.insert(n), "message {n} delivered twice");
    }
    assert_eq!(seen.len(), 20);

    for consumer in &consumers {
        consumer
            .remove_all_listeners(&channel)
            .await
            .expect("remove should succeed");
    }
}

// =============================================================================
// RPC tests
// =============================================================================

pub async fn test_rpc_round_trip(endpoint: &str, prefix: &str, kind: TransportKind) {
    let service = format!("{prefix}_echo");
    let server = make_engine(endpoint, prefix, kind);
    let client = make_engine(endpoint, prefix, kind);
    server
        .expose(&service, echo_service())
        .await
        .expect("expose should succeed");

    let mut replies = client
        .call(&service, "repeat", Value::Null)
        .expect("call should succeed")
        .stream(vec![json!(42)])
        .await
        .expect("stream should succeed");

    assert_eq!(next(&mut replies).await, Some((json!(42), false)));
    assert_eq!(next(&mut replies).await, None);
    assert_eq!(client.reply_listener_count().await, 0);
}

pub async fn test_rpc_streaming(endpoint: &str, prefix: &str) {
    let service = format!("{prefix}_streamer");
    let server = make_engine(endpoint, prefix, TransportKind::PubSub);
    let client = make_engine(endpoint, prefix, TransportKind::PubSub);
    server
        .expose(&service, echo_service())
        .await
        .expect("expose should succeed");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .call(&service, "stream", Value::Null)
        .expect("call should succeed")
        .invoke(vec![], move |data, more| {
            let _ = tx.send((data, more));
        })
        .await
        .expect("invoke should succeed");

    assert_eq!(next(&mut rx).await, Some((json!(1), true)));
    assert_eq!(next(&mut rx).await, Some((json!(2), false)));
    assert_eq!(next(&mut rx).await, None);
    assert_eq!(client.reply_listener_count().await, 0);
    wait_until(|| client.pending_calls() == 0).await;
}

#[macro_export]
macro_rules! run_engine_tests {
    ($endpoint:expr, $prefix:expr) => {
        use $crate::engine::engine_tests::*;

        test_pubsub_delivers_after_subscribe($endpoint, $prefix).await;
        println!("  test_pubsub_delivers_after_subscribe: PASSED");

        test_listeners_newest_first($endpoint, $prefix).await;
        println!("  test_listeners_newest_first: PASSED");

        test_pushpull_each_message_once($endpoint, $prefix).await;
        println!("  test_pushpull_each_message_once: PASSED");

        test_rpc_round_trip($endpoint, $prefix, stackio::TransportKind::PubSub).await;
        println!("  test_rpc_round_trip (pub/sub): PASSED");

        test_rpc_round_trip($endpoint, $prefix, stackio::TransportKind::PushPull).await;
        println!("  test_rpc_round_trip (push/pull): PASSED");

        test_rpc_streaming($endpoint, $prefix).await;
        println!("  test_rpc_streaming: PASSED");
    };
}
