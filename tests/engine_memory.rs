//! In-memory broker integration tests.
//!
//! Run with: cargo test --test engine_memory -- --nocapture
//!
//! Each test uses its own `memory://` broker, resolved from the endpoint
//! scheme exactly as a `redis://` endpoint would be.

mod engine;

use std::time::Duration;

use serde_json::{json, Value};

use stackio::broker::MemoryBroker;
use stackio::{Service, TransportKind};

use engine::engine_tests::{forwarding, make_engine, next, wait_until};

fn broker_name() -> String {
    format!("engine-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_memory_engine() {
    println!("=== Memory Engine Tests ===");

    let name = broker_name();
    let endpoint = format!("memory://{name}");
    println!("Using endpoint: {}", endpoint);

    run_engine_tests!(&endpoint, "test");

    println!("=== All Memory Engine tests PASSED ===");
}

#[tokio::test]
async fn test_queue_holds_messages_until_consumer_arrives() {
    let endpoint = format!("memory://{}", broker_name());
    let producer = make_engine(&endpoint, "test", TransportKind::PushPull);
    let consumer = make_engine(&endpoint, "test", TransportKind::PushPull);

    for n in 0..3 {
        producer
            .emit("work", vec![json!(n)])
            .await
            .expect("emit should succeed");
    }

    let (listener, mut rx) = forwarding();
    consumer.on("work", listener).await.expect("on should succeed");
    for n in 0..3 {
        assert_eq!(next(&mut rx).await, Some(vec![json!(n)]));
    }
}

#[tokio::test]
async fn test_unconsumed_queue_is_capped() {
    let name = broker_name();
    let broker = MemoryBroker::named(&name);
    let producer = make_engine(&format!("memory://{name}"), "test", TransportKind::PushPull);

    for n in 0..150 {
        producer
            .emit("backlog", vec![json!(n)])
            .await
            .expect("emit should succeed");
    }

    // Checked emits 111, 122, 133 and 144 each find more than 100 queued.
    assert_eq!(broker.list_len("stackio_pushpull_backlog"), 146);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_releases_reply_listener() {
    let endpoint = format!("memory://{}", broker_name());
    let server = make_engine(&endpoint, "test", TransportKind::PubSub);
    let client = make_engine(&endpoint, "test", TransportKind::PubSub);
    server
        .expose(
            "quiet",
            Service::new().method("ignore", |_ctx, _args, _reply| async {}),
        )
        .await
        .expect("expose should succeed");

    let mut replies = client
        .call("quiet", "ignore", Value::Null)
        .expect("call should succeed")
        .stream(vec![])
        .await
        .expect("stream should succeed");
    assert_eq!(client.reply_listener_count().await, 1);
    assert_eq!(client.pending_calls(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(replies.recv().await, None);
    assert_eq!(client.reply_listener_count().await, 0);
    wait_until(|| client.pending_calls() == 0).await;
}
