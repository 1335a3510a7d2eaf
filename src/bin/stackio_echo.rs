//! stackio-echo: Echo service
//!
//! Exposes service `echo` over the configured broker. Useful for checking
//! that callers, broker and reply channel are wired up.
//!
//! ## Methods
//! - `repeat(x)`: replies once with `x`
//! - `count(n)`: streams `1..=n`, keeping the reply open until `n`
//!
//! ## Configuration
//! - STACKIO_CONFIG: YAML config file (optional)
//! - STACKIO__ENGINE__TRANSPORT: broker endpoint (default: redis://127.0.0.1:6379)
//! - STACKIO__ENGINE__TYPE: `pub/sub` or `push/pull` (default: pub/sub)
//! - STACKIO_LOG: log filter (default: info)

use std::time::Duration;

use backon::Retryable;
use serde_json::{json, Value};
use tracing::{info, warn};

use stackio::utils::bootstrap::init_tracing;
use stackio::utils::retry::connection_backoff;
use stackio::{Config, Engine, RpcError, Service};

const SERVICE_NAME: &str = "echo";

fn echo_service() -> Service {
    Service::new()
        .method("repeat", |_ctx, args, reply| async move {
            let value = args.into_iter().next().unwrap_or(Value::Null);
            let _ = reply.send(value, false).await;
        })
        .method("count", |_ctx, args, reply| async move {
            let n = args.first().and_then(Value::as_u64).unwrap_or(0);
            if n == 0 {
                let _ = reply.send(Value::Null, false).await;
                return;
            }
            for i in 1..=n {
                let _ = reply.send(json!(i), i < n).await;
            }
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let engine = Engine::new(config.engine_options())?;

    (|| engine.ping())
        .retry(connection_backoff())
        .notify(|err: &RpcError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Broker unreachable, retrying");
        })
        .await?;

    engine.expose(SERVICE_NAME, echo_service()).await?;
    info!(
        service = SERVICE_NAME,
        kind = %engine.kind(),
        "stackio-echo started"
    );

    tokio::signal::ctrl_c().await?;
    info!("stackio-echo shutting down");

    Ok(())
}
