//! Stackio - broker-mediated messaging
//!
//! Pub/sub broadcast and push/pull work queues over one shared broker, with
//! correlated request/reply RPC built on top. Processes never talk to each
//! other directly; every message passes through the broker.

pub mod broker;
pub mod config;
pub mod envelope;
pub mod interfaces;
pub mod rpc;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{Config, EngineOptions};
pub use interfaces::{Listener, ListenerId, Transport, TransportKind};
pub use rpc::{Engine, Reply, RpcError, Service, Stub};
