//! RPC payloads.
//!
//! Both travel as the first argument of an envelope: requests on
//! `rpc_<service>`, replies on the reply channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub id: u64,
    #[serde(default)]
    pub ctx: Value,
}

/// One reply to a request. `close: false` means more replies follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub close: bool,
    #[serde(default)]
    pub data: Value,
    pub id: u64,
}

/// Decode the leading argument of a delivered message.
fn first_arg<T: for<'de> Deserialize<'de>>(args: &[Value], kind: &'static str) -> Option<T> {
    let first = args.first()?;
    match T::deserialize(first) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(kind, error = %e, "Ignoring malformed RPC payload");
            None
        }
    }
}

impl RpcRequest {
    pub fn from_args(args: &[Value]) -> Option<Self> {
        first_arg(args, "request")
    }
}

impl RpcReply {
    pub fn from_args(args: &[Value]) -> Option<Self> {
        first_arg(args, "reply")
    }
}
