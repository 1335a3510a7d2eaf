//! Message envelope codec.
//!
//! Wire format: `{ "data": [arg, ...] | null, "version": 1 }`. A `null` data
//! field marks a message with no payload; receivers drop it without
//! dispatching.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Versioned wrapper around an argument sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Option<Vec<Value>>,
    /// Written on every message but never checked on receipt.
    #[serde(default = "current_version")]
    pub version: u32,
}

fn current_version() -> u32 {
    ENVELOPE_VERSION
}

impl Envelope {
    /// Wrap an argument sequence.
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            data: Some(args),
            version: ENVELOPE_VERSION,
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> String {
        // Vec<Value> with a u32 always serializes
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"data\":null,\"version\":1}"))
    }

    /// Parse wire bytes. Malformed input is logged and yields `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable envelope");
                None
            }
        }
    }

    /// Arguments to dispatch, or `None` if there is nothing to dispatch.
    pub fn into_args(self) -> Option<Vec<Value>> {
        self.data
    }
}

/// Encode `args` into wire form.
pub fn encode(args: Vec<Value>) -> String {
    Envelope::new(args).encode()
}
