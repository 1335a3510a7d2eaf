//! Abstract interfaces for stackio components.
//!
//! These traits define the contracts for:
//! - Broker drivers and connections (wire access)
//! - Channel transports (pub/sub and push/pull delivery)

pub mod broker;
pub mod transport;

pub use broker::{BrokerError, Connection, Driver, PayloadStream};
pub use transport::{Listener, ListenerId, Transport, TransportError, TransportKind};
