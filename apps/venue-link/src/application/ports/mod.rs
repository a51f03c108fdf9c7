//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TransportConnector`: Opens one framed, bidirectional transport to a venue
//! - `MessageParser`: Maps decoded payloads onto the routed message shape

mod message_parser_port;
mod transport_port;

pub use message_parser_port::MessageParser;
pub use transport_port::{BoxError, Frame, Transport, TransportConnector, TransportError};
