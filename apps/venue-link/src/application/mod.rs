//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the subscription service and the port interfaces
//! that define how it reaches the network.

/// Port interfaces for external systems (transport, message parsing).
pub mod ports;

/// Application services for subscription multiplexing.
pub mod services;
