//! Domain Layer - Core streaming types with no I/O.
//!
//! Everything here is plain data plus the invariants that govern it, so it
//! can be exercised without a runtime or a socket.

/// Inbound payloads, routed messages and the bounded per-consumer queue.
pub mod streaming;

/// Subscription records and the ordered registry.
pub mod subscription;
