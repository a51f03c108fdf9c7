//! Configuration Module
//!
//! Environment-driven settings for the venue link binary.

mod settings;

pub use settings::{ConfigError, LinkSettings, ServerSettings, WatchSettings};
