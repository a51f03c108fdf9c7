//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionManager`: Channel subscriptions, routing and resubscription
//! - `Watch`: Pull-based stream over one subscription

mod subscription_manager;
mod watch;

pub use subscription_manager::{
    SubscriptionError, SubscriptionEvent, SubscriptionManager, SubscriptionManagerConfig,
    SubscriptionStats,
};
pub use watch::Watch;
