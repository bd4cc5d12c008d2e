//! Tenant configuration lookup.
//!
//! Maps a caller origin to its registered application, with a short-TTL
//! local cache invalidated through the deployment-wide pub/sub channel.

pub mod invalidation;
pub mod resolver;
pub mod subscription;

pub use invalidation::spawn_invalidation_listener;
pub use resolver::TenantResolver;
pub use subscription::SubscriptionService;
