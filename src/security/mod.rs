//! Security subsystem.
//!
//! Rate limiting, free-tier quota enforcement, and the SSRF address guard.

pub mod quota;
pub mod rate_limit;
pub mod ssrf;

pub use quota::QuotaGate;
pub use rate_limit::{LimitScope, RateLimitDecision, RateLimiter};
