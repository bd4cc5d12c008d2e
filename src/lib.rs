//! CORS-bypass reverse proxy.
//!
//! Browsers refuse cross-origin responses that lack CORS headers; this
//! proxy fetches the target on the caller's behalf and rewrites the
//! response so the browser accepts it. Callers are tenants registered by
//! origin, with per-tenant target allow-lists, secret substitution,
//! tiered rate limits, and metered usage.
//!
//! # Data Flow
//! ```text
//! Browser ──▶ http (validate, preflight, identity)
//!                │
//!                ├─▶ tenant (origin → application, cached + invalidated)
//!                ├─▶ security (rate limit, free-tier quota, SSRF guard)
//!                ├─▶ secrets ({{name}} → decrypted values)
//!                ├─▶ upstream (vetted dispatch, streamed body)
//!                └─▶ usage (byte-accounted, micro-batched metering)
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod secrets;
pub mod security;
pub mod store;
pub mod tenant;
pub mod upstream;
pub mod usage;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use lifecycle::{AppContext, Shutdown};
