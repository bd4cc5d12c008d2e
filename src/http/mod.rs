//! HTTP front door.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, routes, body limit, trace)
//!     → request.rs (target URL + caller identity extraction)
//!     → proxy.rs (validation, tenant, limits, substitution, dispatch)
//!     → jsonp.rs (script-envelope rendering, JSONP only)
//!     → streamed response with rewritten CORS headers
//! ```

pub mod jsonp;
pub mod proxy;
pub mod request;
pub mod server;

pub use server::serve;
