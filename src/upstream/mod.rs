//! Outbound fetch toward the target URL.
//!
//! The dispatcher resolves and vets every hop itself before handing the
//! connection to the HTTP client, so redirects can never be used to reach
//! addresses the resolver would have refused.

pub mod dispatch;
pub mod stream;

pub use dispatch::Dispatcher;
pub use stream::MeteredStream;
