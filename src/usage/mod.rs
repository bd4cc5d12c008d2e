//! Usage metering.
//!
//! Per-request usage events are micro-batched off the request path and
//! flushed as one upsert-increment per (user, origin, UTC day). A shared
//! short-TTL marker deduplicates cache-hit traffic so CDN-served repeats
//! are not double-billed, while preflights can still attribute them.

pub mod aggregator;
pub mod recorder;

pub use aggregator::UsageAggregator;
pub use recorder::UsageRecorder;
