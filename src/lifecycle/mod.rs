//! Process lifecycle.
//!
//! Startup wires every service into an explicit `AppContext`; shutdown is
//! a broadcast signal that long-running tasks subscribe to, followed by an
//! explicit drain of the usage aggregator.

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::AppContext;
