//! Scheduler module for fanning probes out and aggregating their results.

mod aggregator;
mod cache;
mod dispatcher;
mod session;

pub use aggregator::*;
pub use cache::*;
pub use dispatcher::*;
pub use session::*;
