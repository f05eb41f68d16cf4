//! Value types shared by the probe executors, the dispatcher and the aggregator.

mod outcome;
mod result;
mod target;

pub use outcome::*;
pub use result::*;
pub use target::*;
