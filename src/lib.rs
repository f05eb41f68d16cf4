//! netdiag - concurrent network diagnostics.
//!
//! Probes hosts for latency, open ports, name resolution and routes, and
//! reduces repeated samples into latency, jitter, loss and quality figures.

pub mod config;
pub mod model;
pub mod probe;
pub mod scheduler;
