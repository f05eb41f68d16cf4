//! Probe executors.
//!
//! Latency (external ping tool or timed TCP connects), TCP port checks, name
//! resolution and route tracing. Each executor performs one unit of work and
//! reports per-target failures as data. `interfaces` reads the local
//! machine's own configuration.

mod dns;
mod interfaces;
mod parse;
mod ping;
mod port;
mod trace;

pub use dns::*;
pub use interfaces::*;
pub use parse::*;
pub use ping::*;
pub use port::*;
pub use trace::*;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::model::{FailureKind, ProbeFailure, ProbeTarget, SampleSet, ValidationError};

/// Slack added on top of the attempt budget for process startup and teardown.
pub const PROCESS_GRACE: Duration = Duration::from_secs(2);

/// Errors that abort an operation instead of being recorded as an outcome.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Failed(#[from] ProbeFailure),
    #[error("operation exceeded its deadline of {0:?}")]
    Deadline(Duration),
}

impl ProbeError {
    /// The per-target outcome this error stands for when it has to be kept as data.
    pub fn to_failure(&self) -> ProbeFailure {
        match self {
            ProbeError::Validation(e) => ProbeFailure::new(FailureKind::InvalidInput, e.to_string()),
            ProbeError::Launch { .. } => ProbeFailure::unreachable(self.to_string()),
            ProbeError::Failed(f) => f.clone(),
            ProbeError::Deadline(d) => ProbeFailure::timeout(*d),
        }
    }
}

/// Source of latency samples for one target.
///
/// Implementations run `count` attempts strictly in sequence and return them
/// as one sample set. Losses are data; only infrastructure problems (the
/// probe cannot run at all) come back as `Err`.
pub trait LatencyProbe: Send + Sync + 'static {
    fn sample(
        &self,
        target: &ProbeTarget,
        count: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<SampleSet, ProbeError>> + Send;

    /// Wall-clock budget for a whole `sample` call.
    fn budget(&self, count: u32, timeout: Duration) -> Duration {
        timeout.saturating_mul(count) + PROCESS_GRACE
    }
}
