//! Per-attempt outcomes and the sample sets built from them.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::{ProbeTarget, ValidationError};

/// Why a probe attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Timeout,
    Unreachable,
    ResolutionFailed,
    Refused,
    InvalidInput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unreachable => "unreachable",
            FailureKind::ResolutionFailed => "resolution-failed",
            FailureKind::Refused => "refused",
            FailureKind::InvalidInput => "invalid-input",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt, carried as data rather than unwound.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{kind}: {message}")]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("no answer within {:?}", budget))
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unreachable, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Refused, message)
    }

    pub fn resolution_failed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ResolutionFailed, message)
    }
}

impl From<ValidationError> for ProbeFailure {
    fn from(err: ValidationError) -> Self {
        Self::new(FailureKind::InvalidInput, err.to_string())
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Round trip in milliseconds.
    Success { rtt_ms: f64 },
    Failure(ProbeFailure),
}

impl ProbeOutcome {
    pub fn success(rtt: Duration) -> Self {
        ProbeOutcome::Success {
            rtt_ms: rtt.as_secs_f64() * 1000.0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        match self {
            ProbeOutcome::Success { rtt_ms } => Some(*rtt_ms),
            ProbeOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ProbeFailure> {
        match self {
            ProbeOutcome::Success { .. } => None,
            ProbeOutcome::Failure(f) => Some(f),
        }
    }
}

impl From<ProbeFailure> for ProbeOutcome {
    fn from(failure: ProbeFailure) -> Self {
        ProbeOutcome::Failure(failure)
    }
}

/// One unit of work handed to an executor. Lives only for the attempt.
#[derive(Debug, Clone)]
pub struct ProbeAttempt<'a> {
    pub target: &'a ProbeTarget,
    pub sequence: u32,
    started: Instant,
}

impl<'a> ProbeAttempt<'a> {
    pub fn start(target: &'a ProbeTarget, sequence: u32) -> Self {
        Self {
            target,
            sequence,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Close the attempt as a success timed from its start.
    pub fn succeed(self) -> ProbeOutcome {
        ProbeOutcome::success(self.elapsed())
    }

    pub fn fail(self, failure: ProbeFailure) -> ProbeOutcome {
        tracing::debug!(
            host = %self.target,
            sequence = self.sequence,
            kind = ?failure.kind,
            "attempt failed"
        );
        ProbeOutcome::Failure(failure)
    }
}

/// Ordered attempts against a single target.
///
/// `sent` and `received` are the authoritative counts. When they come from a
/// tool's own summary line, `outcomes` may hold fewer measured successes than
/// `received`; losses are always present as failure outcomes.
#[derive(Debug, Clone)]
pub struct SampleSet {
    target: ProbeTarget,
    sent: u32,
    received: u32,
    outcomes: Vec<ProbeOutcome>,
}

impl SampleSet {
    /// Build from individually observed attempts.
    pub fn from_outcomes(target: ProbeTarget, outcomes: Vec<ProbeOutcome>) -> Self {
        let sent = outcomes.len() as u32;
        let received = outcomes.iter().filter(|o| o.is_success()).count() as u32;
        Self {
            target,
            sent,
            received,
            outcomes,
        }
    }

    /// Build from tool-reported counts plus whatever round trips were scraped.
    ///
    /// `received` is clamped to `sent`, and round trips beyond `received` are
    /// dropped.
    pub fn from_counts(target: ProbeTarget, sent: u32, received: u32, rtts_ms: &[f64]) -> Self {
        let received = received.min(sent);
        let mut outcomes: Vec<ProbeOutcome> = rtts_ms
            .iter()
            .take(received as usize)
            .map(|&rtt_ms| ProbeOutcome::Success { rtt_ms })
            .collect();
        for _ in received..sent {
            outcomes.push(ProbeOutcome::Failure(ProbeFailure::new(
                FailureKind::Timeout,
                "no reply",
            )));
        }
        Self {
            target,
            sent,
            received,
            outcomes,
        }
    }

    /// Every attempt lost to the same failure.
    pub fn total_loss(target: ProbeTarget, sent: u32, failure: ProbeFailure) -> Self {
        Self {
            target,
            sent,
            received: 0,
            outcomes: vec![ProbeOutcome::Failure(failure); sent as usize],
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }

    /// Measured round trips, in attempt order.
    pub fn rtts_ms(&self) -> Vec<f64> {
        self.outcomes.iter().filter_map(ProbeOutcome::rtt_ms).collect()
    }

    pub fn first_failure(&self) -> Option<&ProbeFailure> {
        self.outcomes.iter().find_map(ProbeOutcome::failure)
    }
}
