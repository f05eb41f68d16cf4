//! Aggregated per-target results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ProbeFailure, ProbeTarget};

/// Human-facing label derived from the quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
    Unreachable,
}

impl QualityRating {
    /// Rating for a reachable target.
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => QualityRating::Excellent,
            75..=89 => QualityRating::Good,
            50..=74 => QualityRating::Fair,
            _ => QualityRating::Poor,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityRating::Excellent => "Excellent",
            QualityRating::Good => "Good",
            QualityRating::Fair => "Fair",
            QualityRating::Poor => "Poor",
            QualityRating::Unreachable => "Unreachable",
        }
    }
}

impl fmt::Display for QualityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The durable output of a latency run against one target.
///
/// Built once by the aggregator and never mutated afterwards; share it by
/// reference or behind an `Arc`.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub target: ProbeTarget,
    pub attempts_sent: u32,
    pub attempts_received: u32,
    /// Percentage, recomputed from the counts.
    pub packet_loss: f64,
    /// Percentage of attempts answered.
    pub success_rate: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    /// Range-based jitter (max - min).
    pub jitter_ms: f64,
    pub quality_score: u8,
    pub rating: QualityRating,
    pub healthy: bool,
    /// First failure seen, kept for display when the target is degraded.
    pub error: Option<ProbeFailure>,
    pub created_at: DateTime<Utc>,
}

impl AggregatedResult {
    /// Plain-language advice for the measured connection.
    pub fn recommendations(&self) -> Vec<&'static str> {
        if !self.healthy {
            return vec!["Target did not answer. Check that the host is up and reachable from this network."];
        }

        let mut out = Vec::new();

        if self.avg_ms > 100.0 {
            out.push("High latency detected. May affect real-time applications (gaming, video calls).");
        } else if self.avg_ms > 50.0 {
            out.push("Moderate latency. Gaming and video calls may experience some lag.");
        }

        if self.packet_loss > 5.0 {
            out.push("High packet loss detected. Check network stability and equipment.");
        } else if self.packet_loss > 1.0 {
            out.push("Some packet loss detected. Monitor network for stability issues.");
        }

        if self.jitter_ms > 20.0 {
            out.push("High jitter detected. May cause inconsistent performance.");
        }

        if out.is_empty() {
            out.push("Connection quality looks good! No immediate issues detected.");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_bands() {
        assert_eq!(QualityRating::from_score(100), QualityRating::Excellent);
        assert_eq!(QualityRating::from_score(90), QualityRating::Excellent);
        assert_eq!(QualityRating::from_score(89), QualityRating::Good);
        assert_eq!(QualityRating::from_score(75), QualityRating::Good);
        assert_eq!(QualityRating::from_score(74), QualityRating::Fair);
        assert_eq!(QualityRating::from_score(50), QualityRating::Fair);
        assert_eq!(QualityRating::from_score(49), QualityRating::Poor);
        assert_eq!(QualityRating::from_score(0), QualityRating::Poor);
        assert_eq!(QualityRating::Unreachable.to_string(), "Unreachable");
    }
}
