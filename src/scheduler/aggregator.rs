//! Reduction of sample sets into aggregated results.

use chrono::Utc;

use crate::model::{AggregatedResult, QualityRating, SampleSet};

/// Reduce one target's sample set.
///
/// Loss is recomputed from the counts. Latency statistics cover successful
/// attempts only. With no measured round trip the result is unreachable:
/// nothing received, 100% loss, zeroed statistics. The only
/// non-deterministic field is `created_at`.
pub fn aggregate(samples: &SampleSet) -> AggregatedResult {
    let sent = samples.sent();
    let received = samples.received().min(sent);

    let packet_loss = if sent == 0 {
        0.0
    } else {
        f64::from(sent - received) / f64::from(sent) * 100.0
    };

    let rtts = samples.rtts_ms();
    if received == 0 || rtts.is_empty() {
        return AggregatedResult {
            target: samples.target().clone(),
            attempts_sent: sent,
            attempts_received: 0,
            packet_loss: 100.0,
            success_rate: 0.0,
            min_ms: 0.0,
            avg_ms: 0.0,
            max_ms: 0.0,
            jitter_ms: 0.0,
            quality_score: 0,
            rating: QualityRating::Unreachable,
            healthy: false,
            error: samples.first_failure().cloned(),
            created_at: Utc::now(),
        };
    }

    let min_ms = rtts.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg_ms = rtts.iter().sum::<f64>() / rtts.len() as f64;
    let jitter_ms = max_ms - min_ms;

    let quality_score = quality_score(avg_ms, packet_loss, jitter_ms);

    AggregatedResult {
        target: samples.target().clone(),
        attempts_sent: sent,
        attempts_received: received,
        packet_loss,
        success_rate: 100.0 - packet_loss,
        min_ms,
        avg_ms,
        max_ms,
        jitter_ms,
        quality_score,
        rating: QualityRating::from_score(quality_score),
        healthy: true,
        error: samples.first_failure().cloned(),
        created_at: Utc::now(),
    }
}

/// Composite 0-100 score from average latency, loss percentage and jitter.
///
/// Jitter is judged relative to the average (coefficient of variation).
pub fn quality_score(avg_ms: f64, packet_loss: f64, jitter_ms: f64) -> u8 {
    let mut score: i32 = 100;

    score -= if avg_ms > 100.0 {
        40
    } else if avg_ms >= 50.0 {
        20
    } else if avg_ms >= 20.0 {
        10
    } else {
        0
    };

    score -= if packet_loss > 5.0 {
        30
    } else if packet_loss >= 1.0 {
        15
    } else if packet_loss >= 0.1 {
        5
    } else {
        0
    };

    let cv = if avg_ms > 0.0 { jitter_ms / avg_ms } else { 0.0 };
    score -= if cv > 0.5 {
        20
    } else if cv >= 0.2 {
        10
    } else {
        0
    };

    score.clamp(0, 100) as u8
}
