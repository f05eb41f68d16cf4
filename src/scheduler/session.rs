//! Diagnostic sessions.
//!
//! A session owns the latency probe, the probe settings and a resolver cache,
//! and turns "analyze these hosts" into one aggregated result per host.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::{aggregate, dispatch, ResolverCache};
use crate::config::ProbeSettings;
use crate::model::{
    validate_count, validate_host, validate_timeout, AggregatedResult, ProbeFailure, ProbeTarget,
    SampleSet,
};
use crate::probe::{
    self, LatencyProbe, PingCommand, PortReport, ProbeError, Resolution, TraceCommand, TraceResult,
};

/// Scheduling overhead allowed on top of a probe's own budget.
const SESSION_SLACK: Duration = Duration::from_secs(1);

/// Latency and name resolution for one host.
#[derive(Debug, Clone, Serialize)]
pub struct QuickCheck {
    pub host: String,
    pub latency: AggregatedResult,
    pub resolution: Option<Resolution>,
    pub resolution_error: Option<ProbeFailure>,
}

/// Orchestrates probe runs against many targets.
pub struct Session<P = PingCommand> {
    probe: Arc<P>,
    settings: ProbeSettings,
    cache: ResolverCache,
}

impl Session<PingCommand> {
    /// A session that pings with the configured ping command.
    pub fn from_settings(settings: ProbeSettings) -> Self {
        let probe = PingCommand::from_command_line(&settings.ping_program);
        Self::new(probe, settings)
    }
}

impl<P: LatencyProbe> Session<P> {
    pub fn new(probe: P, settings: ProbeSettings) -> Self {
        let cache = ResolverCache::new(settings.dns_cache_ttl);
        Self {
            probe: Arc::new(probe),
            settings,
            cache,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    /// Run `count` sequential attempts against one target and aggregate them.
    pub async fn probe_latency(
        &self,
        target: &ProbeTarget,
        count: u32,
        timeout: Duration,
    ) -> Result<AggregatedResult, ProbeError> {
        validate_count(count)?;
        validate_timeout(timeout)?;

        let budget = self.probe.budget(count, timeout) + SESSION_SLACK;
        let samples = match tokio::time::timeout(budget, self.probe.sample(target, count, timeout)).await {
            Ok(result) => settle(target, count, result)?,
            Err(_) => {
                tracing::warn!("Session: latency probe for {} exceeded {:?}", target, budget);
                SampleSet::total_loss(target.clone(), count, ProbeFailure::timeout(budget))
            }
        };
        Ok(aggregate(&samples))
    }

    /// Latency analysis of `hosts` with the configured count and timeout.
    pub async fn analyze<S: AsRef<str>>(
        &self,
        hosts: &[S],
    ) -> Result<Vec<AggregatedResult>, ProbeError> {
        self.analyze_with(hosts, self.settings.count, self.settings.timeout)
            .await
    }

    /// Latency analysis of `hosts`, one result per distinct host, sorted by host.
    ///
    /// Hosts are probed in parallel; each host's own attempts stay sequential.
    /// A host that cannot be probed comes back as an unreachable result. Only
    /// bad input and a probe tool that cannot be launched are errors.
    pub async fn analyze_with<S: AsRef<str>>(
        &self,
        hosts: &[S],
        count: u32,
        timeout: Duration,
    ) -> Result<Vec<AggregatedResult>, ProbeError> {
        validate_count(count)?;
        validate_timeout(timeout)?;
        let targets = hosts
            .iter()
            .map(|host| ProbeTarget::new(host.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let options = self
            .settings
            .dispatch_options(self.probe.budget(count, timeout) + SESSION_SLACK);

        tracing::info!(
            "Session: analyzing {} targets ({} attempts each, {} workers)",
            targets.len(),
            count,
            options.workers_for(targets.len())
        );

        let probe = self.probe.clone();
        let results = dispatch(
            targets,
            move |target: ProbeTarget| {
                let probe = probe.clone();
                async move { probe.sample(&target, count, timeout).await }
            },
            &options,
        )
        .await?;

        let mut aggregated = Vec::with_capacity(results.len());
        for (target, result) in results {
            let samples = settle(&target, count, result)?;
            aggregated.push(aggregate(&samples));
        }
        aggregated.sort_by(|a, b| a.target.cmp(&b.target));

        tracing::info!(
            "Session: {} of {} targets healthy",
            aggregated.iter().filter(|r| r.healthy).count(),
            aggregated.len()
        );
        Ok(aggregated)
    }

    /// Resolve `name`, answering from the cache while the entry is fresh.
    pub async fn resolve(&self, name: &str) -> Result<Resolution, ProbeError> {
        let name = validate_host(name)?;
        if let Some(hit) = self.cache.get(&name) {
            tracing::debug!("Session: {} answered from cache", name);
            return Ok(hit);
        }

        let resolution = probe::resolve(&name, self.settings.timeout).await?;
        self.cache.insert(resolution.clone());
        Ok(resolution)
    }

    /// Latency and resolution for one host, run side by side.
    pub async fn quick_check(&self, host: &str) -> Result<QuickCheck, ProbeError> {
        let target = ProbeTarget::new(host)?;

        let (latency, resolution) = tokio::join!(
            self.probe_latency(&target, self.settings.count, self.settings.timeout),
            self.resolve(target.host()),
        );

        let (resolution, resolution_error) = match resolution {
            Ok(resolution) => (Some(resolution), None),
            Err(e) => (None, Some(e.to_failure())),
        };

        Ok(QuickCheck {
            host: target.host().to_string(),
            latency: latency?,
            resolution,
            resolution_error,
        })
    }

    /// Scan `ports` on `host` with the configured timeout and worker limit.
    pub async fn scan(&self, host: &str, ports: &[u16]) -> Result<PortReport, ProbeError> {
        let target = ProbeTarget::new(host)?;
        probe::scan_ports(&target, ports, self.settings.timeout, self.settings.max_workers).await
    }

    /// Trace the route to `host` with the configured trace command.
    pub async fn trace(&self, host: &str, max_hops: u8) -> Result<TraceResult, ProbeError> {
        let target = ProbeTarget::new(host)?;
        TraceCommand::from_command_line(&self.settings.traceroute_program)
            .trace(&target, max_hops, self.settings.timeout)
            .await
    }
}

/// Turn a probe result into a sample set, keeping per-target failures as data.
fn settle(
    target: &ProbeTarget,
    count: u32,
    result: Result<SampleSet, ProbeError>,
) -> Result<SampleSet, ProbeError> {
    match result {
        Ok(samples) => Ok(samples),
        Err(e @ ProbeError::Launch { .. }) | Err(e @ ProbeError::Validation(_)) => Err(e),
        Err(e) => {
            tracing::debug!(host = %target, "recording probe error as total loss: {}", e);
            Ok(SampleSet::total_loss(target.clone(), count, e.to_failure()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureKind, ProbeOutcome, QualityRating};
    use std::collections::HashMap;

    /// Canned round trips per host; unknown hosts get a steady train.
    #[derive(Default)]
    struct MockProbe {
        trains: HashMap<String, Vec<Option<f64>>>,
        panic_on: Option<String>,
        stall_on: Option<String>,
    }

    impl MockProbe {
        fn with_train(mut self, host: &str, train: &[Option<f64>]) -> Self {
            self.trains.insert(host.to_string(), train.to_vec());
            self
        }
    }

    impl LatencyProbe for MockProbe {
        async fn sample(
            &self,
            target: &ProbeTarget,
            count: u32,
            _timeout: Duration,
        ) -> Result<SampleSet, ProbeError> {
            if self.panic_on.as_deref() == Some(target.host()) {
                panic!("mock probe blew up on {}", target);
            }
            if self.stall_on.as_deref() == Some(target.host()) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }

            let steady = [Some(10.0), Some(12.0), Some(11.0), Some(13.0)];
            let train = self
                .trains
                .get(target.host())
                .map(Vec::as_slice)
                .unwrap_or(&steady);

            let outcomes = (0..count as usize)
                .map(|i| match train[i % train.len()] {
                    Some(rtt_ms) => ProbeOutcome::Success { rtt_ms },
                    None => ProbeOutcome::Failure(ProbeFailure::timeout(Duration::from_secs(1))),
                })
                .collect();
            Ok(SampleSet::from_outcomes(target.clone(), outcomes))
        }
    }

    struct MissingTool;

    impl LatencyProbe for MissingTool {
        async fn sample(
            &self,
            _target: &ProbeTarget,
            _count: u32,
            _timeout: Duration,
        ) -> Result<SampleSet, ProbeError> {
            Err(ProbeError::Launch {
                program: "ping".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            })
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings {
            timeout: Duration::from_secs(1),
            max_workers: 5,
            ..ProbeSettings::default()
        }
    }

    fn hosts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("target-{}.example", i)).collect()
    }

    #[tokio::test]
    async fn test_steady_target() {
        let session = Session::new(MockProbe::default(), settings());
        let target = ProbeTarget::new("steady.example").unwrap();
        let result = session
            .probe_latency(&target, 4, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result.avg_ms, 11.5);
        assert_eq!(result.min_ms, 10.0);
        assert_eq!(result.max_ms, 13.0);
        assert_eq!(result.jitter_ms, 3.0);
        assert_eq!(result.packet_loss, 0.0);
        assert!(matches!(
            result.rating,
            QualityRating::Excellent | QualityRating::Good
        ));
    }

    #[tokio::test]
    async fn test_half_lost_target() {
        let probe = MockProbe::default().with_train("lossy.example", &[Some(10.0), None, Some(12.0), None]);
        let session = Session::new(probe, settings());

        let results = session.analyze(&["steady.example", "lossy.example"]).await.unwrap();
        let lossy = results.iter().find(|r| r.target.host() == "lossy.example").unwrap();
        let steady = results.iter().find(|r| r.target.host() == "steady.example").unwrap();

        assert_eq!(lossy.packet_loss, 50.0);
        assert!(lossy.quality_score < steady.quality_score);
        assert_ne!(lossy.rating, steady.rating);
    }

    #[tokio::test]
    async fn test_panicking_target_does_not_sink_the_run() {
        let probe = MockProbe {
            panic_on: Some("target-7.example".to_string()),
            ..MockProbe::default()
        };
        let session = Session::new(probe, settings());

        let results = session.analyze(&hosts(50)).await.unwrap();
        assert_eq!(results.len(), 50);

        let broken = results
            .iter()
            .find(|r| r.target.host() == "target-7.example")
            .unwrap();
        assert!(!broken.healthy);
        assert_eq!(broken.rating, QualityRating::Unreachable);
        assert_eq!(broken.packet_loss, 100.0);
        assert_eq!(broken.error.as_ref().map(|e| e.kind), Some(FailureKind::Unreachable));
        assert_eq!(results.iter().filter(|r| r.healthy).count(), 49);
    }

    #[tokio::test]
    async fn test_total_loss_is_degraded_result() {
        let probe = MockProbe::default().with_train("dark.example", &[None]);
        let session = Session::new(probe, settings());

        let results = session.analyze(&["dark.example"]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rating, QualityRating::Unreachable);
        assert_eq!(results[0].quality_score, 0);
        assert_eq!(results[0].attempts_sent, 4);
    }

    #[tokio::test]
    async fn test_deadline_marks_stalled_target() {
        let probe = MockProbe {
            stall_on: Some("stuck.example".to_string()),
            ..MockProbe::default()
        };
        let session = Session::new(
            probe,
            ProbeSettings {
                deadline: Some(Duration::from_millis(300)),
                ..settings()
            },
        );

        let started = std::time::Instant::now();
        let results = session.analyze(&["fine.example", "stuck.example"]).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 2);
        assert!(results[0].healthy);
        assert_eq!(results[1].target.host(), "stuck.example");
        assert_eq!(results[1].error.as_ref().map(|e| e.kind), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_dispatch() {
        let session = Session::new(MockProbe::default(), settings());

        let err = session
            .analyze_with(&["ok.example"], 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Validation(_)));

        let err = session.analyze(&["ok.example", ""]).await.unwrap_err();
        assert!(matches!(err, ProbeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_launch_failure_raises() {
        let session = Session::new(MissingTool, settings());
        let err = session.analyze(&["a.example", "b.example"]).await.unwrap_err();
        assert!(matches!(err, ProbeError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_resolve_uses_session_cache() {
        let session = Session::new(MockProbe::default(), settings());

        let first = session.resolve("127.0.0.1").await.unwrap();
        assert_eq!(session.cache().len(), 1);
        let second = session.resolve("127.0.0.1").await.unwrap();
        assert_eq!(first, second);

        assert!(session.cache().invalidate("127.0.0.1"));
        assert!(session.cache().is_empty());
    }

    #[tokio::test]
    async fn test_quick_check() {
        let session = Session::new(MockProbe::default(), settings());
        let check = session.quick_check("127.0.0.1").await.unwrap();

        assert_eq!(check.host, "127.0.0.1");
        assert!(check.latency.healthy);
        assert_eq!(
            check.resolution.map(|r| r.addresses),
            Some(vec!["127.0.0.1".parse().unwrap()])
        );
        assert!(check.resolution_error.is_none());
    }
}
