//! Configuration for netdiag.
//!
//! Loads probe defaults from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{validate_count, validate_timeout};
use crate::probe::default_trace_program;
use crate::scheduler::{DispatchOptions, DEFAULT_MAX_WORKERS, DEFAULT_TARGET_CEILING};

/// Probe defaults loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Per-probe timeout (default: 5s)
    pub timeout: Duration,
    /// Latency attempts per target (default: 4)
    pub count: u32,
    /// Worker ceiling for parallel probes (default: 8)
    pub max_workers: usize,
    /// Most targets in one run (default: 254)
    pub target_ceiling: usize,
    /// Budget for a whole multi-target run (default: none)
    pub deadline: Option<Duration>,
    /// Ping command line (default: "ping")
    pub ping_program: String,
    /// Route tracing command line (default: "traceroute", "tracert" on Windows)
    pub traceroute_program: String,
    /// How long resolved names stay cached (default: 300s)
    pub dns_cache_ttl: Duration,
    /// Upper bound on the random delay before each probe starts (default: 0)
    pub stagger: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            count: 4,
            max_workers: DEFAULT_MAX_WORKERS,
            target_ceiling: DEFAULT_TARGET_CEILING,
            deadline: None,
            ping_program: "ping".to_string(),
            traceroute_program: default_trace_program().to_string(),
            dns_cache_ttl: Duration::from_secs(300),
            stagger: Duration::ZERO,
        }
    }
}

impl ProbeSettings {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETDIAG_TIMEOUT_SECS`: per-probe timeout in seconds (default: 5)
    /// - `NETDIAG_COUNT`: latency attempts per target (default: 4)
    /// - `NETDIAG_MAX_WORKERS`: parallel probe limit (default: 8)
    /// - `NETDIAG_TARGET_CEILING`: most targets per run (default: 254)
    /// - `NETDIAG_DEADLINE_SECS`: overall run deadline in seconds (default: unset)
    /// - `NETDIAG_PING_PROGRAM`: ping command line (default: "ping")
    /// - `NETDIAG_TRACEROUTE_PROGRAM`: trace command line
    /// - `NETDIAG_DNS_CACHE_TTL_SECS`: resolver cache TTL (default: 300)
    /// - `NETDIAG_STAGGER_MS`: random start delay ceiling (default: 0)
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(secs) = parse_var::<f64>(&lookup, "NETDIAG_TIMEOUT_SECS") {
            match Duration::try_from_secs_f64(secs).map(validate_timeout) {
                Ok(Ok(timeout)) => cfg.timeout = timeout,
                Ok(Err(e)) => tracing::warn!("Ignoring NETDIAG_TIMEOUT_SECS={}: {}", secs, e),
                Err(e) => tracing::warn!("Ignoring NETDIAG_TIMEOUT_SECS={}: {}", secs, e),
            }
        }

        if let Some(count) = parse_var(&lookup, "NETDIAG_COUNT") {
            match validate_count(count) {
                Ok(count) => cfg.count = count,
                Err(e) => tracing::warn!("Ignoring NETDIAG_COUNT={}: {}", count, e),
            }
        }

        if let Some(workers) = parse_var::<usize>(&lookup, "NETDIAG_MAX_WORKERS") {
            if workers > 0 {
                cfg.max_workers = workers;
            } else {
                tracing::warn!("Ignoring NETDIAG_MAX_WORKERS=0");
            }
        }

        if let Some(ceiling) = parse_var(&lookup, "NETDIAG_TARGET_CEILING") {
            cfg.target_ceiling = ceiling;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "NETDIAG_DEADLINE_SECS") {
            cfg.deadline = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(program) = lookup("NETDIAG_PING_PROGRAM").filter(|p| !p.trim().is_empty()) {
            cfg.ping_program = program;
        }

        if let Some(program) =
            lookup("NETDIAG_TRACEROUTE_PROGRAM").filter(|p| !p.trim().is_empty())
        {
            cfg.traceroute_program = program;
        }

        if let Some(secs) = parse_var(&lookup, "NETDIAG_DNS_CACHE_TTL_SECS") {
            cfg.dns_cache_ttl = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var(&lookup, "NETDIAG_STAGGER_MS") {
            cfg.stagger = Duration::from_millis(ms);
        }

        cfg
    }

    /// Dispatcher limits for a run whose probes each need `probe_budget`.
    pub fn dispatch_options(&self, probe_budget: Duration) -> DispatchOptions {
        let options = DispatchOptions::new(self.max_workers, probe_budget)
            .with_ceiling(self.target_ceiling)
            .with_stagger(self.stagger);
        match self.deadline {
            Some(deadline) => options.with_deadline(deadline),
            None => options,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ProbeSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProbeSettings::load_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ProbeSettings::default();
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.count, 4);
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.target_ceiling, 254);
        assert_eq!(cfg.deadline, None);
        assert_eq!(cfg.ping_program, "ping");
    }

    #[test]
    fn test_overrides() {
        let cfg = load(&[
            ("NETDIAG_TIMEOUT_SECS", "1.5"),
            ("NETDIAG_COUNT", "10"),
            ("NETDIAG_MAX_WORKERS", "3"),
            ("NETDIAG_DEADLINE_SECS", "60"),
            ("NETDIAG_PING_PROGRAM", "ip netns exec lab ping"),
        ]);
        assert_eq!(cfg.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.count, 10);
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.deadline, Some(Duration::from_secs(60)));
        assert_eq!(cfg.ping_program, "ip netns exec lab ping");
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let cfg = load(&[
            ("NETDIAG_TIMEOUT_SECS", "-2"),
            ("NETDIAG_COUNT", "four"),
            ("NETDIAG_MAX_WORKERS", "0"),
            ("NETDIAG_PING_PROGRAM", "  "),
        ]);
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.count, 4);
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.ping_program, "ping");
    }

    #[test]
    fn test_out_of_range_values_keep_defaults() {
        for (count, timeout) in [("0", "0"), ("500", "1000"), ("101", "300.5")] {
            let cfg = load(&[("NETDIAG_COUNT", count), ("NETDIAG_TIMEOUT_SECS", timeout)]);
            assert_eq!(cfg.count, 4);
            assert_eq!(cfg.timeout, Duration::from_secs(5));
        }

        let cfg = load(&[("NETDIAG_COUNT", "100"), ("NETDIAG_TIMEOUT_SECS", "300")]);
        assert_eq!(cfg.count, 100);
        assert_eq!(cfg.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_dispatch_options() {
        let cfg = load(&[("NETDIAG_DEADLINE_SECS", "30"), ("NETDIAG_TARGET_CEILING", "16")]);
        let options = cfg.dispatch_options(Duration::from_secs(7));
        assert_eq!(options.timeout, Duration::from_secs(7));
        assert_eq!(options.ceiling, 16);
        assert_eq!(options.deadline, Some(Duration::from_secs(30)));
    }
}
