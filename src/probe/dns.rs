//! Forward name resolution through the system resolver.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::ProbeError;
use crate::model::{validate_host, validate_timeout, ProbeFailure};
use crate::scheduler::{dispatch, DispatchOptions};

/// Default budget for a single lookup.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Every address a name resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub name: String,
    /// All addresses, deduplicated and sorted (IPv4 before IPv6).
    pub addresses: Vec<IpAddr>,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub elapsed_ms: f64,
}

impl Resolution {
    fn new(name: String, mut addresses: Vec<IpAddr>, elapsed: Duration) -> Self {
        addresses.sort();
        addresses.dedup();

        let ipv4 = addresses
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        let ipv6 = addresses
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            })
            .collect();

        Self {
            name,
            addresses,
            ipv4,
            ipv6,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }

    pub fn first(&self) -> Option<IpAddr> {
        self.addresses.first().copied()
    }
}

/// Resolve `name` to all of its addresses.
///
/// The name is validated before any lookup is made. A literal address
/// resolves to itself. Lookup failures and timeouts come back as
/// `ProbeError::Failed` with a resolution-failed kind.
pub async fn resolve(name: &str, timeout: Duration) -> Result<Resolution, ProbeError> {
    let name = validate_host(name)?;
    validate_timeout(timeout)?;
    Ok(lookup(name, timeout).await?)
}

/// Resolve many names in parallel.
///
/// Every name is validated up front. The map has one entry per distinct
/// name, and a failed lookup never affects the others.
pub async fn resolve_bulk<S: AsRef<str>>(
    names: &[S],
    max_workers: usize,
    timeout: Duration,
) -> Result<HashMap<String, Result<Resolution, ProbeFailure>>, ProbeError> {
    validate_timeout(timeout)?;
    let names = names
        .iter()
        .map(|name| validate_host(name.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    // The lookup enforces its own timeout; the dispatcher's is a backstop.
    let options = DispatchOptions::new(max_workers, timeout + Duration::from_secs(1));
    let results = dispatch(names, move |name| lookup(name, timeout), &options).await?;
    Ok(results)
}

/// Lookup of an already validated name.
pub(crate) async fn lookup(name: String, timeout: Duration) -> Result<Resolution, ProbeFailure> {
    let started = Instant::now();

    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(Resolution::new(name, vec![ip], started.elapsed()));
    }

    let addrs = match tokio::time::timeout(timeout, tokio::net::lookup_host((name.as_str(), 0))).await {
        Ok(Ok(addrs)) => addrs.map(|sa| sa.ip()).collect::<Vec<_>>(),
        Ok(Err(e)) => {
            tracing::debug!("DNS lookup for {} failed: {}", name, e);
            return Err(ProbeFailure::resolution_failed(format!("{}: {}", name, e)));
        }
        Err(_) => {
            return Err(ProbeFailure::resolution_failed(format!(
                "lookup of {} timed out after {:?}",
                name, timeout
            )));
        }
    };

    if addrs.is_empty() {
        return Err(ProbeFailure::resolution_failed(format!(
            "no addresses found for {}",
            name
        )));
    }

    let resolution = Resolution::new(name, addrs, started.elapsed());
    tracing::debug!(
        "DNS lookup for {}: {} addresses in {:.1}ms",
        resolution.name,
        resolution.addresses.len(),
        resolution.elapsed_ms
    );
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureKind, ValidationError};

    #[tokio::test]
    async fn test_empty_name_rejected_before_lookup() {
        let err = resolve("", DEFAULT_RESOLVE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProbeError::Validation(ValidationError::EmptyHost)));

        let err = resolve("bad name!", DEFAULT_RESOLVE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProbeError::Validation(ValidationError::InvalidHost(_))));
    }

    #[tokio::test]
    async fn test_literal_address_resolves_to_itself() {
        let res = resolve("192.0.2.7", DEFAULT_RESOLVE_TIMEOUT).await.unwrap();
        assert_eq!(res.addresses, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(res.ipv4.len(), 1);
        assert!(res.ipv6.is_empty());
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let res = resolve("localhost", DEFAULT_RESOLVE_TIMEOUT).await.unwrap();
        assert!(res.addresses.iter().all(|ip| ip.is_loopback()));
        assert!(!res.addresses.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_name_is_resolution_failure() {
        // .invalid is reserved and never resolves.
        let err = resolve("no-such-host.invalid", DEFAULT_RESOLVE_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            ProbeError::Failed(f) => assert_eq!(f.kind, FailureKind::ResolutionFailed),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolution_dedups_and_splits() {
        let addrs: Vec<IpAddr> = ["::1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let res = Resolution::new("multi".to_string(), addrs, Duration::ZERO);

        assert_eq!(res.addresses.len(), 3);
        assert_eq!(res.first(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(res.ipv4.len(), 2);
        assert_eq!(res.ipv6.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_keeps_failures_separate() {
        let results = resolve_bulk(&["127.0.0.1", "no-such-host.invalid", "::1"], 2, DEFAULT_RESOLVE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results["127.0.0.1"].is_ok());
        assert!(results["::1"].is_ok());
        assert!(results["no-such-host.invalid"].is_err());
    }

    #[tokio::test]
    async fn test_bulk_rejects_any_invalid_name() {
        let err = resolve_bulk(&["127.0.0.1", ""], 2, DEFAULT_RESOLVE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Validation(_)));
    }
}
