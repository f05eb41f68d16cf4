//! Probe targets and up-front input validation.
//!
//! Everything here runs before a single packet leaves the host: a target that
//! fails validation never reaches an executor.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Longest host name accepted (RFC 1035 presentation form).
pub const MAX_HOST_LEN: usize = 253;
/// Upper bound on latency attempts per target.
pub const MAX_COUNT: u32 = 100;
/// Upper bound on any single probe timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);
/// Widest port range a single scan may cover.
pub const MAX_PORT_SPAN: usize = 10_000;
/// Most hops a route trace may walk.
pub const MAX_HOPS: u8 = 64;

/// Input rejected before any probe executes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("host is {0} characters long (max 253)")]
    HostTooLong(usize),
    #[error("invalid host format: {0}")]
    InvalidHost(String),
    #[error("port {0} is outside 1-65535")]
    InvalidPort(u16),
    #[error("port range {start}-{end} is invalid: {reason}")]
    InvalidPortRange {
        start: u16,
        end: u16,
        reason: &'static str,
    },
    #[error("attempt count {0} is outside 1-100")]
    InvalidCount(u32),
    #[error("timeout {0:?} must be positive and at most 300s")]
    InvalidTimeout(Duration),
    #[error("worker limit must be positive")]
    InvalidWorkerLimit,
    #[error("no targets given")]
    NoTargets,
    #[error("{count} targets exceed the ceiling of {ceiling}")]
    TooManyTargets { count: usize, ceiling: usize },
    #[error("invalid subnet {0}")]
    InvalidSubnet(String),
    #[error("hop limit {0} is outside 1-64")]
    InvalidHopLimit(u8),
}

/// Where a probe is directed: a host and, for port probes, a port.
///
/// Constructed only through the validating constructors, so a `ProbeTarget`
/// in hand always has a well-formed host and an in-range port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProbeTarget {
    host: String,
    port: Option<u16>,
}

impl ProbeTarget {
    /// Target a host with no port (latency and resolution probes).
    pub fn new(host: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            host: validate_host(host)?,
            port: None,
        })
    }

    /// Target a host:port pair (port probes).
    pub fn with_port(host: &str, port: u16) -> Result<Self, ValidationError> {
        Ok(Self {
            host: validate_host(host)?,
            port: Some(validate_port(port)?),
        })
    }

    /// The same host aimed at a different port.
    pub fn at_port(&self, port: u16) -> Result<Self, ValidationError> {
        Ok(Self {
            host: self.host.clone(),
            port: Some(validate_port(port)?),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The host parsed as a literal address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.ip()) {
            (Some(port), Some(IpAddr::V6(_))) => write!(f, "[{}]:{}", self.host, port),
            (Some(port), _) => write!(f, "{}:{}", self.host, port),
            (None, _) => f.write_str(&self.host),
        }
    }
}

/// Validate a host name or literal address and return it trimmed.
pub fn validate_host(host: &str) -> Result<String, ValidationError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ValidationError::EmptyHost);
    }
    if host.len() > MAX_HOST_LEN {
        return Err(ValidationError::HostTooLong(host.len()));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }

    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    let re = HOSTNAME.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .unwrap()
    });

    if !re.is_match(host) {
        return Err(ValidationError::InvalidHost(host.to_string()));
    }
    Ok(host.to_string())
}

pub fn validate_port(port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        return Err(ValidationError::InvalidPort(port));
    }
    Ok(port)
}

pub fn validate_count(count: u32) -> Result<u32, ValidationError> {
    if count == 0 || count > MAX_COUNT {
        return Err(ValidationError::InvalidCount(count));
    }
    Ok(count)
}

pub fn validate_timeout(timeout: Duration) -> Result<Duration, ValidationError> {
    if timeout.is_zero() || timeout > MAX_TIMEOUT {
        return Err(ValidationError::InvalidTimeout(timeout));
    }
    Ok(timeout)
}

pub fn validate_hops(max_hops: u8) -> Result<u8, ValidationError> {
    if max_hops == 0 || max_hops > MAX_HOPS {
        return Err(ValidationError::InvalidHopLimit(max_hops));
    }
    Ok(max_hops)
}

/// Expand an inclusive port range, rejecting inverted or oversized ranges.
pub fn port_range(start: u16, end: u16) -> Result<Vec<u16>, ValidationError> {
    validate_port(start)?;
    validate_port(end)?;
    if start > end {
        return Err(ValidationError::InvalidPortRange {
            start,
            end,
            reason: "start is greater than end",
        });
    }
    if usize::from(end - start) >= MAX_PORT_SPAN {
        return Err(ValidationError::InvalidPortRange {
            start,
            end,
            reason: "range is wider than 10000 ports",
        });
    }
    Ok((start..=end).collect())
}

/// Expand an IPv4 network into host targets for a sweep.
///
/// Only prefixes 24..=32 are accepted so a sweep never exceeds 254 hosts.
/// Network and broadcast addresses are skipped for /24 through /30.
pub fn subnet_targets(network: Ipv4Addr, prefix: u8) -> Result<Vec<ProbeTarget>, ValidationError> {
    if !(24..=32).contains(&prefix) {
        return Err(ValidationError::InvalidSubnet(format!("{}/{}", network, prefix)));
    }

    let mask: u32 = u32::MAX << (32 - u32::from(prefix));
    let base = u64::from(u32::from(network) & mask);
    let size: u64 = 1 << (32 - u64::from(prefix));

    let hosts = if prefix <= 30 {
        (base + 1)..(base + size - 1)
    } else {
        base..(base + size)
    };

    hosts
        .map(|raw| ProbeTarget::new(&Ipv4Addr::from(raw as u32).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_host() {
        assert_eq!(validate_host("  example.com ").unwrap(), "example.com");
        assert_eq!(validate_host("10.0.0.1").unwrap(), "10.0.0.1");
        assert_eq!(validate_host("::1").unwrap(), "::1");

        assert_eq!(validate_host(""), Err(ValidationError::EmptyHost));
        assert_eq!(validate_host("   "), Err(ValidationError::EmptyHost));
        assert!(matches!(validate_host("-bad.example"), Err(ValidationError::InvalidHost(_))));
        assert!(matches!(validate_host("bad..example"), Err(ValidationError::InvalidHost(_))));
        assert!(matches!(validate_host("under_score.com"), Err(ValidationError::InvalidHost(_))));

        let long = format!("{}.com", "a.".repeat(130));
        assert!(matches!(validate_host(&long), Err(ValidationError::HostTooLong(_))));
    }

    #[test]
    fn test_target_construction() {
        let target = ProbeTarget::with_port("example.com", 443).unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), Some(443));
        assert_eq!(target.to_string(), "example.com:443");

        let v6 = ProbeTarget::with_port("::1", 22).unwrap();
        assert_eq!(v6.to_string(), "[::1]:22");

        assert_eq!(
            ProbeTarget::with_port("example.com", 0),
            Err(ValidationError::InvalidPort(0))
        );
    }

    #[test]
    fn test_count_and_timeout_limits() {
        assert!(validate_count(0).is_err());
        assert!(validate_count(1).is_ok());
        assert!(validate_count(101).is_err());

        assert!(validate_timeout(Duration::ZERO).is_err());
        assert!(validate_timeout(Duration::from_secs(1)).is_ok());
        assert!(validate_timeout(Duration::from_secs(301)).is_err());

        assert!(validate_hops(0).is_err());
        assert_eq!(validate_hops(30), Ok(30));
        assert!(validate_hops(65).is_err());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(port_range(20, 25).unwrap(), vec![20, 21, 22, 23, 24, 25]);
        assert!(port_range(100, 10).is_err());
        assert!(port_range(1, 20_000).is_err());
        assert_eq!(port_range(1, 10_000).unwrap().len(), 10_000);
    }

    #[test]
    fn test_subnet_targets() {
        let hosts = subnet_targets(Ipv4Addr::new(192, 168, 1, 77), 24).unwrap();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0].host(), "192.168.1.1");
        assert_eq!(hosts[253].host(), "192.168.1.254");

        let pair = subnet_targets(Ipv4Addr::new(10, 0, 0, 4), 31).unwrap();
        assert_eq!(pair.len(), 2);

        assert!(subnet_targets(Ipv4Addr::new(10, 0, 0, 0), 16).is_err());
    }
}
