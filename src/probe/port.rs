//! TCP port probes.
//!
//! A connect attempt is made on a blocking socket with an explicit connect
//! timeout inside `spawn_blocking`. The socket is dropped on every path, so
//! nothing stays open once an attempt has an outcome.

use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};

use super::{LatencyProbe, ProbeError};
use crate::model::{
    validate_count, validate_timeout, FailureKind, ProbeAttempt, ProbeFailure, ProbeOutcome,
    ProbeTarget, SampleSet,
};
use crate::scheduler::{dispatch, DispatchOptions};

/// Slack the dispatcher allows on top of a connect timeout for name lookup.
const DISPATCH_SLACK: Duration = Duration::from_secs(1);

/// Well-known TCP services, also the port list for `scan_common_ports`.
pub const COMMON_PORTS: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MSSQL"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
    (6379, "Redis"),
    (8080, "HTTP-Alt"),
    (8443, "HTTPS-Alt"),
    (27017, "MongoDB"),
];

pub fn service_name(port: u16) -> Option<&'static str> {
    COMMON_PORTS
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
}

/// How a port answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    /// Actively refused or reset.
    Closed,
    /// Anything else: no answer, unreachable, or the name did not resolve.
    Filtered,
}

impl From<&ProbeOutcome> for PortState {
    fn from(outcome: &ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Success { .. } => PortState::Open,
            ProbeOutcome::Failure(f) if f.kind == FailureKind::Refused => PortState::Closed,
            ProbeOutcome::Failure(_) => PortState::Filtered,
        }
    }
}

/// Result of one port probe.
#[derive(Debug, Clone, Serialize)]
pub struct PortOutcome {
    pub target: ProbeTarget,
    pub state: PortState,
    pub outcome: ProbeOutcome,
    pub checked_at: DateTime<Utc>,
}

impl PortOutcome {
    pub fn new(target: ProbeTarget, outcome: ProbeOutcome) -> Self {
        Self {
            state: PortState::from(&outcome),
            target,
            outcome,
            checked_at: Utc::now(),
        }
    }

    pub fn port(&self) -> u16 {
        self.target.port().unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

/// Summary of a scan over many ports of one host.
#[derive(Debug, Clone, Serialize)]
pub struct PortReport {
    pub host: String,
    pub open: Vec<u16>,
    pub closed: Vec<u16>,
    pub filtered: Vec<u16>,
    /// Known service names for the open ports.
    pub services: BTreeMap<u16, &'static str>,
    pub scanned: usize,
    pub duration_ms: f64,
    pub scanned_at: DateTime<Utc>,
}

impl PortReport {
    fn from_outcomes(host: &str, outcomes: &[PortOutcome], elapsed: Duration) -> Self {
        let mut report = Self {
            host: host.to_string(),
            open: Vec::new(),
            closed: Vec::new(),
            filtered: Vec::new(),
            services: BTreeMap::new(),
            scanned: outcomes.len(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            scanned_at: Utc::now(),
        };

        for outcome in outcomes {
            let port = outcome.port();
            match outcome.state {
                PortState::Open => {
                    report.open.push(port);
                    if let Some(name) = service_name(port) {
                        report.services.insert(port, name);
                    }
                }
                PortState::Closed => report.closed.push(port),
                PortState::Filtered => report.filtered.push(port),
            }
        }

        report.open.sort_unstable();
        report.closed.sort_unstable();
        report.filtered.sort_unstable();
        report
    }

    /// Whether any port got an answer, open or refused. A host that never
    /// answered (unresolvable, down, or fully filtered) did not.
    pub fn host_answered(&self) -> bool {
        !self.open.is_empty() || !self.closed.is_empty()
    }
}

/// Probe a single port on `target`'s host.
///
/// Only bad input is an `Err`; every network result is a `PortOutcome`.
pub async fn probe_port(
    target: &ProbeTarget,
    port: u16,
    timeout: Duration,
) -> Result<PortOutcome, ProbeError> {
    validate_timeout(timeout)?;
    let target = target.at_port(port)?;
    let outcome = check_port(&target, timeout).await;
    Ok(PortOutcome::new(target, outcome))
}

/// Probe several ports of one host in parallel. Results are sorted by port.
pub async fn probe_ports(
    target: &ProbeTarget,
    ports: &[u16],
    timeout: Duration,
    max_workers: usize,
) -> Result<Vec<PortOutcome>, ProbeError> {
    validate_timeout(timeout)?;
    let targets = ports
        .iter()
        .map(|&port| target.at_port(port))
        .collect::<Result<Vec<_>, _>>()?;

    let options = DispatchOptions::new(max_workers, timeout + DISPATCH_SLACK)
        .with_ceiling(crate::model::MAX_PORT_SPAN);

    let results = dispatch(
        targets,
        move |target: ProbeTarget| async move {
            let outcome = check_port(&target, timeout).await;
            Ok::<_, ProbeFailure>(PortOutcome::new(target, outcome))
        },
        &options,
    )
    .await?;

    let mut outcomes: Vec<PortOutcome> = results
        .into_iter()
        .map(|(target, result)| {
            result.unwrap_or_else(|failure| PortOutcome::new(target, ProbeOutcome::Failure(failure)))
        })
        .collect();
    outcomes.sort_by_key(PortOutcome::port);
    Ok(outcomes)
}

/// Scan `ports` and fold the outcomes into open/closed/filtered lists.
pub async fn scan_ports(
    target: &ProbeTarget,
    ports: &[u16],
    timeout: Duration,
    max_workers: usize,
) -> Result<PortReport, ProbeError> {
    let started = Instant::now();
    tracing::info!("Port scan: {} ports on {}", ports.len(), target.host());

    let outcomes = probe_ports(target, ports, timeout, max_workers).await?;
    let report = PortReport::from_outcomes(target.host(), &outcomes, started.elapsed());

    tracing::info!(
        "Port scan: {} finished, {} open, {} closed, {} filtered",
        target.host(),
        report.open.len(),
        report.closed.len(),
        report.filtered.len()
    );
    Ok(report)
}

/// Scan the well-known service ports.
pub async fn scan_common_ports(
    target: &ProbeTarget,
    timeout: Duration,
    max_workers: usize,
) -> Result<PortReport, ProbeError> {
    let ports: Vec<u16> = COMMON_PORTS.iter().map(|(port, _)| *port).collect();
    scan_ports(target, &ports, timeout, max_workers).await
}

/// Resolve the first socket address for `target`, which must carry a port.
async fn socket_addr(target: &ProbeTarget, timeout: Duration) -> Result<SocketAddr, ProbeFailure> {
    let port = target
        .port()
        .ok_or_else(|| ProbeFailure::new(FailureKind::InvalidInput, "target has no port"))?;

    if let Some(ip) = target.ip() {
        return Ok(SocketAddr::new(ip, port));
    }

    let lookup = tokio::net::lookup_host((target.host(), port));
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(mut addrs)) => addrs.next().ok_or_else(|| {
            ProbeFailure::resolution_failed(format!("no addresses found for {}", target.host()))
        }),
        Ok(Err(e)) => Err(ProbeFailure::resolution_failed(format!(
            "{}: {}",
            target.host(),
            e
        ))),
        Err(_) => Err(ProbeFailure::resolution_failed(format!(
            "lookup of {} timed out",
            target.host()
        ))),
    }
}

async fn check_port(target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
    match socket_addr(target, timeout).await {
        Ok(addr) => connect(addr, timeout).await,
        Err(failure) => ProbeOutcome::Failure(failure),
    }
}

/// One timed TCP connect.
async fn connect(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    match tokio::task::spawn_blocking(move || blocking_connect(addr, timeout)).await {
        Ok(Ok(rtt)) => ProbeOutcome::success(rtt),
        Ok(Err(e)) => ProbeOutcome::Failure(classify_connect_error(&e, addr, timeout)),
        Err(e) => ProbeOutcome::Failure(ProbeFailure::unreachable(format!(
            "connect task failed: {}",
            e
        ))),
    }
}

fn blocking_connect(addr: SocketAddr, timeout: Duration) -> io::Result<Duration> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    let start = Instant::now();
    socket.connect_timeout(&addr.into(), timeout)?;
    let elapsed = start.elapsed();

    let _ = socket.shutdown(Shutdown::Both);
    Ok(elapsed)
}

fn classify_connect_error(e: &io::Error, addr: SocketAddr, timeout: Duration) -> ProbeFailure {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            ProbeFailure::refused(format!("{} refused the connection", addr))
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeFailure::timeout(timeout),
        _ => ProbeFailure::unreachable(format!("{}: {}", addr, e)),
    }
}

/// Latency measured as the time to complete a TCP handshake.
///
/// Useful where ICMP is filtered or the ping tool is unavailable. Attempts
/// run strictly one after another against the same resolved address.
#[derive(Debug, Clone)]
pub struct TcpConnectLatency {
    port: u16,
    interval: Duration,
}

impl TcpConnectLatency {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            interval: Duration::ZERO,
        }
    }

    /// Pause between consecutive attempts.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl LatencyProbe for TcpConnectLatency {
    async fn sample(
        &self,
        target: &ProbeTarget,
        count: u32,
        timeout: Duration,
    ) -> Result<SampleSet, ProbeError> {
        validate_count(count)?;
        validate_timeout(timeout)?;
        let target = match target.port() {
            Some(_) => target.clone(),
            None => target.at_port(self.port)?,
        };

        let addr = match socket_addr(&target, timeout).await {
            Ok(addr) => addr,
            Err(failure) => return Ok(SampleSet::total_loss(target, count, failure)),
        };

        let mut outcomes = Vec::with_capacity(count as usize);
        for sequence in 0..count {
            if sequence > 0 && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            let attempt = ProbeAttempt::start(&target, sequence);
            let outcome = match connect(addr, timeout).await {
                ProbeOutcome::Success { .. } => attempt.succeed(),
                ProbeOutcome::Failure(failure) => attempt.fail(failure),
            };
            outcomes.push(outcome);
        }

        Ok(SampleSet::from_outcomes(target, outcomes))
    }

    fn budget(&self, count: u32, timeout: Duration) -> Duration {
        // One lookup plus `count` connects and the gaps between them.
        timeout.saturating_mul(count + 1) + self.interval.saturating_mul(count)
    }
}
