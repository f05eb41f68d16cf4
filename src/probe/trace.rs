//! Route tracing through the system traceroute/tracert tool.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

use super::parse::below_bound_ms;
use super::{PingDialect, ProbeError};
use crate::model::{validate_hops, validate_timeout, ProbeFailure, ProbeTarget};

pub const DEFAULT_MAX_HOPS: u8 = 30;

/// Extra time allowed for the whole trace on top of the per-hop budget.
const TRACE_GRACE: Duration = Duration::from_secs(30);

/// One line of a trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceHop {
    pub number: u32,
    pub address: Option<IpAddr>,
    pub hostname: Option<String>,
    pub rtts_ms: Vec<f64>,
    /// No probe to this hop was answered.
    pub timed_out: bool,
}

impl TraceHop {
    pub fn avg_ms(&self) -> Option<f64> {
        if self.rtts_ms.is_empty() {
            return None;
        }
        Some(self.rtts_ms.iter().sum::<f64>() / self.rtts_ms.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceResult {
    pub host: String,
    /// Address the tool resolved the destination to, when it printed one.
    pub destination: Option<IpAddr>,
    pub hops: Vec<TraceHop>,
    pub destination_reached: bool,
}

fn hop_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?P<num>\d+)\s+(?P<rest>.*)$").unwrap())
}

fn rtt_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?P<lt><)?\s*(?P<ms>\d+(?:\.\d+)?)\s*ms\b").unwrap())
}

/// `name (addr)` on POSIX, `name [addr]` on Windows.
fn named_address() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<name>[^\s\(\)\[\]]+)\s+[\(\[](?P<addr>[0-9A-Fa-f:.]+)[\)\]]").unwrap()
    })
}

fn header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:traceroute to|tracing route to)\s+\S+\s+[\(\[](?P<addr>[0-9A-Fa-f:.]+)[\)\]]")
            .unwrap()
    })
}

/// Parse traceroute or tracert output into hops.
///
/// Lines that do not start with a hop number are ignored. Sub-millisecond
/// Windows times (`<1 ms`) are read as 0.5 ms.
pub fn parse_traceroute_output(output: &str, host: &str) -> TraceResult {
    let destination = header()
        .captures(output)
        .and_then(|c| c["addr"].parse::<IpAddr>().ok())
        .or_else(|| host.parse::<IpAddr>().ok());

    let mut hops = Vec::new();
    for line in output.lines() {
        let Some(caps) = hop_line().captures(line) else {
            continue;
        };
        let Ok(number) = caps["num"].parse::<u32>() else {
            continue;
        };
        hops.push(parse_hop(number, &caps["rest"]));
    }

    let destination_reached = hops
        .iter()
        .rev()
        .find(|hop| !hop.timed_out)
        .map(|hop| {
            let by_address = destination.is_some() && hop.address == destination;
            let by_name = hop.hostname.as_deref() == Some(host);
            by_address || by_name
        })
        .unwrap_or(false);

    TraceResult {
        host: host.to_string(),
        destination,
        hops,
        destination_reached,
    }
}

fn parse_hop(number: u32, rest: &str) -> TraceHop {
    let rtts_ms: Vec<f64> = rtt_token()
        .captures_iter(rest)
        .filter_map(|c| {
            let ms: f64 = c["ms"].parse().ok()?;
            Some(if c.name("lt").is_some() { below_bound_ms(ms) } else { ms })
        })
        .collect();

    let (address, hostname) = match named_address().captures(rest) {
        Some(c) => {
            let address = c["addr"].parse::<IpAddr>().ok();
            let name = &c["name"];
            let hostname = match (address, name.parse::<IpAddr>()) {
                (_, Ok(_)) => None,
                _ => Some(name.to_string()),
            };
            (address, hostname)
        }
        None => (
            rest.split_whitespace()
                .find_map(|token| token.trim_end_matches(['.', ',']).parse::<IpAddr>().ok()),
            None,
        ),
    };

    TraceHop {
        number,
        address,
        hostname,
        timed_out: rtts_ms.is_empty(),
        rtts_ms,
    }
}

/// Runs the system route tracing command.
#[derive(Debug, Clone)]
pub struct TraceCommand {
    program: String,
    leading_args: Vec<String>,
    dialect: PingDialect,
}

impl Default for TraceCommand {
    fn default() -> Self {
        Self::from_command_line(default_trace_program())
    }
}

pub fn default_trace_program() -> &'static str {
    if cfg!(windows) {
        "tracert"
    } else {
        "traceroute"
    }
}

impl TraceCommand {
    pub fn from_command_line(line: &str) -> Self {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .unwrap_or_else(|| default_trace_program().to_string());
        Self {
            program,
            leading_args: parts.collect(),
            dialect: PingDialect::native(),
        }
    }

    pub fn with_dialect(mut self, dialect: PingDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn args(&self, host: &str, max_hops: u8, timeout: Duration) -> Vec<String> {
        let mut args = self.leading_args.clone();
        match self.dialect {
            PingDialect::Windows => args.extend([
                "-h".to_string(),
                max_hops.to_string(),
                "-w".to_string(),
                timeout.as_millis().max(1).to_string(),
            ]),
            PingDialect::Posix => args.extend([
                "-m".to_string(),
                max_hops.to_string(),
                "-w".to_string(),
                timeout.as_secs().max(1).to_string(),
            ]),
        }
        args.push(host.to_string());
        args
    }

    /// Trace the route to `target`, waiting at most `timeout` per hop.
    pub async fn trace(
        &self,
        target: &ProbeTarget,
        max_hops: u8,
        timeout: Duration,
    ) -> Result<TraceResult, ProbeError> {
        validate_hops(max_hops)?;
        validate_timeout(timeout)?;

        let budget = timeout.saturating_mul(u32::from(max_hops)) + TRACE_GRACE;
        tracing::info!("Tracing route to {} (max {} hops)", target.host(), max_hops);

        let child = Command::new(&self.program)
            .args(self.args(target.host(), max_hops, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProbeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProbeFailure::unreachable(format!(
                    "failed to read {} output: {}",
                    self.program, e
                ))
                .into())
            }
            Err(_) => {
                tracing::warn!("Trace to {} exceeded {:?}, process terminated", target, budget);
                return Err(ProbeFailure::timeout(budget).into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = parse_traceroute_output(&stdout, target.host());
        if result.hops.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                "Trace to {} produced no hops (exit {:?}): {}",
                target,
                output.status.code(),
                stderr.trim()
            );
        }
        Ok(result)
    }
}

/// Trace the route to `target` with the platform's default tool.
pub async fn trace_route(
    target: &ProbeTarget,
    max_hops: u8,
    timeout: Duration,
) -> Result<TraceResult, ProbeError> {
    TraceCommand::default().trace(target, max_hops, timeout).await
}
