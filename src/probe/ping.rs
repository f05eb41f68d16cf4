//! Latency probe backed by the platform ping tool.
//!
//! One tool invocation produces the whole sample set for a target: the tool
//! itself sends its echo requests strictly in sequence. The child process is
//! owned for the duration of the call and killed if it outlives its budget
//! or the call is dropped.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::{parse_ping_output, LatencyProbe, PingDialect, ProbeError, PROCESS_GRACE};
use crate::model::{
    validate_count, validate_timeout, ProbeAttempt, ProbeFailure, ProbeTarget, SampleSet,
};

/// Phrases ping tools print when the name itself could not be resolved.
const RESOLUTION_ERRORS: &[&str] = &[
    "unknown host",
    "Name or service not known",
    "Temporary failure in name resolution",
    "cannot resolve",
    "could not find host",
    "No address associated with hostname",
];

/// Runs the system ping command.
#[derive(Debug, Clone)]
pub struct PingCommand {
    program: String,
    leading_args: Vec<String>,
    dialect: PingDialect,
}

impl Default for PingCommand {
    fn default() -> Self {
        Self::new("ping")
    }
}

impl PingCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            dialect: PingDialect::native(),
        }
    }

    /// Build from a command line such as `"ping"` or `"ip netns exec lab ping"`.
    pub fn from_command_line(line: &str) -> Self {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "ping".to_string());
        Self::new(program).with_leading_args(parts)
    }

    /// Arguments placed before the generated count/timeout/host arguments.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dialect(mut self, dialect: PingDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for one run.
    pub fn args(&self, host: &str, count: u32, timeout: Duration) -> Vec<String> {
        let mut args = self.leading_args.clone();
        match self.dialect {
            PingDialect::Windows => {
                let timeout_ms = timeout.as_millis().max(1);
                args.extend([
                    "-n".to_string(),
                    count.to_string(),
                    "-w".to_string(),
                    timeout_ms.to_string(),
                ]);
            }
            PingDialect::Posix => {
                // BSD-derived ping takes -W in milliseconds, iputils in seconds.
                let wait = if cfg!(target_os = "macos") {
                    timeout.as_millis().max(1)
                } else {
                    u128::from(timeout.as_secs().max(1))
                };
                args.extend([
                    "-c".to_string(),
                    count.to_string(),
                    "-W".to_string(),
                    wait.to_string(),
                ]);
            }
        }
        args.push(host.to_string());
        args
    }
}

impl LatencyProbe for PingCommand {
    async fn sample(
        &self,
        target: &ProbeTarget,
        count: u32,
        timeout: Duration,
    ) -> Result<SampleSet, ProbeError> {
        validate_count(count)?;
        validate_timeout(timeout)?;

        let budget = self.budget(count, timeout);
        let attempt = ProbeAttempt::start(target, 0);

        let child = Command::new(&self.program)
            .args(self.args(target.host(), count, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProbeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!("Ping probe: reading output for {} failed: {}", target, e);
                return Ok(SampleSet::total_loss(
                    target.clone(),
                    count,
                    ProbeFailure::unreachable(format!("failed to read ping output: {}", e)),
                ));
            }
            Err(_) => {
                tracing::warn!(
                    "Ping probe: {} exceeded {:?}, process terminated",
                    target,
                    budget
                );
                return Ok(SampleSet::total_loss(
                    target.clone(),
                    count,
                    ProbeFailure::timeout(budget),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(phrase) = RESOLUTION_ERRORS
            .iter()
            .find(|p| stdout.contains(**p) || stderr.contains(**p))
        {
            tracing::debug!(host = %target, "ping could not resolve host ({})", phrase);
            return Ok(SampleSet::total_loss(
                target.clone(),
                count,
                ProbeFailure::resolution_failed(format!("{}: {}", target.host(), phrase)),
            ));
        }

        let parsed = parse_ping_output(&stdout, target.host(), count);
        if parsed.fallback {
            tracing::warn!(
                "Ping probe: unrecognized output for {}, counting as total loss (exit {:?}): {}",
                target,
                output.status.code(),
                stderr.trim()
            );
        }

        tracing::debug!(
            host = %target,
            sent = parsed.sent,
            received = parsed.received,
            elapsed_ms = attempt.elapsed().as_millis() as u64,
            "ping finished"
        );

        Ok(SampleSet::from_counts(
            target.clone(),
            parsed.sent,
            parsed.received,
            &parsed.samples,
        ))
    }

    /// Ping waits at least a second per reply and paces requests a second apart.
    fn budget(&self, count: u32, timeout: Duration) -> Duration {
        timeout.max(Duration::from_secs(1)).saturating_mul(count) + PROCESS_GRACE
    }
}
