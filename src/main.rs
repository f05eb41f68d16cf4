//! netdiag - network diagnostics from the command line.

use std::collections::BTreeMap;
use std::process::ExitCode;

use netdiag::config::ProbeSettings;
use netdiag::model::{port_range, ValidationError};
use netdiag::probe::{local_network, resolve_bulk, ProbeError, COMMON_PORTS, DEFAULT_MAX_HOPS};
use netdiag::scheduler::Session;

use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: netdiag [ping] <host>... | check <host> | resolve <name>... | scan <host> [start-end] | trace <host> | local";
const COMMANDS: &[&str] = &["ping", "check", "resolve", "scan", "trace", "local"];

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    // Logs go to stderr so stdout stays parseable JSON.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netdiag=info".parse()?))
        .init();

    let settings = ProbeSettings::load();
    tracing::debug!("Loaded settings: {:?}", settings);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let session = Session::from_settings(settings);

    match run(&session, &args).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::from(1)),
        Err(ProbeError::Validation(e)) => {
            eprintln!("netdiag: {}\n{}", e, USAGE);
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            tracing::error!("{}", e);
            Ok(ExitCode::from(1))
        }
    }
}

/// Run one command. `Ok(false)` means it ran but some target failed.
async fn run(session: &Session, args: &[String]) -> Result<bool, ProbeError> {
    let (command, rest) = match args.split_first() {
        Some((first, rest)) if COMMANDS.contains(&first.as_str()) => (first.as_str(), rest),
        _ => ("ping", args),
    };
    if command == "local" {
        let network = local_network().await?;
        print_json(&network);
        return Ok(!network.active.is_empty());
    }
    let Some(host) = rest.first() else {
        return Err(ValidationError::NoTargets.into());
    };

    match command {
        "check" => {
            let check = session.quick_check(host).await?;
            print_json(&check);
            Ok(check.latency.healthy && check.resolution.is_some())
        }
        "resolve" => {
            let settings = session.settings();
            let results = resolve_bulk(rest, settings.max_workers, settings.timeout).await?;
            let all_ok = results.values().all(Result::is_ok);
            print_json(&results.into_iter().collect::<BTreeMap<_, _>>());
            Ok(all_ok)
        }
        "scan" => {
            let ports = match rest.get(1) {
                Some(range) => parse_port_range(range)?,
                None => COMMON_PORTS.iter().map(|(port, _)| *port).collect(),
            };
            let report = session.scan(host, &ports).await?;
            print_json(&report);
            Ok(report.host_answered())
        }
        "trace" => {
            let trace = session.trace(host, DEFAULT_MAX_HOPS).await?;
            print_json(&trace);
            Ok(trace.destination_reached)
        }
        _ => {
            let results = session.analyze(rest).await?;
            for result in &results {
                for advice in result.recommendations() {
                    tracing::info!("{} ({}): {}", result.target, result.rating, advice);
                }
            }
            print_json(&results);
            Ok(results.iter().all(|r| r.healthy))
        }
    }
}

/// Parse `START-END` or a single port.
fn parse_port_range(range: &str) -> Result<Vec<u16>, ValidationError> {
    let invalid = || ValidationError::InvalidPortRange {
        start: 0,
        end: 0,
        reason: "expected START-END",
    };
    let (start, end) = range.split_once('-').unwrap_or((range, range));
    let start = start.trim().parse().map_err(|_| invalid())?;
    let end = end.trim().parse().map_err(|_| invalid())?;
    port_range(start, end)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to encode result: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("20-22").unwrap(), vec![20, 21, 22]);
        assert_eq!(parse_port_range("443").unwrap(), vec![443]);
        assert!(parse_port_range("80-x").is_err());
        assert!(parse_port_range("90-80").is_err());
    }
}
