//! Ping output parser.
//!
//! Turns the text printed by a platform ping tool into sent/received counts and
//! per-reply round trips. Pure and deterministic: no I/O, no logging, and it
//! never fails. Unrecognizable output degrades to a total-loss result with
//! `fallback` set.
//!
//! Both dialects are tried regardless of the host OS, so captured output from
//! either family parses the same way everywhere.

use std::sync::OnceLock;

use regex::Regex;

/// How far the scraped reply count may drift from the summary line before
/// the summary is trusted instead.
pub const SAMPLE_TOLERANCE: u32 = 1;

/// Family of ping tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingDialect {
    /// `ping -n <count> -w <ms>`, "Packets: Sent = 4, Received = 4, ..."
    Windows,
    /// `ping -c <count> -W <secs>`, "4 packets transmitted, 4 received, ..."
    Posix,
}

impl PingDialect {
    /// Dialect of the ping tool on the machine we are running on.
    pub fn native() -> Self {
        if cfg!(windows) {
            PingDialect::Windows
        } else {
            PingDialect::Posix
        }
    }
}

/// What the parser recovered from one run of the tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPing {
    pub sent: u32,
    pub received: u32,
    /// Round trips in milliseconds, at most `received` of them.
    pub samples: Vec<f64>,
    /// Dialect whose summary line matched.
    pub dialect: Option<PingDialect>,
    /// Loss percentage as printed by the tool. Informational only.
    pub reported_loss: Option<f64>,
    /// The output could not be trusted and was read as total loss.
    pub fallback: bool,
}

impl ParsedPing {
    fn total_loss(sent: u32, dialect: Option<PingDialect>, reported_loss: Option<f64>) -> Self {
        Self {
            sent,
            received: 0,
            samples: Vec::new(),
            dialect,
            reported_loss,
            fallback: true,
        }
    }
}

struct Summary {
    dialect: PingDialect,
    sent: u32,
    received: u32,
    loss: Option<f64>,
}

const SUMMARY_PATTERNS: &[(PingDialect, &str)] = &[
    (
        PingDialect::Posix,
        r"(?P<sent>\d+)\s+packets transmitted,\s+(?P<received>\d+)\s+(?:packets\s+)?received(?:,\s+\+\d+\s+\w+)*(?:,\s+(?P<loss>\d+(?:\.\d+)?)%\s+packet loss)?",
    ),
    (
        PingDialect::Windows,
        r"Sent\s*=\s*(?P<sent>\d+),\s*Received\s*=\s*(?P<received>\d+)(?:,\s*Lost\s*=\s*\d+\s*\((?P<loss>\d+(?:\.\d+)?)%\s*loss\))?",
    ),
];

fn summary_table() -> &'static [(PingDialect, Regex)] {
    static TABLE: OnceLock<Vec<(PingDialect, Regex)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        SUMMARY_PATTERNS
            .iter()
            .map(|(dialect, pattern)| (*dialect, Regex::new(pattern).unwrap()))
            .collect()
    })
}

fn reply_time() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\btime\s*(?P<op>[=<])\s*(?P<ms>\d+(?:\.\d+)?)\s*ms").unwrap()
    })
}

/// A time reported only as below `bound` (Windows `time<1ms`) is read as
/// half the bound.
pub(crate) fn below_bound_ms(bound: f64) -> f64 {
    bound / 2.0
}

/// Parse the output of one ping run.
///
/// The host is accepted for context only. `requested` is the attempt count
/// the tool was asked for; it becomes the sent count whenever the output
/// carries no usable summary.
pub fn parse_ping_output(output: &str, _host: &str, requested: u32) -> ParsedPing {
    let samples = scrape_samples(output);

    let summary = match find_summary(output) {
        Some(s) => s,
        None => return ParsedPing::total_loss(requested, None, None),
    };

    if summary.sent == 0 {
        return ParsedPing::total_loss(requested, Some(summary.dialect), summary.loss);
    }

    // Replies claimed but none measurable (e.g. Windows counting "Destination
    // host unreachable" as a reply with 0% loss): fall back to what was scraped.
    if samples.is_empty() && summary.received > 0 {
        return ParsedPing::total_loss(summary.sent, Some(summary.dialect), summary.loss);
    }

    let scraped = samples.len() as u32;
    let received = if scraped.abs_diff(summary.received) > SAMPLE_TOLERANCE {
        summary.received
    } else {
        scraped
    }
    .min(summary.sent);

    let mut samples = samples;
    samples.truncate(received as usize);

    ParsedPing {
        sent: summary.sent,
        received,
        samples,
        dialect: Some(summary.dialect),
        reported_loss: summary.loss,
        fallback: false,
    }
}

/// One sample per reply line; repeated time tokens on a line count once and
/// duplicate replies are ignored.
fn scrape_samples(output: &str) -> Vec<f64> {
    let re = reply_time();
    output
        .lines()
        .filter(|line| !line.contains("DUP!"))
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| {
            let ms = caps.name("ms")?.as_str().parse::<f64>().ok()?;
            Some(if &caps["op"] == "<" { below_bound_ms(ms) } else { ms })
        })
        .collect()
}

fn find_summary(output: &str) -> Option<Summary> {
    summary_table().iter().find_map(|(dialect, re)| {
        let caps = re.captures(output)?;
        Some(Summary {
            dialect: *dialect,
            sent: caps.name("sent")?.as_str().parse().ok()?,
            received: caps.name("received")?.as_str().parse().ok()?,
            loss: caps.name("loss").and_then(|m| m.as_str().parse().ok()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OK: &str = r#"PING example.com (93.184.216.34) 56(84) bytes of data.
64 bytes from 93.184.216.34: icmp_seq=1 ttl=56 time=10.0 ms
64 bytes from 93.184.216.34: icmp_seq=2 ttl=56 time=12.0 ms
64 bytes from 93.184.216.34: icmp_seq=3 ttl=56 time=11.0 ms
64 bytes from 93.184.216.34: icmp_seq=4 ttl=56 time=13.0 ms

--- example.com ping statistics ---
4 packets transmitted, 4 received, 0% packet loss, time 3004ms
rtt min/avg/max/mdev = 10.000/11.500/13.000/1.118 ms"#;

    const LINUX_PARTIAL: &str = r#"PING 10.0.0.9 (10.0.0.9) 56(84) bytes of data.
64 bytes from 10.0.0.9: icmp_seq=1 ttl=64 time=0.412 ms
64 bytes from 10.0.0.9: icmp_seq=3 ttl=64 time=0.398 ms

--- 10.0.0.9 ping statistics ---
4 packets transmitted, 2 received, 50% packet loss, time 3051ms
rtt min/avg/max/mdev = 0.398/0.405/0.412/0.007 ms"#;

    const LINUX_DOWN: &str = r#"PING 10.0.0.250 (10.0.0.250) 56(84) bytes of data.
From 10.0.0.5 icmp_seq=1 Destination Host Unreachable
From 10.0.0.5 icmp_seq=2 Destination Host Unreachable

--- 10.0.0.250 ping statistics ---
4 packets transmitted, 0 received, +2 errors, 100% packet loss, time 3062ms"#;

    const MACOS_OK: &str = r#"PING example.com (93.184.216.34): 56 data bytes
64 bytes from 93.184.216.34: icmp_seq=0 ttl=56 time=17.906 ms
64 bytes from 93.184.216.34: icmp_seq=1 ttl=56 time=18.204 ms
64 bytes from 93.184.216.34: icmp_seq=2 ttl=56 time=17.511 ms

--- example.com ping statistics ---
3 packets transmitted, 3 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.511/17.874/18.204/0.284 ms"#;

    const WINDOWS_OK: &str = "Pinging example.com [93.184.216.34] with 32 bytes of data:\r
Reply from 93.184.216.34: bytes=32 time=11ms TTL=56\r
Reply from 93.184.216.34: bytes=32 time=12ms TTL=56\r
Reply from 93.184.216.34: bytes=32 time<1ms TTL=56\r
Request timed out.\r
\r
Ping statistics for 93.184.216.34:\r
    Packets: Sent = 4, Received = 3, Lost = 1 (25% loss),\r
Approximate round trip times in milli-seconds:\r
    Minimum = 0ms, Maximum = 12ms, Average = 7ms\r
";

    const WINDOWS_UNREACHABLE: &str = r#"Pinging 192.168.1.10 with 32 bytes of data:
Reply from 192.168.1.5: Destination host unreachable.
Reply from 192.168.1.5: Destination host unreachable.
Reply from 192.168.1.5: Destination host unreachable.
Reply from 192.168.1.5: Destination host unreachable.

Ping statistics for 192.168.1.10:
    Packets: Sent = 4, Received = 4, Lost = 0 (0% loss),"#;

    #[test]
    fn test_parse_linux() {
        let parsed = parse_ping_output(LINUX_OK, "example.com", 4);
        assert_eq!(parsed.sent, 4);
        assert_eq!(parsed.received, 4);
        assert_eq!(parsed.samples, vec![10.0, 12.0, 11.0, 13.0]);
        assert_eq!(parsed.dialect, Some(PingDialect::Posix));
        assert!(!parsed.fallback);
    }

    #[test]
    fn test_parse_linux_partial_loss() {
        let parsed = parse_ping_output(LINUX_PARTIAL, "10.0.0.9", 4);
        assert_eq!((parsed.sent, parsed.received), (4, 2));
        assert_eq!(parsed.samples, vec![0.412, 0.398]);
        assert_eq!(parsed.reported_loss, Some(50.0));
    }

    #[test]
    fn test_parse_linux_host_down() {
        let parsed = parse_ping_output(LINUX_DOWN, "10.0.0.250", 4);
        assert_eq!((parsed.sent, parsed.received), (4, 0));
        assert!(parsed.samples.is_empty());
        assert!(!parsed.fallback);
    }

    #[test]
    fn test_parse_macos() {
        let parsed = parse_ping_output(MACOS_OK, "example.com", 3);
        assert_eq!((parsed.sent, parsed.received), (3, 3));
        assert_eq!(parsed.samples.len(), 3);
        assert_eq!(parsed.reported_loss, Some(0.0));
    }

    #[test]
    fn test_parse_windows() {
        let parsed = parse_ping_output(WINDOWS_OK, "example.com", 4);
        assert_eq!(parsed.dialect, Some(PingDialect::Windows));
        assert_eq!((parsed.sent, parsed.received), (4, 3));
        assert_eq!(parsed.samples, vec![11.0, 12.0, 0.5]);
    }

    #[test]
    fn test_sub_millisecond_reply_reads_below_bound() {
        let samples = scrape_samples("Reply from 10.0.0.1: bytes=32 time<1ms TTL=64\nReply from 10.0.0.1: bytes=32 time=1ms TTL=64");
        assert_eq!(samples, vec![0.5, 1.0]);
        assert!(samples[0] < 1.0);
    }

    #[test]
    fn test_contradictory_summary_falls_back() {
        let parsed = parse_ping_output(WINDOWS_UNREACHABLE, "192.168.1.10", 4);
        assert_eq!((parsed.sent, parsed.received), (4, 0));
        assert!(parsed.samples.is_empty());
        assert!(parsed.fallback);
    }

    #[test]
    fn test_unrecognized_output_is_total_loss() {
        let parsed = parse_ping_output("ping: unknown host nowhere.invalid", "nowhere.invalid", 5);
        assert_eq!((parsed.sent, parsed.received), (5, 0));
        assert!(parsed.fallback);

        let parsed = parse_ping_output("", "example.com", 4);
        assert_eq!((parsed.sent, parsed.received), (4, 0));
    }

    #[test]
    fn test_one_sample_per_line() {
        let output = r#"64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=1.0 ms time=9.0 ms
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=1.1 ms (DUP!)
64 bytes from 10.0.0.1: icmp_seq=2 ttl=64 time=2.0 ms

--- 10.0.0.1 ping statistics ---
2 packets transmitted, 2 received, +1 duplicates, 0% packet loss, time 1001ms"#;
        let parsed = parse_ping_output(output, "10.0.0.1", 2);
        assert_eq!((parsed.sent, parsed.received), (2, 2));
        assert_eq!(parsed.samples, vec![1.0, 2.0]);
    }

    #[test]
    fn test_summary_wins_beyond_tolerance() {
        // Replies printed in an unfamiliar shape: only one line scraped, summary says four.
        let output = r#"64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=1.5 ms
reply 2 rtt 1.6
reply 3 rtt 1.7
reply 4 rtt 1.8
4 packets transmitted, 4 received, 0% packet loss"#;
        let parsed = parse_ping_output(output, "10.0.0.1", 4);
        assert_eq!((parsed.sent, parsed.received), (4, 4));
        assert_eq!(parsed.samples, vec![1.5]);
    }

    #[test]
    fn test_scraped_count_within_tolerance() {
        let output = r#"64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=1.5 ms
64 bytes from 10.0.0.1: icmp_seq=2 ttl=64 time=1.6 ms
64 bytes from 10.0.0.1: icmp_seq=3 ttl=64 time=1.7 ms
4 packets transmitted, 4 received, 0% packet loss"#;
        let parsed = parse_ping_output(output, "10.0.0.1", 4);
        assert_eq!((parsed.sent, parsed.received), (4, 3));
    }

    #[test]
    fn test_parse_is_idempotent() {
        for fixture in [LINUX_OK, LINUX_PARTIAL, MACOS_OK, WINDOWS_OK, WINDOWS_UNREACHABLE] {
            let first = parse_ping_output(fixture, "host", 4);
            let second = parse_ping_output(fixture, "host", 4);
            assert_eq!(first, second);
        }
    }
}
