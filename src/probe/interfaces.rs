//! Local network configuration: interfaces, default gateway and the address
//! used for outbound traffic.
//!
//! Interface and route details come from the platform tools (`ip`,
//! `ifconfig`, `route`, `ipconfig`). The parsers are pure so every output
//! family can be tested without the tool.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

use super::ProbeError;
use crate::model::ProbeFailure;

/// Budget for one run of a local configuration tool.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Public address the outbound-route lookup aims at. No packet is sent.
pub const OUTBOUND_ROUTE_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Wireless,
    Loopback,
    Tunnel,
    Ppp,
    Virtual,
    Unknown,
}

impl InterfaceKind {
    /// Best guess from the interface name alone.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

        if name == "lo" || name.starts_with("lo0") || name.contains("loopback") {
            InterfaceKind::Loopback
        } else if has(&["wlan", "wifi", "wi-fi", "wireless"]) || name.starts_with("wl") {
            InterfaceKind::Wireless
        } else if has(&["vmware", "vbox", "virtual", "docker", "veth", "virbr"]) {
            InterfaceKind::Virtual
        } else if has(&["tun", "tap", "utun", "wg"]) {
            InterfaceKind::Tunnel
        } else if name.starts_with("ppp") {
            InterfaceKind::Ppp
        } else if has(&["eth", "ethernet", "lan"]) || name.starts_with("en") {
            InterfaceKind::Ethernet
        } else {
            InterfaceKind::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    /// First IPv4 address on the interface.
    pub address: Option<Ipv4Addr>,
    pub mac: Option<String>,
    pub up: bool,
    pub kind: InterfaceKind,
    pub dhcp: bool,
    pub dns_servers: Vec<IpAddr>,
}

impl NetworkInterface {
    fn new(name: &str, up: bool) -> Self {
        Self {
            name: name.to_string(),
            address: None,
            mac: None,
            up,
            kind: InterfaceKind::from_name(name),
            dhcp: false,
            dns_servers: Vec::new(),
        }
    }

    /// Up, addressed, and not loopback.
    pub fn is_active(&self) -> bool {
        self.up
            && self.kind != InterfaceKind::Loopback
            && self.address.is_some_and(|addr| !addr.is_loopback())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gateway {
    pub address: IpAddr,
    /// Interface name (`ip`, `route`) or interface address (Windows).
    pub interface: Option<String>,
}

fn ip_link_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+:\s+(?P<name>[^:@\s]+)(?:@\S+)?:\s+<(?P<flags>[^>]*)>").unwrap())
}

fn inet() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\binet\s+(?:addr:)?(?P<addr>\d+\.\d+\.\d+\.\d+)").unwrap())
}

fn mac() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?P<mac>(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2})").unwrap())
}

fn ipv4() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?P<addr>\d+\.\d+\.\d+\.\d+)").unwrap())
}

/// Parse `ip addr show`, `ifconfig -a` or `ipconfig /all` output.
///
/// The family is recognised from the text itself.
pub fn parse_interfaces(output: &str) -> Vec<NetworkInterface> {
    if output.lines().any(|line| ip_link_header().is_match(line.trim_start())) {
        parse_ip_addr(output)
    } else if output.to_lowercase().contains(" adapter ") {
        parse_ipconfig(output)
    } else {
        parse_ifconfig(output)
    }
}

fn parse_ip_addr(output: &str) -> Vec<NetworkInterface> {
    let mut interfaces = Vec::new();
    let mut current: Option<NetworkInterface> = None;

    for line in output.lines().map(str::trim) {
        if let Some(caps) = ip_link_header().captures(line) {
            interfaces.extend(current.take());
            let up = caps["flags"].split(',').any(|flag| flag == "UP");
            current = Some(NetworkInterface::new(&caps["name"], up));
            continue;
        }
        let Some(iface) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("link/ether") {
            iface.mac = mac().captures(rest).map(|c| c["mac"].to_string());
        } else if let Some(caps) = inet().captures(line) {
            if iface.address.is_none() {
                iface.address = caps["addr"].parse().ok();
                // iproute2 marks leased addresses as "dynamic".
                iface.dhcp = line.split_whitespace().any(|word| word == "dynamic");
            }
        }
    }

    interfaces.extend(current);
    interfaces
}

fn parse_ifconfig(output: &str) -> Vec<NetworkInterface> {
    let mut interfaces = Vec::new();
    let mut current: Option<NetworkInterface> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            interfaces.extend(current.take());
            let name = line.split_whitespace().next().unwrap_or_default();
            let name = name.trim_end_matches(':');
            let flags = line
                .split_once('<')
                .and_then(|(_, rest)| rest.split_once('>'))
                .map(|(flags, _)| flags)
                .unwrap_or(line);
            let up = flags.split([',', ' ']).any(|flag| flag == "UP");
            current = Some(NetworkInterface::new(name, up));
        }
        let Some(iface) = current.as_mut() else {
            continue;
        };

        // Legacy net-tools prints its flags on a line of their own.
        if line.trim_start().starts_with("UP ") {
            iface.up = true;
        }
        if iface.mac.is_none() && (line.contains("ether ") || line.contains("HWaddr")) {
            iface.mac = mac().captures(line).map(|c| c["mac"].to_string());
        }
        if iface.address.is_none() {
            iface.address = inet().captures(line).and_then(|c| c["addr"].parse().ok());
        }
    }

    interfaces.extend(current);
    interfaces
}

fn parse_ipconfig(output: &str) -> Vec<NetworkInterface> {
    let mut interfaces = Vec::new();
    let mut current: Option<NetworkInterface> = None;
    let mut in_dns_list = false;

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if !raw.starts_with(char::is_whitespace) {
            in_dns_list = false;
            if let Some((_, name)) = line.split_once(" adapter ") {
                interfaces.extend(current.take());
                current = Some(NetworkInterface::new(name.trim_end_matches(':').trim(), false));
            }
            continue;
        }
        let Some(iface) = current.as_mut() else {
            continue;
        };

        let Some((label, value)) = line.split_once(" : ") else {
            // Continuation lines under "DNS Servers" carry one address each.
            if in_dns_list {
                if let Ok(addr) = line.parse::<IpAddr>() {
                    iface.dns_servers.push(addr);
                }
            }
            continue;
        };
        let label = label.trim_end_matches(['.', ' ']);
        let value = value.trim();
        in_dns_list = false;

        match label {
            "Physical Address" => {
                iface.mac = mac().captures(value).map(|c| c["mac"].to_string());
            }
            "IPv4 Address" | "IP Address" => {
                if iface.address.is_none() {
                    iface.address = ipv4().captures(value).and_then(|c| c["addr"].parse().ok());
                    iface.up = iface.address.is_some();
                }
            }
            "DHCP Enabled" => iface.dhcp = value.eq_ignore_ascii_case("yes"),
            "Media State" => {
                if value.to_lowercase().contains("disconnected") {
                    iface.up = false;
                }
            }
            "DNS Servers" => {
                in_dns_list = true;
                if let Ok(addr) = value.parse::<IpAddr>() {
                    iface.dns_servers.push(addr);
                }
            }
            _ => {}
        }
    }

    interfaces.extend(current);
    interfaces
}

/// Parse `ip route show default`, `route -n get default` or
/// `route print 0.0.0.0` output.
pub fn parse_default_gateway(output: &str) -> Option<Gateway> {
    static VIA: OnceLock<Regex> = OnceLock::new();
    let via = VIA.get_or_init(|| {
        Regex::new(r"(?m)^default\s+via\s+(?P<addr>\S+)(?:.*?\bdev\s+(?P<dev>\S+))?").unwrap()
    });
    if let Some(caps) = via.captures(output) {
        if let Ok(address) = caps["addr"].parse() {
            return Some(Gateway {
                address,
                interface: caps.name("dev").map(|m| m.as_str().to_string()),
            });
        }
    }

    // BSD `route get`: "gateway: 192.168.1.1" and "interface: en0".
    let field = |key: &str| {
        output.lines().find_map(|line| {
            let (label, value) = line.trim().split_once(':')?;
            (label.trim() == key).then(|| value.trim().to_string())
        })
    };
    if let Some(address) = field("gateway").and_then(|g| g.parse().ok()) {
        return Some(Gateway {
            address,
            interface: field("interface"),
        });
    }

    // Windows route table row: destination, netmask, gateway, interface, metric.
    output.lines().find_map(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.as_slice() {
            ["0.0.0.0", "0.0.0.0", gateway, interface, ..] => Some(Gateway {
                address: gateway.parse().ok()?,
                interface: Some(interface.to_string()),
            }),
            _ => None,
        }
    })
}

/// Run a local configuration tool and return its stdout.
async fn run_tool(program: &str, args: &[&str]) -> Result<String, ProbeError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProbeError::Launch {
            program: program.to_string(),
            source,
        })?;

    match tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => Err(ProbeFailure::unreachable(format!(
            "{} exited with {:?}",
            program,
            output.status.code()
        ))
        .into()),
        Ok(Err(e)) => {
            Err(ProbeFailure::unreachable(format!("failed to read {} output: {}", program, e)).into())
        }
        Err(_) => Err(ProbeFailure::timeout(TOOL_TIMEOUT).into()),
    }
}

/// Run each command in turn until one succeeds; the last error wins.
async fn first_output(commands: &[(&str, &[&str])]) -> Result<String, ProbeError> {
    let mut last = None;
    for (program, args) in commands {
        match run_tool(program, args).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                tracing::debug!("{} unavailable: {}", program, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| ProbeFailure::unreachable("no tool to run").into()))
}

/// Every network interface on this machine.
pub async fn list_interfaces() -> Result<Vec<NetworkInterface>, ProbeError> {
    let output = if cfg!(windows) {
        first_output(&[("ipconfig", &["/all"][..])]).await?
    } else {
        first_output(&[("ip", &["addr", "show"][..]), ("ifconfig", &["-a"][..])]).await?
    };
    let interfaces = parse_interfaces(&output);
    tracing::debug!("Found {} network interfaces", interfaces.len());
    Ok(interfaces)
}

/// The default route's gateway, or `None` when there is no default route.
pub async fn default_gateway() -> Result<Option<Gateway>, ProbeError> {
    let output = if cfg!(windows) {
        first_output(&[("route", &["print", "0.0.0.0"][..])]).await?
    } else {
        first_output(&[
            ("ip", &["route", "show", "default"][..]),
            ("route", &["-n", "get", "default"][..]),
        ])
        .await?
    };
    Ok(parse_default_gateway(&output))
}

/// Local address the OS would use to reach `remote`.
///
/// Connecting a UDP socket only selects a route, so nothing is sent.
pub async fn local_ip_toward(remote: SocketAddr) -> Result<IpAddr, ProbeFailure> {
    let bind: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = tokio::net::UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeFailure::unreachable(format!("bind failed: {}", e)))?;
    socket
        .connect(remote)
        .await
        .map_err(|e| ProbeFailure::unreachable(format!("no route to {}: {}", remote, e)))?;
    socket
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(|e| ProbeFailure::unreachable(e.to_string()))
}

/// Local address used for outbound internet traffic.
pub async fn local_ip() -> Result<IpAddr, ProbeFailure> {
    local_ip_toward(OUTBOUND_ROUTE_ADDR).await
}

/// Snapshot of this machine's network configuration.
#[derive(Debug, Clone, Serialize)]
pub struct LocalNetwork {
    pub interfaces: Vec<NetworkInterface>,
    /// Names of the interfaces that are up, addressed and not loopback.
    pub active: Vec<String>,
    pub gateway: Option<Gateway>,
    pub local_ip: Option<IpAddr>,
}

/// Interfaces, default gateway and outbound address, gathered concurrently.
///
/// Only a failure to list interfaces is an error; a missing route or
/// outbound address is reported as `None`.
pub async fn local_network() -> Result<LocalNetwork, ProbeError> {
    let (interfaces, gateway, local_ip) = tokio::join!(list_interfaces(), default_gateway(), local_ip());

    let interfaces = interfaces?;
    let gateway = gateway.unwrap_or_else(|e| {
        tracing::warn!("Could not read the default route: {}", e);
        None
    });
    let local_ip = local_ip
        .map_err(|e| tracing::warn!("Could not determine the outbound address: {}", e))
        .ok();

    Ok(LocalNetwork {
        active: interfaces
            .iter()
            .filter(|iface| iface.is_active())
            .map(|iface| iface.name.clone())
            .collect(),
        interfaces,
        gateway,
        local_ip,
    })
}
