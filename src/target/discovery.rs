//! Parsing of host discovery output.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A host seen on the network, with whatever metadata discovery produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredHost {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl DiscoveredHost {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            hostname: None,
            vendor: None,
            ports: Vec::new(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }
}

/// True for addresses that can belong to a single host.
///
/// Excludes network (.0) and broadcast (.255) addresses, loopback,
/// multicast and the unspecified address.
pub fn is_host_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return false;
    };
    let last = addr.octets()[3];
    !(addr.is_loopback()
        || addr.is_multicast()
        || addr.is_broadcast()
        || addr.is_unspecified()
        || last == 0
        || last == 255)
}

fn report_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Nmap scan report for\s+(?:(\S+)\s+\((\d{1,3}(?:\.\d{1,3}){3})\)|(\d{1,3}(?:\.\d{1,3}){3}))")
            .expect("valid report regex")
    })
}

fn mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"MAC Address:\s+\S+\s+\(([^)]+)\)")
            .expect("valid mac regex")
    })
}

fn port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d{1,5})/(?:tcp|udp)\s+open\b")
            .expect("valid port regex")
    })
}

/// Parse ping-sweep or port-scan output into hosts.
///
/// Hosts keep the order in which they were first reported. Reverse-DNS
/// (`in-addr.arpa`) lines are skipped because their leading octets are reversed.
pub fn parse_nmap_hosts(output: &str) -> Vec<DiscoveredHost> {
    let mut hosts: Vec<DiscoveredHost> = Vec::new();
    let mut current: Option<usize> = None;

    for line in output.lines() {
        if line.to_lowercase().contains("in-addr.arpa") {
            continue;
        }

        if let Some(caps) = report_re().captures(line) {
            let (hostname, ip) = match (caps.get(1), caps.get(2), caps.get(3)) {
                (Some(name), Some(ip), _) => (Some(name.as_str().to_string()), ip.as_str()),
                (_, _, Some(ip)) => (None, ip.as_str()),
                _ => continue,
            };
            if !is_host_ip(ip) {
                current = None;
                continue;
            }
            let idx = match hosts.iter().position(|h| h.ip == ip) {
                Some(idx) => idx,
                None => {
                    hosts.push(DiscoveredHost::new(ip));
                    hosts.len() - 1
                }
            };
            if hostname.is_some() {
                hosts[idx].hostname = hostname;
            }
            current = Some(idx);
            continue;
        }

        let Some(idx) = current else { continue };

        if let Some(caps) = mac_re().captures(line) {
            hosts[idx].vendor = Some(caps[1].trim().to_string());
        } else if let Some(caps) = port_re().captures(line) {
            if let Ok(port) = caps[1].parse::<u16>() {
                if !hosts[idx].ports.contains(&port) {
                    hosts[idx].ports.push(port);
                }
            }
        }
    }

    hosts
}

/// Merge `incoming` into `inventory`, filling in missing metadata on known
/// hosts. Returns the number of hosts that were not known before.
pub fn merge_hosts(inventory: &mut Vec<DiscoveredHost>, incoming: Vec<DiscoveredHost>) -> usize {
    let mut added = 0;
    for host in incoming {
        match inventory.iter_mut().find(|h| h.ip == host.ip) {
            Some(known) => {
                if known.hostname.is_none() {
                    known.hostname = host.hostname;
                }
                if known.vendor.is_none() {
                    known.vendor = host.vendor;
                }
                for port in host.ports {
                    if !known.ports.contains(&port) {
                        known.ports.push(port);
                    }
                }
            }
            None => {
                inventory.push(host);
                added += 1;
            }
        }
    }
    added
}
