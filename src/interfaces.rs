//! Permitted egress addresses
//!
//! Answers the two questions the proxy asks about local addresses: which ones
//! may be used for egress, and whether a given one is permitted.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;

use serde::Serialize;
use sysinfo::Networks;
use tracing::debug;

use crate::config::EgressConfig;
use crate::error::{ProxyError, Result};

/// A local address that can be used for outbound connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EgressAddress {
    pub interface: String,
    pub ip: IpAddr,
    pub version: u8,
}

impl EgressAddress {
    pub fn new(interface: impl Into<String>, ip: IpAddr) -> Self {
        let version = if ip.is_ipv4() { 4 } else { 6 };
        Self {
            interface: interface.into(),
            ip,
            version,
        }
    }
}

/// Source of truth for which local addresses may be used for egress
///
/// Implementations must reflect live state: callers never cache results.
pub trait EgressPolicy: Send + Sync {
    /// List every address currently usable for egress
    fn available(&self) -> Result<Vec<EgressAddress>>;

    /// Check whether the given address may be used for egress
    fn is_allowed(&self, ip: IpAddr) -> bool;
}

/// Policy backed by the host's network interfaces
pub struct InterfacePolicy {
    allowed_interfaces: HashSet<String>,
}

impl InterfacePolicy {
    pub fn new(config: &EgressConfig) -> Self {
        Self {
            allowed_interfaces: config.allowed_interfaces.iter().cloned().collect(),
        }
    }

    /// Addresses on allowed interfaces, regardless of link state
    fn assigned(&self) -> Vec<EgressAddress> {
        self.addresses_where(|_| true)
    }

    /// Addresses on allowed interfaces that are administratively up
    fn assigned_up(&self) -> Vec<EgressAddress> {
        self.addresses_where(interface_is_up)
    }

    fn addresses_where(&self, keep_interface: impl Fn(&str) -> bool) -> Vec<EgressAddress> {
        let networks = Networks::new_with_refreshed_list();
        let mut result = Vec::new();

        for (name, data) in networks.list() {
            if !self.allowed_interfaces.contains(name) || !keep_interface(name.as_str()) {
                continue;
            }
            for network in data.ip_networks() {
                result.push(EgressAddress::new(name.clone(), network.addr));
            }
        }

        result
    }
}

impl EgressPolicy for InterfacePolicy {
    fn available(&self) -> Result<Vec<EgressAddress>> {
        if self.allowed_interfaces.is_empty() {
            return Err(ProxyError::Misconfigured(
                "no allowed interfaces configured".to_string(),
            ));
        }

        let addresses: Vec<EgressAddress> = self
            .assigned_up()
            .into_iter()
            .filter(|addr| is_routable(addr.ip))
            .collect();

        debug!(count = addresses.len(), "Enumerated egress addresses");
        Ok(addresses)
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        self.assigned().iter().any(|addr| addr.ip == ip)
    }
}

/// Fixed set of addresses, independent of host interfaces
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    addresses: Vec<EgressAddress>,
}

impl StaticPolicy {
    pub fn new(addresses: Vec<EgressAddress>) -> Self {
        Self { addresses }
    }

    pub fn from_ips(interface: &str, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self::new(
            ips.into_iter()
                .map(|ip| EgressAddress::new(interface, ip))
                .collect(),
        )
    }
}

impl EgressPolicy for StaticPolicy {
    fn available(&self) -> Result<Vec<EgressAddress>> {
        Ok(self.addresses.clone())
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        self.addresses.iter().any(|addr| addr.ip == ip)
    }
}

const IFF_UP: u32 = 0x1;

/// Whether an interface is administratively up
///
/// Reads the kernel's interface flags; where they are not exposed the
/// interface is assumed up.
fn interface_is_up(name: &str) -> bool {
    let flags_path = Path::new("/sys/class/net").join(name).join("flags");
    match std::fs::read_to_string(&flags_path) {
        Ok(raw) => match parse_interface_flags(&raw) {
            Some(flags) => flags & IFF_UP != 0,
            None => {
                debug!(interface = name, raw = raw.trim(), "Unparseable interface flags");
                true
            }
        },
        Err(_) => true,
    }
}

/// Parse the `0x1003`-style hex flags the kernel reports
fn parse_interface_flags(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u32::from_str_radix(hex, 16).ok()
}

/// Loopback and link-local addresses are never offered for egress
fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_link_local()),
        IpAddr::V6(v6) => !(v6.is_loopback() || is_ipv6_link_local(&v6)),
    }
}

fn is_ipv6_link_local(ip: &Ipv6Addr) -> bool {
    // fe80::/10 unicast, ff02::/16 multicast
    (ip.segments()[0] & 0xffc0) == 0xfe80 || ip.segments()[0] == 0xff02
}
