//! Declarative virtual interface configuration.

use std::collections::HashSet;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;
use tracing::{debug, info};

use super::cidr::exclusion_complement;
use crate::app::platform::{NetworkEnvironment, NetworkType};
use crate::config::{FirewallConfig, TunnelSettings};
use crate::filter::{NetworkState, Rule};

const FALLBACK_DNS4: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];
const FALLBACK_DNS6: [Ipv6Addr; 2] = [
    Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888),
    Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8844),
];

const TMOBILE_MNC: &[u16] = &[160, 200, 210, 220, 230, 240, 250, 260, 270, 310, 490, 660, 800];
const TMOBILE_RANGES: &[&str] = &["66.94.2.0/24", "66.94.6.0/23", "66.94.8.0/22", "208.54.0.0/16"];
const VERIZON_RANGES: &[&str] = &[
    "66.174.0.0/16",
    "66.82.0.0/15",
    "69.96.0.0/13",
    "70.192.0.0/11",
    "97.128.0.0/9",
    "174.192.0.0/9",
    "72.96.0.0/9",
    "75.192.0.0/9",
    "97.0.0.0/10",
];

/// Shape of one virtual interface.
///
/// Equality treats every list as a set; order never matters.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelConfig {
    pub mtu: u32,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub disallowed: Vec<String>,
    pub network_type: NetworkType,
}

impl PartialEq for TunnelConfig {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type
            && self.mtu == other.mtu
            && same_set(&self.addresses, &other.addresses)
            && same_set(&self.routes, &other.routes)
            && same_set(&self.dns, &other.dns)
            && same_set(&self.disallowed, &other.disallowed)
    }
}

impl Eq for TunnelConfig {}

fn same_set<T: Eq + Hash>(a: &[T], b: &[T]) -> bool {
    a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}

/// Builds [`TunnelConfig`] values from settings and the host environment.
pub struct TunnelConfigBuilder<'a> {
    pub tunnel: &'a TunnelSettings,
    pub firewall: &'a FirewallConfig,
    pub env: &'a NetworkEnvironment,
}

impl<'a> TunnelConfigBuilder<'a> {
    pub fn new(
        tunnel: &'a TunnelSettings,
        firewall: &'a FirewallConfig,
        env: &'a NetworkEnvironment,
    ) -> Self {
        Self {
            tunnel,
            firewall,
            env,
        }
    }

    /// `allowed` are the rules currently allowed, `all` every known rule.
    pub fn build(
        &self,
        allowed: &[&Rule],
        all: &[Rule],
        state: &NetworkState,
        network_type: NetworkType,
    ) -> TunnelConfig {
        let filter = self.firewall.filter;

        let mut addresses = Vec::new();
        if let Ok(v4) = self.tunnel.vpn4.parse::<Ipv4Addr>() {
            addresses.push(IpNet::V4(Ipv4Net::from(v4)));
        }
        if self.tunnel.ip6 {
            if let Ok(v6) = self.tunnel.vpn6.parse::<Ipv6Addr>() {
                addresses.push(IpNet::V6(Ipv6Net::from(v6)));
            }
        }

        let dns = if filter { self.select_dns() } else { Vec::new() };

        let mut routes: Vec<IpNet> = if self.tunnel.subnet {
            exclusion_complement(&self.exclusions())
                .into_iter()
                .map(IpNet::V4)
                .collect()
        } else {
            vec![IpNet::V4(Ipv4Net::default())]
        };
        if self.tunnel.ip6 {
            // 全局单播
            if let Ok(unicast) = "2000::/3".parse::<IpNet>() {
                routes.push(unicast);
            }
        }

        let mut disallowed = vec![self.env.own_package.clone()];
        if state.connected && !filter {
            disallowed.extend(allowed.iter().map(|r| r.package.clone()));
        } else if filter {
            for rule in all {
                if !rule.apply || (!self.firewall.manage_system && rule.system) {
                    debug!(package = %rule.package, "Not routing");
                    disallowed.push(rule.package.clone());
                }
            }
        }

        info!(
            mtu = self.tunnel.mtu,
            routes = routes.len(),
            dns = dns.len(),
            disallowed = disallowed.len(),
            network = network_type.as_str(),
            "tunnel config built"
        );

        TunnelConfig {
            mtu: self.tunnel.mtu,
            addresses,
            routes,
            dns,
            disallowed,
            network_type,
        }
    }

    /// IPv4 ranges kept off the tunnel in split-tunnel mode.
    pub fn exclusions(&self) -> Vec<Ipv4Net> {
        let mut exclude = vec![net4("127.0.0.0/8")];

        if self.tunnel.tethering {
            // USB 192.168.42.x, Wi-Fi 192.168.43.x, Wi-Fi direct 192.168.49.x
            exclude.push(net4("192.168.42.0/23"));
            exclude.push(net4("192.168.49.0/24"));
        }

        if self.tunnel.lan {
            for local in &self.env.local_networks {
                if let IpNet::V4(v4) = local {
                    debug!(network = %v4.trunc(), "Excluding local network");
                    exclude.push(v4.trunc());
                }
            }
        }

        if let (Some(mcc), Some(mnc)) = (self.env.mcc, self.env.mnc) {
            if is_tmobile(mcc, mnc) {
                exclude.extend(TMOBILE_RANGES.iter().map(|r| net4(r)));
            }
            if is_verizon(mcc, mnc) {
                exclude.extend(VERIZON_RANGES.iter().map(|r| net4(r)));
            }
        }

        // 组播与保留地址
        exclude.push(net4("224.0.0.0/3"));
        exclude
    }

    /// Resolvers announced on the tunnel.
    pub fn select_dns(&self) -> Vec<IpAddr> {
        let ip6 = self.tunnel.ip6;
        let usable = |addr: &IpAddr| !addr.is_loopback() && !addr.is_unspecified() && (ip6 || addr.is_ipv4());

        let mut dns: Vec<IpAddr> = [&self.tunnel.dns, &self.tunnel.dns2]
            .into_iter()
            .flatten()
            .filter_map(|s| s.parse::<IpAddr>().ok())
            .filter(|a| usable(a))
            .collect();

        if dns.len() <= 1 {
            for sys in &self.env.system_dns {
                if usable(sys) && !dns.contains(sys) {
                    dns.push(*sys);
                }
            }
        }

        if self.tunnel.lan && self.firewall.filter && self.firewall.use_hosts {
            let mut spare4 = FALLBACK_DNS4.iter().map(|a| IpAddr::V4(*a));
            let mut spare6 = FALLBACK_DNS6.iter().filter(|_| ip6).map(|a| IpAddr::V6(*a));
            let local: Vec<IpAddr> = dns
                .iter()
                .copied()
                .filter(|d| self.env.local_networks.iter().any(|n| n.contains(d)))
                .collect();
            for addr in local {
                debug!(dns = %addr, "Local DNS server replaced");
                dns.retain(|d| *d != addr);
                let replacement = if addr.is_ipv4() { spare4.next() } else { spare6.next() };
                dns.extend(replacement);
            }
        }

        dns
    }
}

fn is_tmobile(mcc: u16, mnc: u16) -> bool {
    mcc == 310 && TMOBILE_MNC.contains(&mnc)
}

fn is_verizon(mcc: u16, mnc: u16) -> bool {
    match mcc {
        310 => matches!(mnc, 4 | 5 | 6 | 10 | 12 | 13 | 350 | 590 | 820 | 890 | 910),
        311 => matches!(mnc, 12 | 110 | 270..=289 | 390 | 480..=489 | 590),
        312 => mnc == 770,
        _ => false,
    }
}

fn net4(s: &str) -> Ipv4Net {
    s.parse().unwrap_or_default()
}
