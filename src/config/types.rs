use std::net::IpAddr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.mtu < 576 {
            anyhow::bail!("tunnel mtu {} is below the IPv4 minimum of 576", self.tunnel.mtu);
        }
        if self.firewall.log_queue_depth == 0 {
            anyhow::bail!("firewall log_queue_depth must be positive");
        }
        match self.tunnel.vpn4.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => {}
            _ => anyhow::bail!("tunnel vpn4 '{}' is not an IPv4 address", self.tunnel.vpn4),
        }
        match self.tunnel.vpn6.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => {}
            _ => anyhow::bail!("tunnel vpn6 '{}' is not an IPv6 address", self.tunnel.vpn6),
        }
        for dns in [&self.tunnel.dns, &self.tunnel.dns2].into_iter().flatten() {
            if dns.parse::<IpAddr>().is_err() {
                anyhow::bail!("tunnel dns '{}' is not an IP address", dns);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Packet filtering switches.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Per-packet filtering; when off every packet reaching the engine is allowed.
    pub filter: bool,
    pub udp_passthrough: bool,
    /// Uids below this are system services.
    pub system_uid_threshold: u32,
    pub log: bool,
    pub log_app: bool,
    pub notify_access: bool,
    pub manage_system: bool,
    pub use_hosts: bool,
    pub lockdown: bool,
    pub lockdown_wifi: bool,
    pub lockdown_other: bool,
    pub log_queue_depth: usize,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            filter: false,
            udp_passthrough: false,
            system_uid_threshold: 2000,
            log: false,
            log_app: false,
            notify_access: false,
            manage_system: false,
            use_hosts: false,
            lockdown: false,
            lockdown_wifi: true,
            lockdown_other: true,
            log_queue_depth: 4096,
        }
    }
}

/// Shape of the virtual interface.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub vpn4: String,
    pub vpn6: String,
    pub ip6: bool,
    /// Route the complement of the exclusion list instead of a default route.
    pub subnet: bool,
    pub tethering: bool,
    pub lan: bool,
    pub dns: Option<String>,
    pub dns2: Option<String>,
    pub mtu: u32,
    /// Pause before retrying after a failed handover.
    pub handover_settle_ms: u64,
    /// Pause between teardown and establish when handover is unsupported.
    pub legacy_settle_ms: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            vpn4: "10.1.10.1".to_string(),
            vpn6: "fd00:1:fd00:1:fd00:1:fd00:1".to_string(),
            ip6: true,
            subnet: false,
            tethering: false,
            lan: false,
            dns: None,
            dns2: None,
            mtu: 10000,
            handover_settle_ms: 3000,
            legacy_settle_ms: 500,
        }
    }
}

/// How raw network facts translate into metered/roaming.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Treat Wi-Fi as metered when the platform says so.
    pub use_metered: bool,
    /// Wi-Fi networks counted as unmetered; empty means all.
    pub wifi_homes: Vec<String>,
    pub unmetered_2g: bool,
    pub unmetered_3g: bool,
    pub unmetered_4g: bool,
    /// Ignore roaming inside the home country.
    pub national_roaming: bool,
    /// Ignore roaming between EU countries.
    pub eu_roaming: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Keep a statistics notification after stop.
    pub show_stats: bool,
    /// Reload on screen on/off.
    pub screen_on: bool,
    /// Clear native session state when the engine restarts on reload.
    pub clear_on_reload: bool,
    /// Watchdog period in minutes, 0 disables it.
    pub watchdog_minutes: u64,
    /// Expired DNS entries are purged this often.
    pub householding_hours: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            show_stats: false,
            screen_on: true,
            clear_on_reload: false,
            watchdog_minutes: 0,
            householding_hours: 24,
        }
    }
}
