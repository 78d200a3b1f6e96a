//! Policy tables and the per-packet access decision.
//!
//! All tables live in one [`FilterTables`] value that the firewall keeps
//! behind a single read-write lock: reloads and DNS answers write, the packet
//! path reads.

pub mod dns;
pub mod engine;
pub mod forward;
pub mod hosts;
pub mod rules;

use serde::Serialize;

pub use dns::{DnsIpFilterTable, IpKey, IpRule, UpsertOutcome};
pub use engine::{decide, Decision, Reason, Verdict};
pub use forward::{Forward, ForwardingTable};
pub use hosts::HostsBlocklist;
pub use rules::{Rule, RuleTable};

use crate::config::FirewallConfig;

/// Effective network facts the decision depends on.
///
/// `metered` and `roaming` are already adjusted for user preferences
/// (home Wi-Fi, unmetered generations, national/EU roaming).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NetworkState {
    pub connected: bool,
    pub metered: bool,
    pub roaming: bool,
    /// Screen on and unlocked.
    pub interactive: bool,
    pub lockdown: bool,
}

impl NetworkState {
    pub fn wifi() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    pub fn metered() -> Self {
        Self {
            connected: true,
            metered: true,
            ..Self::default()
        }
    }
}

/// Switches read by the decision engine and the packet logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSettings {
    pub enabled: bool,
    pub udp_passthrough: bool,
    pub system_uid_threshold: u32,
    pub self_uid: Option<u32>,
    pub log: bool,
    pub log_app: bool,
    pub notify_access: bool,
    pub manage_system: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            udp_passthrough: false,
            system_uid_threshold: 2000,
            self_uid: None,
            log: false,
            log_app: false,
            notify_access: false,
            manage_system: false,
        }
    }
}

impl FilterSettings {
    pub fn from_config(cfg: &FirewallConfig, self_uid: Option<u32>) -> Self {
        Self {
            enabled: cfg.filter,
            udp_passthrough: cfg.udp_passthrough,
            system_uid_threshold: cfg.system_uid_threshold,
            self_uid,
            log: cfg.log,
            log_app: cfg.log_app,
            notify_access: cfg.notify_access,
            manage_system: cfg.manage_system,
        }
    }

    pub fn is_self(&self, uid: Option<u32>) -> bool {
        uid.is_some() && uid == self.self_uid
    }
}

/// Everything the packet path reads, swapped or patched under one write lock.
#[derive(Debug, Default)]
pub struct FilterTables {
    pub settings: FilterSettings,
    pub rules: RuleTable,
    pub dns: DnsIpFilterTable,
    pub forwards: ForwardingTable,
    pub hosts: HostsBlocklist,
}

impl FilterTables {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Drops every learned or loaded entry; used when filtering is off.
    pub fn clear(&mut self) {
        self.rules = RuleTable::default();
        self.dns.clear();
        self.forwards = ForwardingTable::default();
        self.hosts = HostsBlocklist::default();
    }
}
