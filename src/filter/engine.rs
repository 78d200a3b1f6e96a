//! Per-packet access decision.
//!
//! The policy is an ordered list of guards. The first guard that returns a
//! verdict wins; the last one always does. Forwarding is applied afterwards
//! to any allow verdict.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use super::{FilterTables, IpKey, NetworkState};
use crate::packet::{proto, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Redirect { addr: IpAddr, port: u16 },
    Block,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Verdict::Block)
    }
}

/// Which guard produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    FilterDisabled,
    UdpPassthrough,
    DisconnectedSystem,
    UnknownSystem,
    SelfTraffic,
    DnsFilter,
    Rule,
    NoRule,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::FilterDisabled => "filter disabled",
            Reason::UdpPassthrough => "udp passthrough",
            Reason::DisconnectedSystem => "disconnected system",
            Reason::UnknownSystem => "unknown system",
            Reason::SelfTraffic => "self",
            Reason::DnsFilter => "dns filter",
            Reason::Rule => "rule",
            Reason::NoRule => "no rule",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: Reason,
}

type Guard = fn(&FilterTables, &Packet, &NetworkState) -> Option<(bool, Reason)>;

const POLICY: [Guard; 7] = [
    filter_disabled,
    udp_passthrough,
    disconnected_system,
    unknown_system,
    self_traffic,
    dns_filter,
    uid_rule,
];

/// Decides one packet against a snapshot of the tables.
///
/// Pure: the packet's own timestamp is the clock for DNS expiry, so the same
/// inputs always give the same decision.
pub fn decide(tables: &FilterTables, packet: &Packet, state: &NetworkState) -> Decision {
    let (allowed, reason) = POLICY
        .iter()
        .find_map(|guard| guard(tables, packet, state))
        .unwrap_or((false, Reason::NoRule));

    let verdict = if allowed {
        forwarded(tables, packet)
    } else {
        Verdict::Block
    };
    Decision { verdict, reason }
}

fn filter_disabled(t: &FilterTables, _: &Packet, _: &NetworkState) -> Option<(bool, Reason)> {
    (!t.settings.enabled).then_some((true, Reason::FilterDisabled))
}

fn udp_passthrough(t: &FilterTables, p: &Packet, _: &NetworkState) -> Option<(bool, Reason)> {
    (t.settings.udp_passthrough && p.protocol == proto::UDP).then_some((true, Reason::UdpPassthrough))
}

fn is_system(t: &FilterTables, p: &Packet) -> bool {
    matches!(p.uid, Some(uid) if uid < t.settings.system_uid_threshold)
        && proto::is_supported(p.protocol)
}

fn disconnected_system(t: &FilterTables, p: &Packet, s: &NetworkState) -> Option<(bool, Reason)> {
    (!s.connected && is_system(t, p)).then_some((true, Reason::DisconnectedSystem))
}

fn unknown_system(t: &FilterTables, p: &Packet, _: &NetworkState) -> Option<(bool, Reason)> {
    let unknown = p.uid.map(|uid| !t.rules.contains(uid)).unwrap_or(false);
    (unknown && is_system(t, p)).then_some((true, Reason::UnknownSystem))
}

fn self_traffic(t: &FilterTables, p: &Packet, _: &NetworkState) -> Option<(bool, Reason)> {
    t.settings.is_self(p.uid).then_some((true, Reason::SelfTraffic))
}

fn dns_filter(t: &FilterTables, p: &Packet, s: &NetworkState) -> Option<(bool, Reason)> {
    let uid = p.uid?;
    // 锁定模式下，没有例外的应用不使用 DNS 规则
    if s.lockdown && !t.rules.rules_for(uid).iter().any(|r| r.lockdown) {
        return None;
    }
    let key = IpKey::new(p.version, p.protocol, p.key_port(), uid);
    t.dns
        .lookup(&key, &p.daddr, p.time)
        .map(|rule| (!rule.blocked, Reason::DnsFilter))
}

fn uid_rule(t: &FilterTables, p: &Packet, s: &NetworkState) -> Option<(bool, Reason)> {
    match p.uid.and_then(|uid| t.rules.verdict(uid, s)) {
        Some(allowed) => Some((allowed, Reason::Rule)),
        None => Some((false, Reason::NoRule)),
    }
}

fn forwarded(t: &FilterTables, p: &Packet) -> Verdict {
    let Some(dport) = p.dport else {
        return Verdict::Allow;
    };
    match t.forwards.lookup(dport) {
        Some(fwd) if Some(fwd.ruid) != p.uid => Verdict::Redirect {
            addr: fwd.raddr,
            port: fwd.rport,
        },
        _ => Verdict::Allow,
    }
}
