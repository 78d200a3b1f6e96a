//! Per-destination verdicts learned from DNS answers.
//!
//! Entries expire with the DNS TTL. An expired entry is invisible to
//! lookups, so the packet falls back to the per-application rule.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::packet::proto;

/// Bucket key: `(version, protocol, dport, uid)`.
///
/// `dport` is 0 for protocols without ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpKey {
    pub version: u8,
    pub protocol: u8,
    pub dport: u16,
    pub uid: u32,
}

impl IpKey {
    pub fn new(version: u8, protocol: u8, dport: u16, uid: u32) -> Self {
        let dport = if proto::has_ports(protocol) { dport } else { 0 };
        Self {
            version,
            protocol,
            dport,
            uid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    /// Name the address was resolved from.
    pub name: String,
    pub blocked: bool,
    /// Absolute expiry, milliseconds since the epoch.
    pub expiry: i64,
}

impl IpRule {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expiry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// An expired entry was overwritten.
    Replaced,
    /// Same verdict, later expiry.
    Extended,
    /// Same verdict, expiry already at least as late.
    Unchanged,
    /// Different verdict for a live entry; the existing one was kept.
    Conflict,
}

impl UpsertOutcome {
    /// Whether the table now holds something it did not before.
    pub fn is_change(self) -> bool {
        matches!(
            self,
            UpsertOutcome::Inserted | UpsertOutcome::Replaced | UpsertOutcome::Extended
        )
    }
}

/// One resolved answer as delivered by the packet loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub time: i64,
    pub qname: String,
    pub aname: String,
    pub resource: IpAddr,
    pub ttl_ms: i64,
}

/// Access history row for one application and destination, as the rule store
/// returns it when (re)building the filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub uid: u32,
    pub version: u8,
    pub protocol: u8,
    pub dport: u16,
    /// Destination as the user saw it, usually a host name.
    pub daddr: String,
    /// Address `daddr` resolved to, if known.
    pub resource: Option<String>,
    pub blocked: bool,
    pub time: i64,
    pub ttl_ms: i64,
}

impl AccessEntry {
    pub fn key(&self) -> IpKey {
        IpKey::new(self.version, self.protocol, self.dport, self.uid)
    }

    /// The numeric address the verdict applies to.
    pub fn address(&self) -> Option<IpAddr> {
        self.resource
            .as_deref()
            .unwrap_or(&self.daddr)
            .parse()
            .ok()
    }

    pub fn expiry(&self) -> i64 {
        self.time.saturating_add(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsIpFilterTable {
    buckets: HashMap<IpKey, HashMap<IpAddr, IpRule>>,
}

impl DnsIpFilterTable {
    /// Inserts or refreshes one verdict.
    ///
    /// A live entry is never flipped: a different verdict is logged as a
    /// conflict and ignored, the same verdict only extends the expiry.
    pub fn upsert(
        &mut self,
        key: IpKey,
        address: IpAddr,
        name: &str,
        blocked: bool,
        expiry: i64,
        now: i64,
    ) -> UpsertOutcome {
        let bucket = self.buckets.entry(key).or_default();
        match bucket.get_mut(&address) {
            None => {
                bucket.insert(address, new_rule(name, blocked, expiry));
                UpsertOutcome::Inserted
            }
            Some(existing) if existing.is_expired(now) => {
                *existing = new_rule(name, blocked, expiry);
                UpsertOutcome::Replaced
            }
            Some(existing) if existing.blocked != blocked => {
                warn!(
                    uid = key.uid,
                    dport = key.dport,
                    address = %address,
                    name = name,
                    kept = existing.blocked,
                    "Address conflict"
                );
                UpsertOutcome::Conflict
            }
            Some(existing) if expiry > existing.expiry => {
                existing.expiry = expiry;
                debug!(uid = key.uid, address = %address, expiry, "Address updated");
                UpsertOutcome::Extended
            }
            Some(_) => UpsertOutcome::Unchanged,
        }
    }

    /// Upserts a stored access row. Rows without a numeric address are skipped.
    pub fn apply(&mut self, entry: &AccessEntry, now: i64) -> Option<UpsertOutcome> {
        let Some(address) = entry.address() else {
            warn!(daddr = %entry.daddr, "Address not numeric");
            return None;
        };
        Some(self.upsert(
            entry.key(),
            address,
            &entry.daddr,
            entry.blocked,
            entry.expiry(),
            now,
        ))
    }

    /// Live entry for `address` under `key`.
    pub fn lookup(&self, key: &IpKey, address: &IpAddr, now: i64) -> Option<&IpRule> {
        self.buckets
            .get(key)?
            .get(address)
            .filter(|rule| !rule.is_expired(now))
    }

    pub fn replace_all(&mut self, entries: &[AccessEntry], now: i64) {
        self.buckets.clear();
        for entry in entries {
            self.apply(entry, now);
        }
    }

    /// Drops expired entries and empty buckets; returns how many entries went.
    pub fn purge_expired(&mut self, now: i64) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|_, rule| !rule.is_expired(now));
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        removed
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_rule(name: &str, blocked: bool, expiry: i64) -> IpRule {
    IpRule {
        name: name.to_string(),
        blocked,
        expiry,
    }
}
