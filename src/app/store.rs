//! In-memory [`RuleStore`], loaded from a YAML/JSON snapshot.
//!
//! Used by the CLI and the C ABI, where the host pushes its persisted state
//! instead of exposing a database.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::platform::{NetworkClass, RuleStore};
use crate::common::recover;
use crate::filter::dns::{AccessEntry, DnsRecord};
use crate::filter::{Forward, Rule};

/// Serialized form of everything the store holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub rules: Vec<Rule>,
    pub forwards: Vec<Forward>,
    pub hosts: Vec<String>,
    pub access: Vec<AccessEntry>,
    pub dns: Vec<DnsRecord>,
}

impl StoreSnapshot {
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(content).context("invalid store snapshot")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        Self::parse(&content)
    }
}

pub struct MemoryStore {
    data: RwLock<StoreSnapshot>,
    enabled: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreSnapshot::default())
    }
}

impl MemoryStore {
    pub fn new(snapshot: StoreSnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot),
            enabled: AtomicBool::new(true),
        }
    }

    /// Swaps the whole content, e.g. after the host edited its database.
    pub fn replace(&self, snapshot: StoreSnapshot) {
        *recover(self.data.write()) = snapshot;
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        recover(self.data.read()).clone()
    }
}

impl RuleStore for MemoryStore {
    fn load_rules(&self) -> Result<Vec<Rule>> {
        Ok(recover(self.data.read()).rules.clone())
    }

    fn load_forwards(&self) -> Result<Vec<Forward>> {
        Ok(recover(self.data.read()).forwards.clone())
    }

    fn load_blocked_hosts(&self) -> Result<HashSet<String>> {
        Ok(recover(self.data.read()).hosts.iter().cloned().collect())
    }

    /// Access rows joined with the resolved addresses of their host name.
    fn load_access(&self, qname: Option<&str>) -> Result<Vec<AccessEntry>> {
        let data = recover(self.data.read());
        let mut out = Vec::new();
        for entry in &data.access {
            if let Some(q) = qname {
                if !entry.daddr.eq_ignore_ascii_case(q) {
                    continue;
                }
            }
            if entry.resource.is_some() || entry.daddr.parse::<std::net::IpAddr>().is_ok() {
                out.push(entry.clone());
                continue;
            }
            for rr in data.dns.iter().filter(|rr| rr.qname.eq_ignore_ascii_case(&entry.daddr)) {
                out.push(AccessEntry {
                    resource: Some(rr.resource.to_string()),
                    time: rr.time,
                    ttl_ms: rr.ttl_ms,
                    ..entry.clone()
                });
            }
        }
        Ok(out)
    }

    fn insert_dns(&self, record: &DnsRecord) -> Result<bool> {
        let mut data = recover(self.data.write());
        let existing = data.dns.iter_mut().find(|rr| {
            rr.qname.eq_ignore_ascii_case(&record.qname)
                && rr.aname.eq_ignore_ascii_case(&record.aname)
                && rr.resource == record.resource
        });
        match existing {
            Some(rr) => {
                rr.time = record.time;
                rr.ttl_ms = record.ttl_ms;
                Ok(false)
            }
            None => {
                debug!(qname = %record.qname, resource = %record.resource, "new dns record");
                data.dns.push(record.clone());
                Ok(true)
            }
        }
    }

    fn set_blocked(&self, uid: u32, class: NetworkClass, blocked: bool) -> Result<()> {
        let mut data = recover(self.data.write());
        for rule in data.rules.iter_mut().filter(|r| r.uid == uid) {
            match class {
                NetworkClass::Wifi => rule.wifi_blocked = blocked,
                NetworkClass::Other => rule.other_blocked = blocked,
            }
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}
