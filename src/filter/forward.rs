use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Port forward: traffic to `dport` goes to `raddr:rport` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    pub protocol: u8,
    pub dport: u16,
    pub raddr: IpAddr,
    pub rport: u16,
    /// Uid of the application receiving the forwarded traffic.
    pub ruid: u32,
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol={} port {} to {}/{} uid {}",
            self.protocol, self.dport, self.raddr, self.rport, self.ruid
        )
    }
}

/// One forward per destination port.
#[derive(Debug, Clone, Default)]
pub struct ForwardingTable {
    by_port: HashMap<u16, Forward>,
}

impl ForwardingTable {
    pub fn replace_all(&mut self, forwards: impl IntoIterator<Item = Forward>) {
        self.by_port.clear();
        for fwd in forwards {
            self.insert(fwd);
        }
    }

    /// Replaces any forward for the same port; returns the old one.
    pub fn insert(&mut self, fwd: Forward) -> Option<Forward> {
        self.by_port.insert(fwd.dport, fwd)
    }

    pub fn remove(&mut self, dport: u16) -> Option<Forward> {
        self.by_port.remove(&dport)
    }

    pub fn lookup(&self, dport: u16) -> Option<&Forward> {
        self.by_port.get(&dport)
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }
}
