//! Hostname blocklist parsed from hosts-file text.

use std::collections::HashSet;

use tracing::info;

/// Always blocked, so users can check the blocklist is active.
pub const TEST_HOST: &str = "test.netguard.me";

#[derive(Debug, Clone, Default)]
pub struct HostsBlocklist {
    names: HashSet<String>,
}

impl HostsBlocklist {
    /// Parses `<address> <name>` lines. `#` starts a comment; lines with any
    /// other word count are ignored.
    pub fn parse(text: &str) -> Self {
        let mut names = HashSet::from([TEST_HOST.to_string()]);
        let mut lines = 0usize;
        for line in text.lines() {
            lines += 1;
            let content = line.split('#').next().unwrap_or("");
            let words: Vec<&str> = content.split_whitespace().collect();
            if let [_, name] = words.as_slice() {
                names.insert(name.to_string());
            }
        }
        info!(lines, hosts = names.len(), "hosts blocklist parsed");
        Self { names }
    }

    pub fn from_names(names: impl IntoIterator<Item = String>) -> Self {
        let mut set: HashSet<String> = names.into_iter().collect();
        set.insert(TEST_HOST.to_string());
        Self { names: set }
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
