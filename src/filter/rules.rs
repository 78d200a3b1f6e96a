use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::NetworkState;

/// One application's policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub uid: u32,
    pub package: String,
    pub system: bool,
    /// Filter this application at all; `false` excludes it from the tunnel.
    pub apply: bool,
    pub wifi_blocked: bool,
    pub other_blocked: bool,
    /// Allow on Wi-Fi while the screen is on, even if blocked.
    pub screen_wifi: bool,
    /// Allow on other networks while the screen is on, even if blocked.
    pub screen_other: bool,
    /// Block while roaming even if otherwise allowed.
    pub roaming: bool,
    /// Allowed while lockdown is active.
    pub lockdown: bool,
    pub notify: bool,
    /// Uids whose settings move together with this one.
    pub related: Vec<u32>,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            uid: 0,
            package: String::new(),
            system: false,
            apply: true,
            wifi_blocked: false,
            other_blocked: false,
            screen_wifi: false,
            screen_other: false,
            roaming: false,
            lockdown: false,
            notify: false,
            related: Vec::new(),
        }
    }
}

impl Rule {
    pub fn new(uid: u32, package: impl Into<String>) -> Self {
        Self {
            uid,
            package: package.into(),
            ..Self::default()
        }
    }

    /// Coarse per-application verdict for the given network state.
    pub fn is_allowed(&self, state: &NetworkState) -> bool {
        let (blocked, screen) = if state.metered {
            (self.other_blocked, self.screen_other)
        } else {
            (self.wifi_blocked, self.screen_wifi)
        };
        state.connected
            && (!blocked || (screen && state.interactive))
            && (!state.metered || !(self.roaming && state.roaming))
            && (!state.lockdown || self.lockdown)
    }

    /// Whether screen on/off can change this rule's verdict.
    pub fn depends_on_screen(&self) -> bool {
        (self.wifi_blocked && self.screen_wifi) || (self.other_blocked && self.screen_other)
    }
}

/// Rules by uid. Several packages may share one uid.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    by_uid: HashMap<u32, Vec<Rule>>,
}

impl RuleTable {
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut table = Self::default();
        table.replace_all(rules);
        table
    }

    pub fn replace_all(&mut self, rules: impl IntoIterator<Item = Rule>) {
        self.by_uid.clear();
        for rule in rules {
            self.by_uid.entry(rule.uid).or_default().push(rule);
        }
    }

    /// First rule registered for `uid`.
    pub fn lookup(&self, uid: u32) -> Option<&Rule> {
        self.by_uid.get(&uid).and_then(|rules| rules.first())
    }

    pub fn rules_for(&self, uid: u32) -> &[Rule] {
        self.by_uid.get(&uid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.by_uid.contains_key(&uid)
    }

    /// `None` when no rule exists for `uid`; otherwise whether any of its
    /// packages is allowed.
    pub fn verdict(&self, uid: u32, state: &NetworkState) -> Option<bool> {
        self.by_uid
            .get(&uid)
            .map(|rules| rules.iter().any(|r| r.is_allowed(state)))
    }

    /// Whether a screen transition can change any verdict.
    pub fn any_depends_on_screen(&self) -> bool {
        self.iter().any(Rule::depends_on_screen)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.by_uid.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_uid.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }

    /// `uid` plus every uid reachable through `related` links, sorted.
    pub fn related_uids(&self, uid: u32) -> Vec<u32> {
        let mut seen = HashSet::from([uid]);
        let mut pending = vec![uid];
        while let Some(next) = pending.pop() {
            for rule in self.rules_for(next) {
                for &other in &rule.related {
                    if seen.insert(other) {
                        pending.push(other);
                    }
                }
            }
        }
        let mut uids: Vec<u32> = seen.into_iter().collect();
        uids.sort_unstable();
        uids
    }
}
