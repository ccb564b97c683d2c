//! Capability checks.
//!
//! The engine only asks one question of the outside world before accepting a
//! command: does this requester hold the capability the matched rule names?

use std::collections::{BTreeMap, BTreeSet};

/// Answers whether `requester` holds `capability`.
pub trait CapabilityCheck: Send + Sync {
    fn has_capability(&self, requester: &str, capability: &str) -> bool;
}

/// Grants every capability to every requester.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn has_capability(&self, _requester: &str, _capability: &str) -> bool {
        true
    }
}

/// Fixed identity → capability grants.
///
/// A grant of `*` covers every capability; a grant ending in `:*` (for
/// example `file:*`) covers every capability with that prefix.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl StaticCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, requester: &str, capabilities: &[&str]) -> Self {
        self.grants
            .entry(requester.to_string())
            .or_default()
            .extend(capabilities.iter().map(|c| c.to_string()));
        self
    }

    pub fn from_map<I, C>(grants: I) -> Self
    where
        I: IntoIterator<Item = (String, C)>,
        C: IntoIterator<Item = String>,
    {
        let mut out = Self::default();
        for (requester, caps) in grants {
            out.grants.entry(requester).or_default().extend(caps);
        }
        out
    }

    pub fn requesters(&self) -> impl Iterator<Item = &str> {
        self.grants.keys().map(|k| k.as_str())
    }
}

impl CapabilityCheck for StaticCapabilities {
    fn has_capability(&self, requester: &str, capability: &str) -> bool {
        let Some(granted) = self.grants.get(requester) else {
            return false;
        };
        granted.iter().any(|g| {
            g == "*"
                || g == capability
                || g.strip_suffix('*')
                    .is_some_and(|prefix| prefix.ends_with(':') && capability.starts_with(prefix))
        })
    }
}
