//! Per-flow policy: identity rules, domain rules, and a default decision.
//!
//! `evaluate` runs exactly once per flow, at flow creation; the caller caches
//! the decision on the flow object, so later rule mutations never touch live
//! traffic.

use crate::flows::FlowTuple;
use crate::host::IdentityResolver;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use wildmatch::WildMatch;

/// Upper bound on memoised identity lookups; the memo is a hint and is wiped
/// wholesale when it grows past this.
const IDENTITY_MEMO_LIMIT: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Block,
}

impl Decision {
    fn as_u8(self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Block => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 1 {
            Decision::Block
        } else {
            Decision::Allow
        }
    }
}

/// A wildcard host rule, consulted after the exact domain map misses.
/// Later installs win over earlier ones.
pub struct WildcardRule {
    pub id: u64,
    pub pattern: String,
    matcher: WildMatch,
    pub decision: Decision,
}

pub struct PolicyEngine {
    identity_rules: DashMap<u32, Decision, FxBuildHasher>,
    domain_rules: DashMap<String, Decision, FxBuildHasher>,
    wildcard_rules: RwLock<Vec<WildcardRule>>,
    next_rule_id: AtomicU64,
    default_decision: AtomicU8,
    resolver: Arc<dyn IdentityResolver>,
    identity_memo: DashMap<FlowTuple, Option<u32>, FxBuildHasher>,
}

impl PolicyEngine {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            identity_rules: DashMap::with_hasher(FxBuildHasher),
            domain_rules: DashMap::with_hasher(FxBuildHasher),
            wildcard_rules: RwLock::new(Vec::new()),
            next_rule_id: AtomicU64::new(1),
            default_decision: AtomicU8::new(Decision::Allow.as_u8()),
            resolver,
            identity_memo: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Decide for a new flow: identity rule, then domain rule, then default.
    pub fn evaluate(&self, tuple: &FlowTuple, domain: Option<&str>) -> Decision {
        if let Some(identity) = self.identity_for(tuple) {
            if let Some(decision) = self.identity_rules.get(&identity) {
                return *decision;
            }
        }
        if let Some(domain) = domain {
            if let Some(decision) = self.match_domain(domain) {
                return decision;
            }
        }
        self.default_decision()
    }

    fn identity_for(&self, tuple: &FlowTuple) -> Option<u32> {
        if let Some(memoised) = self.identity_memo.get(tuple) {
            return *memoised;
        }
        let identity = self.resolver.resolve(tuple);
        if self.identity_memo.len() >= IDENTITY_MEMO_LIMIT {
            self.identity_memo.clear();
        }
        self.identity_memo.insert(*tuple, identity);
        identity
    }

    fn match_domain(&self, domain: &str) -> Option<Decision> {
        let Some(normalized) = normalize_domain(domain) else {
            return None;
        };
        if let Some(decision) = self.domain_rules.get(&normalized) {
            return Some(*decision);
        }
        let guard = self.wildcard_rules.read();
        for rule in guard.iter().rev() {
            if rule.matcher.matches(&normalized) {
                return Some(rule.decision);
            }
        }
        None
    }

    // Operator interface. Every method below is safe to call concurrently
    // with the data plane; running flows keep the decision they were born
    // with.

    pub fn set_identity_rule(&self, identity: u32, decision: Decision) {
        self.identity_rules.insert(identity, decision);
    }

    pub fn remove_identity_rule(&self, identity: u32) -> bool {
        self.identity_rules.remove(&identity).is_some()
    }

    pub fn set_domain_rule(&self, domain: &str, decision: Decision) {
        if let Some(normalized) = normalize_domain(domain) {
            self.domain_rules.insert(normalized, decision);
        }
    }

    pub fn remove_domain_rule(&self, domain: &str) -> bool {
        match normalize_domain(domain) {
            Some(normalized) => self.domain_rules.remove(&normalized).is_some(),
            None => false,
        }
    }

    pub fn install_wildcard_rule(&self, pattern: &str, decision: Decision) -> u64 {
        let id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        let normalized = pattern.trim().to_ascii_lowercase();
        let matcher = WildMatch::new(&normalized);
        self.wildcard_rules.write().push(WildcardRule {
            id,
            pattern: normalized,
            matcher,
            decision,
        });
        id
    }

    pub fn remove_wildcard_rule(&self, id: u64) -> bool {
        let mut guard = self.wildcard_rules.write();
        let before = guard.len();
        guard.retain(|rule| rule.id != id);
        guard.len() != before
    }

    pub fn set_default_decision(&self, decision: Decision) {
        self.default_decision
            .store(decision.as_u8(), Ordering::Relaxed);
    }

    pub fn default_decision(&self) -> Decision {
        Decision::from_u8(self.default_decision.load(Ordering::Relaxed))
    }

    pub fn identity_rules(&self) -> Vec<(u32, Decision)> {
        self.identity_rules
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn domain_rules(&self) -> Vec<(String, Decision)> {
        self.domain_rules
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn wildcard_rules(&self) -> Vec<(u64, String, Decision)> {
        self.wildcard_rules
            .read()
            .iter()
            .map(|rule| (rule.id, rule.pattern.clone(), rule.decision))
            .collect()
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests;
