use super::*;
use crate::flows::{FlowKey, Protocol};
use std::net::Ipv4Addr;

struct FixedIdentity(Option<u32>);

impl IdentityResolver for FixedIdentity {
    fn resolve(&self, _tuple: &FlowTuple) -> Option<u32> {
        self.0
    }
}

fn tuple() -> FlowTuple {
    FlowKey {
        src: Ipv4Addr::new(10, 0, 0, 2),
        src_port: 40000,
        dst: Ipv4Addr::new(93, 184, 216, 34),
        dst_port: 443,
    }
    .tuple(Protocol::Tcp)
}

fn engine_with_identity(identity: Option<u32>) -> PolicyEngine {
    PolicyEngine::new(Arc::new(FixedIdentity(identity)))
}

#[test]
fn identity_rule_wins_over_domain_rule() {
    let engine = engine_with_identity(Some(10123));
    engine.set_identity_rule(10123, Decision::Allow);
    engine.set_domain_rule("ads.example", Decision::Block);
    assert_eq!(
        engine.evaluate(&tuple(), Some("ads.example")),
        Decision::Allow
    );
}

#[test]
fn domain_rule_applies_when_identity_has_no_rule() {
    let engine = engine_with_identity(Some(777));
    engine.set_domain_rule("ads.example", Decision::Block);
    assert_eq!(
        engine.evaluate(&tuple(), Some("ads.example")),
        Decision::Block
    );
}

#[test]
fn domain_rule_applies_when_identity_is_unknown() {
    let engine = engine_with_identity(None);
    engine.set_domain_rule("tracker.example", Decision::Block);
    assert_eq!(
        engine.evaluate(&tuple(), Some("tracker.example")),
        Decision::Block
    );
    assert_eq!(engine.evaluate(&tuple(), Some("other.example")), Decision::Allow);
}

#[test]
fn default_decision_covers_everything_else() {
    let engine = engine_with_identity(None);
    assert_eq!(engine.evaluate(&tuple(), None), Decision::Allow);
    engine.set_default_decision(Decision::Block);
    assert_eq!(engine.evaluate(&tuple(), None), Decision::Block);
    assert_eq!(engine.default_decision(), Decision::Block);
}

#[test]
fn domain_matching_normalizes_case_and_trailing_dot() {
    let engine = engine_with_identity(None);
    engine.set_domain_rule("Ads.Example.", Decision::Block);
    assert_eq!(
        engine.evaluate(&tuple(), Some("ads.example")),
        Decision::Block
    );
    assert_eq!(
        engine.evaluate(&tuple(), Some("ADS.EXAMPLE.")),
        Decision::Block
    );
}

#[test]
fn wildcard_rules_match_after_exact_map_and_newest_wins() {
    let engine = engine_with_identity(None);
    let first = engine.install_wildcard_rule("*.cdn.example", Decision::Block);
    engine.install_wildcard_rule("static.cdn.example", Decision::Allow);
    assert_eq!(
        engine.evaluate(&tuple(), Some("static.cdn.example")),
        Decision::Allow
    );
    assert_eq!(
        engine.evaluate(&tuple(), Some("img.cdn.example")),
        Decision::Block
    );

    // the exact map still has priority over any wildcard
    engine.set_domain_rule("img.cdn.example", Decision::Allow);
    assert_eq!(
        engine.evaluate(&tuple(), Some("img.cdn.example")),
        Decision::Allow
    );

    assert!(engine.remove_wildcard_rule(first));
    assert!(!engine.remove_wildcard_rule(first));
}

#[test]
fn rule_removal_restores_the_default() {
    let engine = engine_with_identity(Some(42));
    engine.set_identity_rule(42, Decision::Block);
    assert_eq!(engine.evaluate(&tuple(), None), Decision::Block);
    assert!(engine.remove_identity_rule(42));
    assert_eq!(engine.evaluate(&tuple(), None), Decision::Allow);

    engine.set_domain_rule("x.example", Decision::Block);
    assert!(engine.remove_domain_rule("x.example"));
    assert!(!engine.remove_domain_rule("x.example"));
    assert_eq!(engine.evaluate(&tuple(), Some("x.example")), Decision::Allow);
}

#[test]
fn identity_lookups_are_memoised_per_tuple() {
    struct CountingResolver(std::sync::atomic::AtomicUsize);

    impl IdentityResolver for CountingResolver {
        fn resolve(&self, _tuple: &FlowTuple) -> Option<u32> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(99)
        }
    }

    let resolver = Arc::new(CountingResolver(std::sync::atomic::AtomicUsize::new(0)));
    let engine = PolicyEngine::new(Arc::clone(&resolver) as Arc<dyn IdentityResolver>);
    engine.set_identity_rule(99, Decision::Block);

    assert_eq!(engine.evaluate(&tuple(), None), Decision::Block);
    assert_eq!(engine.evaluate(&tuple(), None), Decision::Block);
    assert_eq!(
        resolver.0.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "the second evaluation must hit the memo"
    );
}

#[test]
fn rule_snapshots_reflect_current_tables() {
    let engine = engine_with_identity(None);
    engine.set_identity_rule(1, Decision::Block);
    engine.set_domain_rule("a.example", Decision::Block);
    let id = engine.install_wildcard_rule("*.b.example", Decision::Allow);

    assert_eq!(engine.identity_rules(), vec![(1, Decision::Block)]);
    assert_eq!(
        engine.domain_rules(),
        vec![("a.example".to_string(), Decision::Block)]
    );
    assert_eq!(
        engine.wildcard_rules(),
        vec![(id, "*.b.example".to_string(), Decision::Allow)]
    );
}
