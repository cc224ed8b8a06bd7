//! Branch resolution: specificity ordering and live rule replacement.

use std::sync::Arc;

use gatekeeper_core::{
    BranchResolution, BranchResolver, BranchRule, GovernanceConfig, GovernanceEngine,
    GovernanceError, LogNotifier, Specificity, Stores, TieBreak,
};

fn resolver(rules: Vec<BranchRule>) -> BranchResolver {
    BranchResolver::from_rules(rules, TieBreak::DeclarationOrder)
        .unwrap()
        .0
}

// ── Specificity ──

#[test]
fn exact_beats_prefix_beats_catch_all() {
    let r = resolver(vec![
        BranchRule::new("*", "sandbox"),
        BranchRule::new("release/*", "preprod"),
        BranchRule::new("release/2.0", "production"),
    ]);

    assert_eq!(r.resolve("release/2.0").environment(), Some("production"));
    assert_eq!(r.resolve("release/2.1").environment(), Some("preprod"));
    assert_eq!(r.resolve("spike").environment(), Some("sandbox"));
}

#[test]
fn longer_literal_prefix_wins() {
    let r = resolver(vec![
        BranchRule::new("team/*", "shared"),
        BranchRule::new("team/payments/*", "payments"),
    ]);

    match r.resolve("team/payments/refunds") {
        BranchResolution::Matched(m) => {
            assert_eq!(m.environment, "payments");
            assert_eq!(m.rule_index, 1);
            assert_eq!(m.specificity, Specificity::Literal("team/payments/".len()));
        }
        BranchResolution::NoMatch => panic!("expected a match"),
    }
    assert_eq!(r.resolve("team/search").environment(), Some("shared"));
}

#[test]
fn inner_wildcards_match_across_segments() {
    let r = resolver(vec![BranchRule::new("hotfix/*-urgent", "production")]);

    assert_eq!(r.resolve("hotfix/db/pool-urgent").environment(), Some("production"));
    assert_eq!(r.resolve("hotfix/db-pool").environment(), None);
}

#[test]
fn equal_specificity_falls_back_to_declaration_order() {
    let (r, overlaps) = BranchResolver::from_rules(
        vec![
            BranchRule::new("release/*", "preprod"),
            BranchRule::new("release/*", "production"),
        ],
        TieBreak::DeclarationOrder,
    )
    .unwrap();

    assert_eq!(r.resolve("release/3").environment(), Some("preprod"));
    assert_eq!(overlaps.len(), 1);
    assert_eq!(overlaps[0].shadowed, 1);
}

#[test]
fn tagged_only_rules_ignored_for_plain_branches() {
    let r = resolver(vec![BranchRule::new("v*", "production").tagged_only()]);

    assert_eq!(r.resolve_ref("v1.2.0", false), BranchResolution::NoMatch);
    assert_eq!(r.resolve_ref("v1.2.0", true).environment(), Some("production"));
}

#[test]
fn empty_pattern_is_invalid() {
    let err = BranchResolver::from_rules(vec![BranchRule::new("", "x")], TieBreak::default())
        .unwrap_err();
    assert!(matches!(err, GovernanceError::InvalidConfig(_)));
}

// ── Live replacement ──

#[tokio::test]
async fn replace_rules_swaps_snapshot_atomically() {
    let config = GovernanceConfig {
        branch_rules: vec![BranchRule::new("main", "staging")],
        ..GovernanceConfig::default()
    };
    let engine = Arc::new(
        GovernanceEngine::new(config, Stores::in_memory(), Arc::new(LogNotifier)).unwrap(),
    );

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let env = engine.resolve("main", false).environment().map(str::to_string);
                    assert!(matches!(env.as_deref(), Some("staging") | Some("production")));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    engine
        .replace_rules(vec![BranchRule::new("main", "production")], TieBreak::Strict)
        .unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(engine.resolve("main", false).environment(), Some("production"));

    // A rejected rule set leaves the current snapshot in place.
    let err = engine
        .replace_rules(
            vec![BranchRule::new("main", "a"), BranchRule::new("main", "b")],
            TieBreak::Strict,
        )
        .unwrap_err();
    assert!(matches!(err, GovernanceError::InvalidConfig(_)));
    assert_eq!(engine.resolve("main", false).environment(), Some("production"));
}
