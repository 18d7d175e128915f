// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end evaluation against the reference backend.

use std::sync::Arc;

use sylvan_pruning::{
    DiscreteRates, LikelihoodConfig, PartialsRestriction, PruningError, RescalingScheme,
    SimpleTree, SitePatterns, TipData, TreeChange, TreeLikelihood, TreeLikelihoodBuilder,
    TreeTopology,
};
use sylvan_pruning_ref::models::{JukesCantor, LocalClock, TwoStateModel};
use sylvan_pruning_ref::{Event, RefBackend};

const CHERRY: &str = "((A:1,B:1):1,C:2);";

/// `P(t)[i][j]` for the symmetric two-state model with unit rates.
fn two_state(t: f64, i: u32, j: u32) -> f64 {
    let same = 0.5 + 0.5 * (-2.0 * t).exp();
    if i == j { same } else { 1.0 - same }
}

/// Site likelihood of `((A:1,B:1):1,C:2)` written out by hand.
fn cherry_likelihood(a: u32, b: u32, c: u32) -> f64 {
    let ab = |i: u32| two_state(1.0, i, a) * two_state(1.0, i, b);
    let root = |i: u32| {
        let left: f64 = (0..2).map(|j| two_state(1.0, i, j) * ab(j)).sum();
        left * two_state(2.0, i, c)
    };
    0.5 * root(0) + 0.5 * root(1)
}

fn cherry_patterns(a: u32) -> SitePatterns {
    SitePatterns::new(2, vec![1.0])
        .with_taxon("A", TipData::States(vec![a]))
        .unwrap()
        .with_taxon("B", TipData::States(vec![0]))
        .unwrap()
        .with_taxon("C", TipData::States(vec![1]))
        .unwrap()
}

fn cherry_engine(config: LikelihoodConfig) -> (SimpleTree, TreeLikelihood<RefBackend>) {
    let tree = SimpleTree::from_newick(CHERRY).unwrap();
    let engine = TreeLikelihoodBuilder::new(
        RefBackend::new(),
        cherry_patterns(0),
        Arc::new(TwoStateModel::symmetric(1.0)),
    )
    .config(config)
    .build(&tree)
    .unwrap();
    (tree, engine)
}

const EIGHT: &str = "(((A:1,B:1):0.5,(C:0.7,D:0.7):0.8):0.6,((E:0.4,F:0.4):1.2,(G:1.1,H:1.1):0.5):0.5);";
const TAXA: [&str; 8] = ["A", "B", "C", "D", "E", "F", "G", "H"];

/// Deterministic pseudo-random DNA columns.
fn dna_patterns(pattern_count: usize, seed: u64) -> SitePatterns {
    let mut state = seed;
    let mut patterns = SitePatterns::new(4, (1..=pattern_count).map(|w| w as f64).collect());
    for taxon in TAXA {
        let states = (0..pattern_count)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                ((state >> 33) % 5) as u32
            })
            .collect();
        patterns.add_taxon(taxon, TipData::States(states)).unwrap();
    }
    patterns
}

fn dna_engine(
    tree: &SimpleTree,
    patterns: SitePatterns,
    clock: Arc<LocalClock>,
    config: LikelihoodConfig,
) -> TreeLikelihood<RefBackend> {
    TreeLikelihoodBuilder::new(RefBackend::new(), patterns, Arc::new(JukesCantor::new(4)))
        .site_rates(Arc::new(DiscreteRates::equal(vec![0.4, 1.6])))
        .branch_rates(clock)
        .config(config)
        .build(tree)
        .unwrap()
}

/// Fresh engine over the same inputs, evaluated once from scratch.
fn from_scratch(tree: &SimpleTree, engine: &TreeLikelihood<RefBackend>, clock: Arc<LocalClock>) -> f64 {
    let mut fresh = dna_engine(tree, engine.patterns().clone(), clock, engine.config().clone());
    fresh.evaluate(tree).unwrap()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(1.0)
}

#[test_log::test]
fn cherry_matches_hand_computation() {
    let (tree, mut engine) = cherry_engine(LikelihoodConfig::default());
    let expected = cherry_likelihood(0, 0, 1).ln();
    let before = engine.evaluate(&tree).unwrap();
    assert!((before - expected).abs() < 1e-12, "{before} vs {expected}");
    engine.store_state();

    engine.set_tip_data("A", TipData::States(vec![1])).unwrap();
    let changed = engine.evaluate(&tree).unwrap();
    assert!((changed - cherry_likelihood(1, 0, 1).ln()).abs() < 1e-12);
    assert_ne!(changed, before);

    engine.restore_state().unwrap();
    assert!(engine.is_known());
    assert_eq!(engine.evaluate(&tree).unwrap().to_bits(), before.to_bits());
    assert_eq!(engine.patterns().data(0), &TipData::States(vec![0]));
}

#[test_log::test]
fn evaluation_is_idempotent() {
    let (tree, mut engine) = cherry_engine(LikelihoodConfig::default());
    let first = engine.evaluate(&tree).unwrap();
    let second = engine.evaluate(&tree).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
    assert_eq!(engine.backend().root_evaluations(), 1);
}

#[test_log::test]
fn ambiguous_tips_match_compact_states() {
    let (tree, mut compact) = cherry_engine(LikelihoodConfig::default());
    let (_, mut partials) = cherry_engine(LikelihoodConfig::default().with_ambiguities(true));
    let a = compact.evaluate(&tree).unwrap();
    let b = partials.evaluate(&tree).unwrap();
    assert!((a - b).abs() < 1e-12);
    assert!(
        partials
            .backend()
            .events()
            .iter()
            .any(|event| matches!(event, Event::TipPartials { tip: 0 }))
    );
}

#[test_log::test]
fn unknown_state_sums_over_states() {
    let (tree, mut engine) = cherry_engine(LikelihoodConfig::default());
    engine.set_tip_data("C", TipData::States(vec![7])).unwrap();
    let ll = engine.evaluate(&tree).unwrap();
    let expected = cherry_likelihood(0, 0, 0) + cherry_likelihood(0, 0, 1);
    assert!((ll - expected.ln()).abs() < 1e-12);
}

#[test_log::test]
fn minimal_recompute_matches_full() {
    let mut tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(
        &tree,
        dna_patterns(24, 7),
        clock.clone(),
        LikelihoodConfig::default(),
    );
    engine.evaluate(&tree).unwrap();

    // (C,D) moves up, still below its parent.
    let cd = tree.parent(2).unwrap();
    tree.set_height(cd, 1.2);
    engine.tree_changed(&tree, TreeChange::NodeChanged(cd));
    engine.backend_mut().clear_events();
    let incremental = engine.evaluate(&tree).unwrap();
    assert!(close(incremental, from_scratch(&tree, &engine, clock.clone())));

    // Only C, D, and (C,D) branches, and the path to the root.
    let matrices: Vec<_> = engine
        .backend()
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::TransitionMatrices { slots, .. } => Some(slots.len()),
            _ => None,
        })
        .collect();
    assert_eq!(matrices, vec![3]);
    assert_eq!(engine.last_operations().op_count(), 3);

    clock.set_rate(4, 1.7);
    engine.branch_rates_changed(Some(4));
    let incremental = engine.evaluate(&tree).unwrap();
    assert!(close(incremental, from_scratch(&tree, &engine, clock.clone())));

    engine.set_tip_data("H", TipData::States(vec![3; 24])).unwrap();
    let incremental = engine.evaluate(&tree).unwrap();
    assert!(close(incremental, from_scratch(&tree, &engine, clock)));
}

#[test_log::test]
fn store_restore_spans_several_evaluations() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(
        &tree,
        dna_patterns(16, 11),
        clock.clone(),
        LikelihoodConfig::default(),
    );
    let before = engine.evaluate(&tree).unwrap();
    let roots = engine.backend().root_evaluations();
    engine.store_state();

    let mut proposal = tree.clone();
    let ab = proposal.parent(0).unwrap();
    proposal.set_height(ab, 1.4);
    engine.tree_changed(&proposal, TreeChange::NodeChanged(ab));
    engine.evaluate(&proposal).unwrap();
    engine.set_tip_data("E", TipData::States(vec![0; 16])).unwrap();
    engine.evaluate(&proposal).unwrap();
    clock.set_rate(6, 0.2);
    engine.branch_rates_changed(Some(6));
    engine.evaluate(&proposal).unwrap();

    // Reject: the caller reverts its own state, the engine reverts the rest.
    clock.set_rate(6, 1.0);
    engine.restore_state().unwrap();
    engine.backend_mut().clear_events();
    assert_eq!(engine.evaluate(&tree).unwrap().to_bits(), before.to_bits());
    assert_eq!(engine.backend().root_evaluations(), roots + 3);
    assert!(engine.backend().events().is_empty());

    // Later proposals start from the restored buffers.
    let mut next = tree.clone();
    let gh = next.parent(6).unwrap();
    next.set_height(gh, 1.3);
    engine.tree_changed(&next, TreeChange::NodeChanged(gh));
    let ll = engine.evaluate(&next).unwrap();
    assert!(close(ll, from_scratch(&next, &engine, clock)));
}

#[test_log::test]
fn unevaluated_change_survives_restore() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(&tree, dna_patterns(8, 3), clock.clone(), LikelihoodConfig::default());
    engine.evaluate(&tree).unwrap();

    clock.set_rate(1, 2.0);
    engine.branch_rates_changed(Some(1));
    engine.store_state();
    engine.restore_state().unwrap();
    assert!(!engine.is_known());
    let ll = engine.evaluate(&tree).unwrap();
    assert!(close(ll, from_scratch(&tree, &engine, clock)));
}

#[test_log::test]
fn global_substitution_change_restores_previous_model() {
    let tree = SimpleTree::from_newick(CHERRY).unwrap();
    let model = Arc::new(TwoStateModel::symmetric(1.0));
    let mut engine = TreeLikelihoodBuilder::new(RefBackend::new(), cherry_patterns(0), model.clone())
        .build(&tree)
        .unwrap();
    let before = engine.evaluate(&tree).unwrap();
    engine.store_state();

    model.set_rates(2.0, 0.5);
    engine.substitution_changed(None);
    let changed = engine.evaluate(&tree).unwrap();
    assert_ne!(changed, before);

    model.set_rates(1.0, 1.0);
    engine.restore_state().unwrap();
    assert_eq!(engine.evaluate(&tree).unwrap().to_bits(), before.to_bits());

    // A branch change after the restore uses the restored eigen buffer.
    engine.branch_rates_changed(Some(2));
    let again = engine.evaluate(&tree).unwrap();
    assert!((again - before).abs() < 1e-12);
}

#[test_log::test]
fn never_and_always_agree() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut values = Vec::new();
    for scheme in [
        RescalingScheme::Never,
        RescalingScheme::Always,
        RescalingScheme::Dynamic,
        RescalingScheme::Delayed,
        RescalingScheme::Delegated,
    ] {
        let mut engine = dna_engine(
            &tree,
            dna_patterns(20, 5),
            clock.clone(),
            LikelihoodConfig::default().with_rescaling(scheme),
        );
        values.push(engine.evaluate(&tree).unwrap());
    }
    for value in &values[1..] {
        assert!((value - values[0]).abs() < 1e-6, "{values:?}");
    }
}

#[test_log::test]
fn all_ones_restriction_is_neutral() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let patterns = dna_patterns(10, 19);
    let mut plain = dna_engine(&tree, patterns.clone(), clock.clone(), LikelihoodConfig::default());
    let config = LikelihoodConfig::default()
        .with_restriction(PartialsRestriction::new(["A", "D"], vec![1.0; 4 * 10]));
    let mut masked = dna_engine(&tree, patterns, clock, config);

    let expected = plain.evaluate(&tree).unwrap();
    let ll = masked.evaluate(&tree).unwrap();
    assert!((ll - expected).abs() < 1e-12);

    // One mask at the ancestor of A and D, applied before the parent reads it.
    let events = masked.backend().events();
    let multiply = events
        .iter()
        .position(|event| matches!(event, Event::Multiply { .. }))
        .unwrap();
    assert!(matches!(events[multiply - 1], Event::Partials { .. }));
    assert!(matches!(events[multiply + 1], Event::Partials { .. }));
}

#[test_log::test]
fn restriction_mask_conditions_the_clade() {
    let tree = SimpleTree::from_newick(CHERRY).unwrap();
    // Only state 0 is allowed at the ancestor of A and B.
    let config = LikelihoodConfig::default()
        .with_restriction(PartialsRestriction::new(["A", "B"], vec![1.0, 0.0]));
    let mut engine = TreeLikelihoodBuilder::new(
        RefBackend::new(),
        cherry_patterns(0),
        Arc::new(TwoStateModel::symmetric(1.0)),
    )
    .config(config)
    .build(&tree)
    .unwrap();

    let ab = two_state(1.0, 0, 0) * two_state(1.0, 0, 0);
    let root = |i: u32| two_state(1.0, i, 0) * ab * two_state(2.0, i, 1);
    let expected = (0.5 * root(0) + 0.5 * root(1)).ln();
    let ll = engine.evaluate(&tree).unwrap();
    assert!((ll - expected).abs() < 1e-12);
}

#[test_log::test]
fn negative_duration_makes_no_backend_calls() {
    let mut tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(&tree, dna_patterns(4, 1), clock, LikelihoodConfig::default());
    engine.evaluate(&tree).unwrap();
    engine.backend_mut().clear_events();

    let ab = tree.parent(0).unwrap();
    let parent = tree.parent(ab).unwrap();
    tree.set_height(ab, tree.height(parent) + 0.1);
    engine.tree_changed(&tree, TreeChange::NodeChanged(ab));
    let err = engine.evaluate(&tree).unwrap_err();
    assert!(matches!(err, PruningError::NegativeBranchDuration { node, .. } if node == ab));
    assert!(engine.backend().events().is_empty());
}

#[test_log::test]
fn invalid_site_rates_give_negative_infinity() {
    let tree = SimpleTree::from_newick(CHERRY).unwrap();
    let mut engine = TreeLikelihoodBuilder::new(
        RefBackend::new(),
        cherry_patterns(0),
        Arc::new(TwoStateModel::symmetric(1.0)),
    )
    .site_rates(Arc::new(DiscreteRates::equal(vec![1.0, f64::NAN])))
    .build(&tree)
    .unwrap();
    assert_eq!(engine.evaluate(&tree).unwrap(), f64::NEG_INFINITY);
    assert!(!engine.is_known());
}

#[test_log::test]
fn ascertainment_conditions_on_variable_patterns() {
    let tree = SimpleTree::from_newick(CHERRY).unwrap();
    let patterns = SitePatterns::new(2, vec![0.0, 0.0, 3.0, 2.0])
        .with_taxon("A", TipData::States(vec![0, 1, 0, 1]))
        .unwrap()
        .with_taxon("B", TipData::States(vec![0, 1, 0, 0]))
        .unwrap()
        .with_taxon("C", TipData::States(vec![0, 1, 1, 0]))
        .unwrap()
        .with_ascertainment(0..2);
    let mut engine = TreeLikelihoodBuilder::new(
        RefBackend::new(),
        patterns,
        Arc::new(TwoStateModel::symmetric(1.0)),
    )
    .build(&tree)
    .unwrap();

    let observable = 1.0 - cherry_likelihood(0, 0, 0) - cherry_likelihood(1, 1, 1);
    let expected = 3.0 * (cherry_likelihood(0, 0, 1).ln() - observable.ln())
        + 2.0 * (cherry_likelihood(1, 0, 0).ln() - observable.ln());
    let ll = engine.evaluate(&tree).unwrap();
    assert!((ll - expected).abs() < 1e-12, "{ll} vs {expected}");
    assert!(engine.report().contains("ascertainment"));
}

#[test_log::test]
fn pattern_log_likelihoods_follow_restore() {
    let (tree, mut engine) = cherry_engine(LikelihoodConfig::default());
    engine.evaluate(&tree).unwrap();
    let stored = engine.pattern_log_likelihoods().to_vec();
    engine.store_state();

    engine.set_tip_data("B", TipData::States(vec![1])).unwrap();
    engine.evaluate(&tree).unwrap();
    assert_ne!(engine.pattern_log_likelihoods(), stored.as_slice());

    engine.restore_state().unwrap();
    assert_eq!(engine.pattern_log_likelihoods(), stored.as_slice());
}

#[test_log::test]
fn invalidate_all_matches_incremental_result() {
    let mut tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(&tree, dna_patterns(18, 29), clock.clone(), LikelihoodConfig::default());
    engine.evaluate(&tree).unwrap();

    let ef = tree.parent(4).unwrap();
    tree.set_height(ef, 0.9);
    engine.tree_changed(&tree, TreeChange::NodeChanged(ef));
    clock.set_rate(7, 0.6);
    engine.branch_rates_changed(Some(7));
    let incremental = engine.evaluate(&tree).unwrap();

    engine.invalidate_all();
    assert!(!engine.is_known());
    engine.backend_mut().clear_events();
    let full = engine.evaluate(&tree).unwrap();
    assert!(close(incremental, full), "{incremental} vs {full}");
    assert_eq!(engine.last_operations().op_count(), tree.node_count() - tree.tip_count());
    assert!(
        engine
            .backend()
            .events()
            .iter()
            .any(|event| matches!(event, Event::EigenDecomposition { .. }))
    );
}

#[test_log::test]
fn invalidate_all_is_undone_by_restore() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(&tree, dna_patterns(12, 41), clock.clone(), LikelihoodConfig::default());
    let before = engine.evaluate(&tree).unwrap();
    engine.store_state();

    engine.invalidate_all();
    assert!(close(engine.evaluate(&tree).unwrap(), before));

    engine.restore_state().unwrap();
    assert!(engine.is_known());
    engine.backend_mut().clear_events();
    assert_eq!(engine.evaluate(&tree).unwrap().to_bits(), before.to_bits());
    assert!(engine.backend().events().is_empty());

    // An invalidation that was never evaluated stays pending across a restore.
    engine.store_state();
    engine.invalidate_all();
    engine.restore_state().unwrap();
    assert!(!engine.is_known());
    assert!(close(engine.evaluate(&tree).unwrap(), before));

    clock.set_rate(2, 1.9);
    engine.branch_rates_changed(Some(2));
    let ll = engine.evaluate(&tree).unwrap();
    assert!(close(ll, from_scratch(&tree, &engine, clock)));
}

#[test_log::test]
fn subtree_change_recomputes_the_clade() {
    let mut tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(&tree, dna_patterns(16, 43), clock.clone(), LikelihoodConfig::default());
    engine.evaluate(&tree).unwrap();

    // Compress the (E,F),(G,H) clade towards the present.
    let clade = tree.parent(tree.parent(4).unwrap()).unwrap();
    for node in [tree.parent(4).unwrap(), tree.parent(6).unwrap(), clade] {
        tree.set_height(node, tree.height(node) * 0.5);
    }
    engine.tree_changed(&tree, TreeChange::SubtreeChanged(clade));
    let ll = engine.evaluate(&tree).unwrap();
    assert!(close(ll, from_scratch(&tree, &engine, clock)));
    // The clade's three internal nodes plus the root.
    assert_eq!(engine.last_operations().op_count(), 4);
}

/// Same taxa in the same order, different topology.
const REGROUPED: &str =
    "((A:1,(B:0.6,C:0.6):0.4):1.1,((D:0.9,E:0.9):0.5,(F:1.2,(G:0.3,H:0.3):0.9):0.2):0.7);";

#[test_log::test]
fn replaced_tree_matches_fresh_engine() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mut engine = dna_engine(&tree, dna_patterns(14, 47), clock.clone(), LikelihoodConfig::default());
    let before = engine.evaluate(&tree).unwrap();
    engine.store_state();

    let replacement = SimpleTree::from_newick(REGROUPED).unwrap();
    engine.tree_changed(&replacement, TreeChange::TreeReplaced);
    let ll = engine.evaluate(&replacement).unwrap();
    assert!(close(ll, from_scratch(&replacement, &engine, clock)));
    assert_ne!(ll, before);

    engine.restore_state().unwrap();
    assert_eq!(engine.evaluate(&tree).unwrap().to_bits(), before.to_bits());
}

#[test_log::test]
fn restrictions_follow_topology_changes() {
    let tree = SimpleTree::from_newick(EIGHT).unwrap();
    let clock = Arc::new(LocalClock::new(tree.node_count()));
    let mask = (0..4 * 10).map(|i| if i % 3 == 0 { 0.25 } else { 1.0 }).collect();
    let config = LikelihoodConfig::default()
        .with_restriction(PartialsRestriction::new(["A", "D"], mask));
    let mut engine = dna_engine(&tree, dna_patterns(10, 53), clock.clone(), config);
    let before = engine.evaluate(&tree).unwrap();
    assert!(close(before, from_scratch(&tree, &engine, clock.clone())));

    // The MRCA of A and D moves from their four-taxon clade to the root.
    let replacement = SimpleTree::from_newick(REGROUPED).unwrap();
    engine.tree_changed(&replacement, TreeChange::TreeReplaced);
    engine.backend_mut().clear_events();
    let ll = engine.evaluate(&replacement).unwrap();
    assert!(close(ll, from_scratch(&replacement, &engine, clock)));

    let root_slots: Vec<usize> = engine
        .backend()
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::RootLikelihood { root, .. } => Some(*root),
            _ => None,
        })
        .collect();
    let masked: Vec<usize> = engine
        .backend()
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::Multiply { slot } => Some(*slot),
            _ => None,
        })
        .collect();
    assert_eq!(masked, root_slots);
}
