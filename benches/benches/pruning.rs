// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use sylvan_pruning::{
    DiscreteRates, LikelihoodConfig, RescalingScheme, SimpleTree, SitePatterns, TipData,
    TreeChange, TreeLikelihood, TreeLikelihoodBuilder, TreeTopology,
};
use sylvan_pruning_ref::RefBackend;
use sylvan_pruning_ref::models::JukesCantor;

/// Splitmix64; enough to scatter states and pick nodes.
struct Mixer(u64);

impl Mixer {
    fn below(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        ((z ^ (z >> 31)) % bound as u64) as usize
    }
}

/// Ultrametric balanced tree over `tips` taxa (a power of two).
fn balanced_newick(first: usize, tips: usize) -> String {
    if tips == 1 {
        return format!("t{first}");
    }
    let half = tips / 2;
    format!(
        "({}:0.1,{}:0.1)",
        balanced_newick(first, half),
        balanced_newick(first + half, half)
    )
}

fn build(tips: usize, patterns: usize, scheme: RescalingScheme) -> (SimpleTree, TreeLikelihood<RefBackend>) {
    let tree = SimpleTree::from_newick(&format!("{};", balanced_newick(0, tips))).unwrap();
    let mut rng = Mixer(0x5EED_0000_0000_0001);
    let mut data = SitePatterns::new(4, vec![1.0; patterns]);
    for tip in 0..tips {
        let states = (0..patterns).map(|_| rng.below(4) as u32).collect();
        data.add_taxon(format!("t{tip}"), TipData::States(states)).unwrap();
    }
    let engine = TreeLikelihoodBuilder::new(RefBackend::new(), data, Arc::new(JukesCantor::new(4)))
        .site_rates(Arc::new(DiscreteRates::equal(vec![0.3, 0.8, 1.3, 1.6])))
        .config(LikelihoodConfig::default().with_rescaling(scheme))
        .build(&tree)
        .unwrap();
    (tree, engine)
}

fn bench_pruning(c: &mut Criterion) {
    let mut group = c.benchmark_group("sylvan_pruning");
    group.sample_size(30);

    for &(tips, patterns) in &[(64_usize, 200_usize), (256, 200)] {
        group.bench_function(format!("full_recompute(tips={tips},p={patterns})"), |b| {
            let (tree, mut engine) = build(tips, patterns, RescalingScheme::Dynamic);
            b.iter(|| {
                engine.invalidate_all();
                black_box(engine.evaluate(&tree).unwrap());
            });
        });

        group.bench_function(format!("one_height(tips={tips},p={patterns})"), |b| {
            let (tree, mut engine) = build(tips, patterns, RescalingScheme::Dynamic);
            engine.evaluate(&tree).unwrap();
            let mut rng = Mixer(0x5EED_0000_0000_0002);
            b.iter(|| {
                // Tip heights stay fixed; wiggling a cherry keeps every branch positive.
                let tip = rng.below(tips);
                let cherry = tree.parent(tip).unwrap_or(tip);
                engine.tree_changed(&tree, TreeChange::NodeChanged(cherry));
                black_box(engine.evaluate(&tree).unwrap());
            });
        });

        group.bench_function(format!("propose_reject(tips={tips},p={patterns})"), |b| {
            b.iter_batched(
                || {
                    let (tree, mut engine) = build(tips, patterns, RescalingScheme::Always);
                    engine.evaluate(&tree).unwrap();
                    (tree, engine)
                },
                |(tree, mut engine)| {
                    engine.store_state();
                    engine
                        .set_tip_data("t0", TipData::States(vec![4; patterns]))
                        .unwrap();
                    black_box(engine.evaluate(&tree).unwrap());
                    engine.restore_state().unwrap();
                    black_box(engine.evaluate(&tree).unwrap());
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pruning);
criterion_main!(benches);
