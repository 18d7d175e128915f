// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Post-order traversal that turns dirty flags into batched backend work.

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::backend::PartialsOp;
use crate::buffers::BufferIndexRegistry;
use crate::dirty::DirtyTracker;
use crate::error::PruningError;
use crate::hooks::EvaluationHooks;
use crate::process::{BranchRateModel, EvolutionaryProcess};
use crate::rescaling::{ScaleBuffers, ScalingPass};
use crate::restriction::RestrictionMap;
use crate::tree::TreeTopology;

/// Which traversal of an evaluation is being built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraversalMode {
    /// The first traversal: claims matrix slots and collects branch updates.
    First,
    /// The forced-rescaling retry after an underflow.
    ///
    /// Branch matrices were already computed by the first traversal, so no
    /// matrix slots are claimed and no branch updates are collected.
    ScaleRetry,
}

/// A mask multiplication scheduled after a combine step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MaskStep {
    /// Partials buffer to multiply.
    pub slot: usize,
    /// Restriction index of the mask.
    pub restriction: usize,
}

/// Combine operations followed by an optional mask application.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpSegment {
    /// Combine operations, in dependency order.
    pub ops: Vec<PartialsOp>,
    /// Mask applied after `ops` and before anything later reads its slot.
    pub mask: Option<MaskStep>,
}

/// Partials operations for one evaluation, split at mask applications.
///
/// Without restrictions this is a single segment, so the whole evaluation is
/// one backend call.
#[derive(Clone, Debug, Default)]
pub struct OperationList {
    segments: SmallVec<[OpSegment; 1]>,
}

impl OperationList {
    /// Removes all operations.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    fn current(&mut self) -> &mut OpSegment {
        if self.segments.last().is_none_or(|segment| segment.mask.is_some()) {
            self.segments.push(OpSegment::default());
        }
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Appends a combine operation.
    pub fn push(&mut self, op: PartialsOp) {
        self.current().ops.push(op);
    }

    /// Closes the current segment with a mask application.
    pub fn push_mask(&mut self, step: MaskStep) {
        self.current().mask = Some(step);
    }

    /// The segments, in submission order.
    #[must_use]
    pub fn segments(&self) -> &[OpSegment] {
        &self.segments
    }

    /// Total number of combine operations.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.segments.iter().map(|segment| segment.ops.len()).sum()
    }

    /// Number of mask applications.
    #[must_use]
    pub fn mask_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| segment.mask.is_some())
            .count()
    }

    /// Returns `true` if there is nothing to submit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Branches whose transition matrices must be recomputed.
#[derive(Clone, Debug, Default)]
pub struct BranchUpdates {
    nodes: Vec<usize>,
    durations: Vec<f64>,
}

impl BranchUpdates {
    /// Child nodes of the changed branches.
    #[must_use]
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    /// Effective durations (`rate × length`), parallel to [`nodes`](Self::nodes).
    #[must_use]
    pub fn durations(&self) -> &[f64] {
        &self.durations
    }

    /// Number of branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no branch changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.durations.clear();
    }

    fn push(&mut self, node: usize, duration: f64) {
        self.nodes.push(node);
        self.durations.push(duration);
    }
}

/// Everything one traversal reads or retargets.
pub struct TraversalContext<'a> {
    /// The tree being evaluated.
    pub tree: &'a dyn TreeTopology,
    /// Which nodes changed.
    pub dirty: &'a DirtyTracker,
    /// Branch rate multipliers.
    pub branch_rates: &'a dyn BranchRateModel,
    /// Owner of the matrix slots.
    pub process: &'a mut dyn EvolutionaryProcess,
    /// Partials slot registry.
    pub partials: &'a mut BufferIndexRegistry,
    /// Scale slot bookkeeping.
    pub scales: &'a mut ScaleBuffers,
    /// Restriction masks, if configured.
    pub restrictions: Option<&'a mut RestrictionMap>,
    /// Scaling decision for this traversal.
    pub pass: ScalingPass,
}

impl core::fmt::Debug for TraversalContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TraversalContext")
            .field("pass", &self.pass)
            .finish_non_exhaustive()
    }
}

/// Builds the operation and branch-update lists for an evaluation.
///
/// Buffers are reused across evaluations.
#[derive(Clone, Debug, Default)]
pub struct OperationBuilder {
    ops: OperationList,
    branches: BranchUpdates,
}

impl OperationBuilder {
    /// Operations collected by the last traversal.
    #[must_use]
    pub fn operations(&self) -> &OperationList {
        &self.ops
    }

    /// Branch updates collected by the last traversal.
    #[must_use]
    pub fn branch_updates(&self) -> &BranchUpdates {
        &self.branches
    }

    /// Walks the tree from the root and rebuilds both lists.
    ///
    /// Nothing is sent to the backend. On error the lists are incomplete and
    /// must not be submitted.
    pub fn build<H: EvaluationHooks + ?Sized>(
        &mut self,
        ctx: &mut TraversalContext<'_>,
        hooks: &mut H,
        mode: TraversalMode,
    ) -> Result<(), PruningError> {
        self.ops.clear();
        if mode == TraversalMode::First {
            self.branches.clear();
        }
        let root = ctx.tree.root();
        self.visit(ctx, hooks, root, mode)?;
        Ok(())
    }

    /// Returns `true` if `node`'s partials (or its branch) were recomputed.
    fn visit<H: EvaluationHooks + ?Sized>(
        &mut self,
        ctx: &mut TraversalContext<'_>,
        hooks: &mut H,
        node: usize,
        mode: TraversalMode,
    ) -> Result<bool, PruningError> {
        let mut updated = false;

        if let Some(parent) = ctx.tree.parent(node) {
            if ctx.dirty.is_dirty(node) {
                if mode == TraversalMode::First {
                    let node_height = ctx.tree.height(node);
                    let parent_height = ctx.tree.height(parent);
                    let rate = ctx.branch_rates.rate(ctx.tree, node);
                    let duration = rate * (parent_height - node_height);
                    if duration < 0.0 {
                        return Err(PruningError::NegativeBranchDuration {
                            node,
                            parent,
                            duration,
                            node_height,
                            parent_height,
                        });
                    }
                    ctx.process.flip_matrix_slot(node);
                    self.branches.push(node, duration);
                }
                updated = true;
            }
        }

        let Some([child1, child2]) = ctx.tree.children(node) else {
            return Ok(updated);
        };

        let update1 = self.visit(ctx, hooks, child1, mode)?;
        let update2 = self.visit(ctx, hooks, child2, mode)?;
        if !(update1 || update2) {
            return Ok(updated);
        }

        ctx.partials.claim(node);
        let dest = ctx.partials.slot(node);
        let scale_index = node - ctx.tree.tip_count();
        let (scale_write, scale_read) =
            hooks.handle_scaling_for_node(ctx.scales, &ctx.pass, scale_index, dest);
        self.ops.push(PartialsOp {
            dest,
            scale_write,
            scale_read,
            child1: ctx.partials.slot(child1),
            matrix1: ctx.process.matrix_slot(child1),
            child2: ctx.partials.slot(child2),
            matrix2: ctx.process.matrix_slot(child2),
        });

        if let Some(restrictions) = ctx.restrictions.as_deref_mut() {
            if let Some(restriction) = hooks.handle_restricted_partials(restrictions, ctx.tree, node) {
                self.ops.push_mask(MaskStep {
                    slot: dest,
                    restriction,
                });
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LikelihoodBackend;
    use crate::error::BackendError;
    use crate::hooks::StandardHooks;
    use crate::patterns::{SitePatterns, TipData};
    use crate::process::StrictClock;
    use crate::restriction::PartialsRestriction;
    use crate::tree::SimpleTree;
    use alloc::vec;

    /// Matrix slots without a model behind them.
    struct SlotsOnly(BufferIndexRegistry);

    impl EvolutionaryProcess for SlotsOnly {
        fn state_count(&self) -> usize {
            2
        }
        fn eigen_buffer_count(&self) -> usize {
            0
        }
        fn matrix_buffer_count(&self) -> usize {
            self.0.buffer_count()
        }
        fn matrix_slot(&self, node: usize) -> usize {
            self.0.slot(node)
        }
        fn flip_matrix_slot(&mut self, node: usize) {
            self.0.claim(node);
        }
        fn refresh_models(&mut self, _: &mut dyn LikelihoodBackend) -> Result<(), BackendError> {
            Ok(())
        }
        fn refresh_matrices(
            &mut self,
            _: &mut dyn LikelihoodBackend,
            _: &[usize],
            _: &[f64],
        ) -> Result<(), BackendError> {
            Ok(())
        }
        fn root_state_frequencies(&self) -> Vec<f64> {
            vec![0.5, 0.5]
        }
        fn store_state(&mut self) {
            self.0.store();
        }
        fn restore_state(&mut self) {
            self.0.restore();
        }
    }

    struct Fixture {
        tree: SimpleTree,
        dirty: DirtyTracker,
        process: SlotsOnly,
        partials: BufferIndexRegistry,
        scales: ScaleBuffers,
        restrictions: Option<RestrictionMap>,
        builder: OperationBuilder,
    }

    impl Fixture {
        fn new(newick: &str) -> Self {
            let tree = SimpleTree::from_newick(newick).unwrap();
            let n = tree.node_count();
            let t = tree.tip_count();
            Self {
                dirty: DirtyTracker::new(n),
                process: SlotsOnly(BufferIndexRegistry::new(n, 0)),
                partials: BufferIndexRegistry::new(n, t),
                scales: ScaleBuffers::new(n - t),
                restrictions: None,
                builder: OperationBuilder::default(),
                tree,
            }
        }

        fn build(&mut self, pass: ScalingPass, mode: TraversalMode) -> Result<(), PruningError> {
            let mut ctx = TraversalContext {
                tree: &self.tree,
                dirty: &self.dirty,
                branch_rates: &StrictClock::default(),
                process: &mut self.process,
                partials: &mut self.partials,
                scales: &mut self.scales,
                restrictions: self.restrictions.as_mut(),
                pass,
            };
            self.builder.build(&mut ctx, &mut StandardHooks, mode)
        }
    }

    const NEWICK: &str = "(((A:1,B:1):1,C:2):1,(D:1,E:1):2);";

    #[test]
    fn all_dirty_builds_every_combine_in_post_order() {
        let mut fx = Fixture::new(NEWICK);
        fx.build(ScalingPass::default(), TraversalMode::First)
            .unwrap();
        let ops = &fx.builder.operations().segments()[0].ops;
        // Internal nodes 5..9 are written to their pending halves (+4).
        let dests: Vec<_> = ops.iter().map(|op| op.dest).collect();
        assert_eq!(dests, vec![9, 10, 11, 12]);
        assert_eq!(fx.builder.branch_updates().len(), 8);
        assert_eq!(ops[0].child1, 0);
        assert_eq!(ops[0].matrix1, 9);
        assert_eq!(ops[1].child1, 9);
        assert!(ops.iter().all(|op| op.scale_write.is_none() && op.scale_read.is_none()));
    }

    #[test]
    fn clean_tree_builds_nothing() {
        let mut fx = Fixture::new(NEWICK);
        fx.dirty.clear();
        fx.build(ScalingPass::default(), TraversalMode::First)
            .unwrap();
        assert!(fx.builder.operations().is_empty());
        assert!(fx.builder.branch_updates().is_empty());
    }

    #[test]
    fn one_dirty_tip_recomputes_its_path_to_the_root() {
        let mut fx = Fixture::new(NEWICK);
        fx.dirty.clear();
        fx.partials.store();
        fx.process.store_state();
        fx.dirty.mark_self(2);
        fx.build(ScalingPass::default(), TraversalMode::First)
            .unwrap();

        assert_eq!(fx.builder.branch_updates().nodes(), &[2]);
        assert_eq!(fx.builder.branch_updates().durations(), &[2.0]);
        let ops = &fx.builder.operations().segments()[0].ops;
        // C's parent (6) then the root (8); slots are the pending halves.
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].dest, 6 + 4);
        assert_eq!(ops[0].matrix2, 2 + 9);
        assert_eq!(ops[1].dest, 8 + 4);
        assert_eq!(ops[1].child1, 6 + 4);
        // The untouched sibling subtree is read from its current slots.
        assert_eq!(ops[1].child2, 7);
    }

    #[test]
    fn retry_reuses_claimed_slots_and_skips_branches() {
        let mut fx = Fixture::new(NEWICK);
        fx.dirty.clear();
        fx.partials.store();
        fx.dirty.mark_self(0);
        fx.build(ScalingPass::default(), TraversalMode::First)
            .unwrap();
        let first: Vec<_> = fx.builder.operations().segments()[0]
            .ops
            .iter()
            .map(|op| op.dest)
            .collect();

        fx.dirty.mark_all();
        let pass = ScalingPass {
            use_scale_factors: true,
            recompute: true,
            full_recompute: true,
            delegated: false,
        };
        fx.build(pass, TraversalMode::ScaleRetry).unwrap();
        let retry = &fx.builder.operations().segments()[0].ops;
        assert_eq!(retry.len(), 4);
        // Nodes claimed by the first pass keep their slot.
        for dest in first {
            assert!(retry.iter().any(|op| op.dest == dest));
        }
        assert!(retry.iter().all(|op| op.scale_write.is_some()));
        // Branch updates from the first pass are kept for submission.
        assert_eq!(fx.builder.branch_updates().nodes(), &[0]);
    }

    #[test]
    fn negative_duration_aborts_traversal() {
        let mut fx = Fixture::new(NEWICK);
        // Push the (A,B) ancestor above its parent.
        fx.tree.set_height(5, 3.5);
        let err = fx
            .build(ScalingPass::default(), TraversalMode::First)
            .unwrap_err();
        assert!(matches!(
            err,
            PruningError::NegativeBranchDuration { node: 5, parent: 6, .. }
        ));
    }

    #[test]
    fn restriction_closes_a_segment_after_the_mrca() {
        let mut fx = Fixture::new(NEWICK);
        let mut patterns = SitePatterns::new(2, vec![1.0]);
        for taxon in ["A", "B", "C", "D", "E"] {
            patterns.add_taxon(taxon, TipData::States(vec![0])).unwrap();
        }
        fx.restrictions = Some(
            RestrictionMap::new(
                &[PartialsRestriction::new(["A", "C"], vec![1.0, 0.0])],
                &fx.tree,
                &patterns,
                1,
            )
            .unwrap(),
        );
        fx.build(ScalingPass::default(), TraversalMode::First)
            .unwrap();

        let ops = fx.builder.operations();
        assert_eq!(ops.segments().len(), 2);
        assert_eq!(ops.mask_count(), 1);
        assert_eq!(ops.op_count(), 4);
        let first = &ops.segments()[0];
        assert_eq!(first.ops.last().map(|op| op.dest), Some(10));
        assert_eq!(
            first.mask,
            Some(MaskStep {
                slot: 10,
                restriction: 0
            })
        );
    }
}
