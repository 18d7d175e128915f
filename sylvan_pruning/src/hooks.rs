// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Customization points of an evaluation.
//!
//! [`TreeLikelihood`](crate::TreeLikelihood) runs one fixed sequence of
//! steps. Each step that a variant engine may want to change is a default
//! method of [`EvaluationHooks`]; a custom hook type overrides only the
//! steps it needs and inherits the rest.

use crate::backend::LikelihoodBackend;
use crate::dirty::DirtyTracker;
use crate::error::PruningError;
use crate::patterns::{SitePatterns, TipStore};
use crate::process::{EvolutionaryProcess, SiteRateModel};
use crate::rescaling::{RescalingPolicy, ScaleBuffers, ScalingPass};
use crate::restriction::RestrictionMap;
use crate::traversal::BranchUpdates;
use crate::tree::TreeTopology;

/// Tips whose observed data changed since the last evaluation.
pub struct PendingTips<'a> {
    pub(crate) store: &'a mut TipStore,
    pub(crate) patterns: &'a SitePatterns,
    pub(crate) backend: &'a mut dyn LikelihoodBackend,
}

impl core::fmt::Debug for PendingTips<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingTips")
            .field("has_pending", &self.store.has_pending())
            .finish_non_exhaustive()
    }
}

impl PendingTips<'_> {
    /// Returns `true` if any tip is waiting for upload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.store.has_pending()
    }

    /// Uploads every pending tip to the backend.
    pub fn upload(&mut self) -> Result<(), PruningError> {
        self.store.upload_pending(self.patterns, self.backend)
    }
}

/// Overridable steps of an evaluation.
///
/// Every method has the standard behavior as its default.
pub trait EvaluationHooks {
    /// Decides how this evaluation uses scale factors.
    ///
    /// A full recompute marks every node dirty.
    fn prepare_scaling_for_evaluation(
        &mut self,
        policy: &mut RescalingPolicy,
        dirty: &mut DirtyTracker,
    ) -> ScalingPass {
        let pass = policy.begin_evaluation();
        if pass.full_recompute {
            dirty.mark_all();
        }
        pass
    }

    /// Uploads changed tip data.
    fn prepare_tip_refresh(&mut self, tips: &mut PendingTips<'_>) -> Result<(), PruningError> {
        if tips.is_empty() {
            return Ok(());
        }
        tips.upload()
    }

    /// Recomputes transition matrices for changed branches.
    fn update_branch_process(
        &mut self,
        process: &mut dyn EvolutionaryProcess,
        backend: &mut dyn LikelihoodBackend,
        updates: &BranchUpdates,
    ) -> Result<(), PruningError> {
        if updates.is_empty() {
            return Ok(());
        }
        process.refresh_matrices(backend, updates.nodes(), updates.durations())?;
        Ok(())
    }

    /// Chooses the scale buffers a recomputed node writes or reads.
    fn handle_scaling_for_node(
        &mut self,
        scales: &mut ScaleBuffers,
        pass: &ScalingPass,
        scale_index: usize,
        partials_slot: usize,
    ) -> (Option<usize>, Option<usize>) {
        scales.node_io(pass, scale_index, partials_slot)
    }

    /// Returns the restriction to apply at `node`, if any.
    fn handle_restricted_partials(
        &mut self,
        restrictions: &mut RestrictionMap,
        tree: &dyn TreeTopology,
        node: usize,
    ) -> Option<usize> {
        restrictions.mask_for(tree, node)
    }

    /// Accumulates scale factors; returns the cumulative buffer for the root.
    fn accumulate_scale_factors(
        &mut self,
        scales: &mut ScaleBuffers,
        pass: &ScalingPass,
        backend: &mut dyn LikelihoodBackend,
    ) -> Result<Option<usize>, PruningError> {
        Ok(scales.accumulate(pass, backend)?)
    }

    /// Uploads root-level quantities: category weights and root frequencies.
    fn update_root_ancillary_state(
        &mut self,
        site_rates: &dyn SiteRateModel,
        process: &dyn EvolutionaryProcess,
        backend: &mut dyn LikelihoodBackend,
    ) -> Result<(), PruningError> {
        backend.set_category_weights(&site_rates.category_proportions())?;
        backend.set_state_frequencies(&process.root_state_frequencies())?;
        Ok(())
    }

    /// Decides whether a non-finite result is retried under forced rescaling.
    ///
    /// `attempt` counts completed attempts, so the first failure sees `1`.
    fn should_retry_with_rescaling(&mut self, policy: &RescalingPolicy, attempt: u32) -> bool {
        attempt == 1 && policy.permits_retry()
    }
}

/// The standard evaluation, with every hook at its default.
#[derive(Copy, Clone, Debug, Default)]
pub struct StandardHooks;

impl EvaluationHooks for StandardHooks {}
