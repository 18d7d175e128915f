// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The likelihood cache and evaluation orchestrator.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use crate::backend::{BufferLayout, LikelihoodBackend};
use crate::buffers::BufferIndexRegistry;
use crate::config::LikelihoodConfig;
use crate::dirty::{DirtyTracker, RefreshFlags};
use crate::error::{BackendError, PruningError};
use crate::hooks::{EvaluationHooks, PendingTips, StandardHooks};
use crate::metrics::{EvaluationStats, MetricsSink, NoopMetrics};
use crate::patterns::{SitePatterns, TipData, TipStore};
use crate::process::{
    BranchRateModel, DiscreteRates, EvolutionaryProcess, HomogeneousProcess, SiteRateModel,
    StrictClock, SubstitutionModel,
};
use crate::rescaling::{RescalingPolicy, RescalingScheme, ScaleBuffers, ScalingPass};
use crate::restriction::RestrictionMap;
use crate::traversal::{OperationBuilder, OperationList, TraversalContext, TraversalMode};
use crate::tree::{TreeChange, TreeTopology};

enum ProcessSource {
    Model(Arc<dyn SubstitutionModel>),
    Custom(Box<dyn EvolutionaryProcess>),
}

/// Configures and constructs a [`TreeLikelihood`].
///
/// Defaults: one rate category with rate one, a strict clock with rate one,
/// [`LikelihoodConfig::default`], [`StandardHooks`], and [`NoopMetrics`].
pub struct TreeLikelihoodBuilder<B, H = StandardHooks> {
    backend: B,
    patterns: SitePatterns,
    process: ProcessSource,
    site_rates: Arc<dyn SiteRateModel>,
    branch_rates: Arc<dyn BranchRateModel>,
    config: LikelihoodConfig,
    hooks: H,
    metrics: Box<dyn MetricsSink>,
}

impl<B, H> fmt::Debug for TreeLikelihoodBuilder<B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLikelihoodBuilder")
            .field("patterns", &self.patterns.pattern_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: LikelihoodBackend> TreeLikelihoodBuilder<B> {
    /// Starts a builder for one data partition under a homogeneous substitution model.
    pub fn new(backend: B, patterns: SitePatterns, model: Arc<dyn SubstitutionModel>) -> Self {
        Self {
            backend,
            patterns,
            process: ProcessSource::Model(model),
            site_rates: Arc::new(DiscreteRates::single()),
            branch_rates: Arc::new(StrictClock::default()),
            config: LikelihoodConfig::default(),
            hooks: StandardHooks,
            metrics: Box::new(NoopMetrics),
        }
    }
}

impl<B: LikelihoodBackend, H: EvaluationHooks> TreeLikelihoodBuilder<B, H> {
    /// Replaces the homogeneous process with a custom one.
    #[must_use]
    pub fn process(mut self, process: Box<dyn EvolutionaryProcess>) -> Self {
        self.process = ProcessSource::Custom(process);
        self
    }

    /// Sets the site-rate model.
    #[must_use]
    pub fn site_rates(mut self, site_rates: Arc<dyn SiteRateModel>) -> Self {
        self.site_rates = site_rates;
        self
    }

    /// Sets the branch-rate model.
    #[must_use]
    pub fn branch_rates(mut self, branch_rates: Arc<dyn BranchRateModel>) -> Self {
        self.branch_rates = branch_rates;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: LikelihoodConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn metrics(mut self, metrics: impl MetricsSink + 'static) -> Self {
        self.metrics = Box::new(metrics);
        self
    }

    /// Replaces the evaluation hooks.
    pub fn hooks<H2: EvaluationHooks>(self, hooks: H2) -> TreeLikelihoodBuilder<B, H2> {
        TreeLikelihoodBuilder {
            backend: self.backend,
            patterns: self.patterns,
            process: self.process,
            site_rates: self.site_rates,
            branch_rates: self.branch_rates,
            config: self.config,
            hooks,
            metrics: self.metrics,
        }
    }

    /// Validates the inputs against `tree`, allocates backend buffers, and
    /// uploads the observed data.
    ///
    /// The node count and tip numbering of `tree` are fixed for the lifetime
    /// of the engine.
    pub fn build(self, tree: &dyn TreeTopology) -> Result<TreeLikelihood<B, H>, PruningError> {
        let Self {
            mut backend,
            patterns,
            process,
            site_rates,
            branch_rates,
            config,
            hooks,
            metrics,
        } = self;

        check_binary(tree)?;
        let node_count = tree.node_count();
        let tip_count = tree.tip_count();

        let process = match process {
            ProcessSource::Model(model) => {
                Box::new(HomogeneousProcess::new(model, node_count)) as Box<dyn EvolutionaryProcess>
            }
            ProcessSource::Custom(process) => process,
        };
        if process.state_count() != patterns.state_count() {
            return Err(PruningError::StateCountMismatch {
                patterns: patterns.state_count(),
                process: process.state_count(),
            });
        }

        let mut rows = Vec::with_capacity(tip_count);
        for tip in 0..tip_count {
            let taxon = tree.taxon(tip).ok_or(PruningError::UnlabelledTip { tip })?;
            let row = patterns
                .taxon_index(taxon)
                .ok_or_else(|| PruningError::MissingTaxon {
                    taxon: taxon.to_string(),
                })?;
            rows.push(row);
        }

        let category_count = site_rates.category_count();
        let restrictions = if config.restrictions.is_empty() {
            None
        } else {
            Some(RestrictionMap::new(
                &config.restrictions,
                tree,
                &patterns,
                category_count,
            )?)
        };

        let partials = BufferIndexRegistry::new(node_count, tip_count);
        let scales = ScaleBuffers::new(node_count - tip_count);
        let layout = BufferLayout {
            tip_count,
            partials_buffers: partials.buffer_count(),
            state_count: patterns.state_count(),
            pattern_count: patterns.pattern_count(),
            category_count,
            eigen_buffers: process.eigen_buffer_count(),
            matrix_buffers: process.matrix_buffer_count(),
            scale_buffers: scales.buffer_count(),
        };
        backend.allocate(&layout)?;

        let mut policy = RescalingPolicy::new(config.rescaling, config.rescaling_frequency);
        if policy.scheme() == RescalingScheme::Delegated {
            match backend.set_auto_scaling(true) {
                Ok(()) => {}
                Err(BackendError::Unsupported(_)) => {
                    log::warn!(
                        "Backend cannot rescale automatically; falling back to dynamic rescaling"
                    );
                    policy.set_scheme(RescalingScheme::Dynamic);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut tips = TipStore::new(rows, patterns.taxon_count(), config.use_ambiguities);
        tips.upload_all(&patterns, &mut backend)?;
        backend.set_pattern_weights(patterns.weights())?;

        log::info!(
            "Tree likelihood over {} patterns, {} tips, {} rate categories; {} rescaling{}",
            patterns.pattern_count(),
            tip_count,
            category_count,
            policy.scheme(),
            if policy.scheme() == RescalingScheme::Dynamic {
                alloc::format!(" every {} evaluations", policy.frequency())
            } else {
                String::new()
            },
        );
        if let Some(ascertainment) = patterns.ascertainment() {
            log::info!(
                "Ascertainment correction excludes patterns {:?}",
                ascertainment.excluded
            );
        }
        if let Some(restrictions) = &restrictions {
            log::info!("{} partials restriction(s) in use", restrictions.len());
        }

        let pattern_count = patterns.pattern_count();
        Ok(TreeLikelihood {
            backend,
            hooks,
            process,
            site_rates,
            branch_rates,
            patterns,
            tips,
            config,
            partials,
            scales,
            dirty: DirtyTracker::new(node_count),
            policy,
            restrictions,
            builder: OperationBuilder::default(),
            metrics,
            node_count,
            tip_count,
            log_likelihood: f64::NEG_INFINITY,
            stored_log_likelihood: f64::NEG_INFINITY,
            pattern_log_likelihoods: vec![0.0; pattern_count],
            stored_pattern_log_likelihoods: vec![0.0; pattern_count],
            evaluations: 0,
        })
    }
}

fn check_binary(tree: &dyn TreeTopology) -> Result<(), PruningError> {
    let tip_count = tree.tip_count();
    if tip_count < 2 || tree.node_count() != 2 * tip_count - 1 {
        return Err(PruningError::NotBinary { node: tree.root() });
    }
    for node in 0..tree.node_count() {
        let binary_internal = tree.children(node).is_some();
        if binary_internal == tree.is_tip(node) {
            return Err(PruningError::NotBinary { node });
        }
    }
    Ok(())
}

/// Incrementally evaluated log-likelihood of one data partition on a tree.
///
/// The engine caches partial likelihoods per node in double-buffered backend
/// slots and recomputes only what changed since the last evaluation. A
/// sampler drives it through a fixed cycle:
///
/// 1. [`store_state`](Self::store_state) before proposing,
/// 2. change the tree or models and report it
///    ([`tree_changed`](Self::tree_changed),
///    [`substitution_changed`](Self::substitution_changed), …),
/// 3. [`evaluate`](Self::evaluate), any number of times,
/// 4. accept, or reject with [`restore_state`](Self::restore_state).
///
/// Restoring never recomputes anything: it swaps slot assignments back.
pub struct TreeLikelihood<B, H = StandardHooks> {
    backend: B,
    hooks: H,
    process: Box<dyn EvolutionaryProcess>,
    site_rates: Arc<dyn SiteRateModel>,
    branch_rates: Arc<dyn BranchRateModel>,
    patterns: SitePatterns,
    tips: TipStore,
    config: LikelihoodConfig,
    partials: BufferIndexRegistry,
    scales: ScaleBuffers,
    dirty: DirtyTracker,
    policy: RescalingPolicy,
    restrictions: Option<RestrictionMap>,
    builder: OperationBuilder,
    metrics: Box<dyn MetricsSink>,
    node_count: usize,
    tip_count: usize,
    log_likelihood: f64,
    stored_log_likelihood: f64,
    pattern_log_likelihoods: Vec<f64>,
    stored_pattern_log_likelihoods: Vec<f64>,
    evaluations: u64,
}

impl<B, H> fmt::Debug for TreeLikelihood<B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLikelihood")
            .field("node_count", &self.node_count)
            .field("tip_count", &self.tip_count)
            .field("log_likelihood", &self.log_likelihood)
            .field("known", &self.dirty.likelihood_known())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<B: LikelihoodBackend, H: EvaluationHooks> TreeLikelihood<B, H> {
    // ----- Sampler-facing operations -----

    /// Returns the log-likelihood of the data on `tree`.
    ///
    /// If nothing changed since the last evaluation the cached value is
    /// returned without touching the backend. A result that stays
    /// non-finite after the permitted rescaling retry is reported as `-∞`,
    /// not as an error.
    pub fn evaluate(&mut self, tree: &dyn TreeTopology) -> Result<f64, PruningError> {
        if self.dirty.likelihood_known() {
            self.metrics.cache_hit();
            return Ok(self.log_likelihood);
        }
        self.check_shape(tree)?;
        if self.dirty.needs(RefreshFlags::RESTRICTIONS) {
            if let Some(restrictions) = &mut self.restrictions {
                restrictions.invalidate();
            }
        }

        let rates = if self.dirty.needs(RefreshFlags::SITE_RATES) {
            let Some(rates) = self.site_rates.category_rates() else {
                log::debug!("Site-rate model rejected its parameters; log-likelihood is -inf");
                return Ok(f64::NEG_INFINITY);
            };
            Some(rates)
        } else {
            None
        };

        let mut pass = self
            .hooks
            .prepare_scaling_for_evaluation(&mut self.policy, &mut self.dirty);
        let mut stats = EvaluationStats::default();
        let result = self.run_passes(tree, rates.as_deref(), &mut pass, &mut stats);
        let log_likelihood = match result {
            Ok(value) => value,
            Err(err) => {
                // Slots claimed for fresh factors may never have been written.
                if pass.recompute || pass.full_recompute {
                    self.policy.request_full_recompute();
                }
                return Err(err);
            }
        };

        log::trace!(
            "Evaluation {}: {} matrices, {} partials ops, {} masks{} -> {}",
            self.evaluations,
            stats.matrix_updates,
            stats.partials_ops,
            stats.masks,
            if stats.retried { " (rescaled)" } else { "" },
            log_likelihood
        );
        self.evaluations += 1;
        self.metrics.evaluation(&stats);
        self.scales.set_scaled(pass.use_scale_factors);
        self.dirty.clear();
        self.log_likelihood = log_likelihood;
        Ok(log_likelihood)
    }

    /// Traversal, uploads, and the root read, including the rescaling retry.
    fn run_passes(
        &mut self,
        tree: &dyn TreeTopology,
        rates: Option<&[f64]>,
        pass: &mut ScalingPass,
        stats: &mut EvaluationStats,
    ) -> Result<f64, PruningError> {
        self.build_operations(tree, *pass, TraversalMode::First)?;

        let mut tips = PendingTips {
            store: &mut self.tips,
            patterns: &self.patterns,
            backend: &mut self.backend,
        };
        self.hooks.prepare_tip_refresh(&mut tips)?;
        if self.dirty.needs(RefreshFlags::SUBSTITUTION) {
            self.process.refresh_models(&mut self.backend)?;
        }
        if let Some(rates) = rates {
            self.backend.set_category_rates(rates)?;
        }
        self.hooks.update_branch_process(
            &mut *self.process,
            &mut self.backend,
            self.builder.branch_updates(),
        )?;

        stats.matrix_updates = self.builder.branch_updates().len();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.submit_operations()?;
            stats.partials_ops += self.builder.operations().op_count();
            stats.masks += self.builder.operations().mask_count();

            let cumulative =
                self.hooks
                    .accumulate_scale_factors(&mut self.scales, pass, &mut self.backend)?;
            self.hooks.update_root_ancillary_state(
                &*self.site_rates,
                &*self.process,
                &mut self.backend,
            )?;
            let root = self.partials.slot(tree.root());
            let raw = self.backend.root_log_likelihood(root, cumulative)?;
            self.backend
                .site_log_likelihoods(&mut self.pattern_log_likelihoods)?;
            if raw.is_finite() {
                return Ok(match self.patterns.ascertainment() {
                    Some(ascertainment) => ascertainment.corrected_log_likelihood(
                        &self.pattern_log_likelihoods,
                        self.patterns.weights(),
                    ),
                    None => raw,
                });
            }

            self.policy.record_underflow();
            if !self.hooks.should_retry_with_rescaling(&self.policy, attempt) {
                return Ok(f64::NEG_INFINITY);
            }
            self.metrics.rescue();
            if self.policy.note_rescue() {
                log::info!(
                    "Underflow calculating likelihood; attempting a rescaling (rescue {})",
                    self.policy.rescue_count()
                );
            }
            stats.retried = true;
            *pass = self.policy.retry_pass();
            self.dirty.mark_all();
            self.build_operations(tree, *pass, TraversalMode::ScaleRetry)?;
        }
    }

    fn check_shape(&self, tree: &dyn TreeTopology) -> Result<(), PruningError> {
        if tree.node_count() != self.node_count || tree.tip_count() != self.tip_count {
            return Err(PruningError::TopologyMismatch {
                nodes: tree.node_count(),
                tips: tree.tip_count(),
                expected_nodes: self.node_count,
                expected_tips: self.tip_count,
            });
        }
        Ok(())
    }

    fn build_operations(
        &mut self,
        tree: &dyn TreeTopology,
        pass: ScalingPass,
        mode: TraversalMode,
    ) -> Result<(), PruningError> {
        let mut ctx = TraversalContext {
            tree,
            dirty: &self.dirty,
            branch_rates: &*self.branch_rates,
            process: &mut *self.process,
            partials: &mut self.partials,
            scales: &mut self.scales,
            restrictions: self.restrictions.as_mut(),
            pass,
        };
        self.builder.build(&mut ctx, &mut self.hooks, mode)
    }

    fn submit_operations(&mut self) -> Result<(), PruningError> {
        for segment in self.builder.operations().segments() {
            if !segment.ops.is_empty() {
                self.backend.update_partials(&segment.ops, None)?;
            }
            if let (Some(step), Some(restrictions)) = (segment.mask, &self.restrictions) {
                self.backend
                    .multiply_partials(step.slot, restrictions.mask(step.restriction))?;
            }
        }
        Ok(())
    }

    /// Marks every node dirty and schedules every model refresh.
    pub fn invalidate_all(&mut self) {
        self.dirty.mark_all();
        self.dirty.request(RefreshFlags::all());
    }

    /// Snapshots everything a rejected proposal must be able to return to.
    pub fn store_state(&mut self) {
        self.partials.store();
        self.process.store_state();
        self.scales.store();
        self.dirty.store();
        self.tips.store();
        self.stored_log_likelihood = self.log_likelihood;
        self.stored_pattern_log_likelihoods
            .copy_from_slice(&self.pattern_log_likelihoods);
    }

    /// Returns to the last [`store_state`](Self::store_state).
    ///
    /// Slot assignments are swapped back, so the stored partials become
    /// current again without recomputation. Tip data changed since the
    /// store is reverted and uploaded again.
    pub fn restore_state(&mut self) -> Result<(), PruningError> {
        self.partials.restore();
        self.process.restore_state();
        self.scales.restore();
        self.dirty.restore();
        self.tips.restore(&mut self.patterns, &mut self.backend)?;
        core::mem::swap(&mut self.log_likelihood, &mut self.stored_log_likelihood);
        core::mem::swap(
            &mut self.pattern_log_likelihoods,
            &mut self.stored_pattern_log_likelihoods,
        );
        // Category rates in the backend may belong to the rejected state,
        // and the restored topology may map restrictions differently.
        self.dirty
            .schedule(RefreshFlags::SITE_RATES | RefreshFlags::RESTRICTIONS);
        if !self.scales.is_scaled() && self.policy.uses_scale_factors() {
            self.policy.request_full_recompute();
        }
        Ok(())
    }

    /// Returns `true` if [`evaluate`](Self::evaluate) would return a cached value.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.dirty.likelihood_known()
    }

    /// Multi-line human-readable summary of the engine.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Tree likelihood");
        let _ = writeln!(
            out,
            "  {} nodes, {} tips, {} patterns, {} states, {} rate categories",
            self.node_count,
            self.tip_count,
            self.patterns.pattern_count(),
            self.patterns.state_count(),
            self.site_rates.category_count()
        );
        let _ = writeln!(
            out,
            "  rescaling: {} (frequency {}, underflowed: {}, rescues: {})",
            self.policy.scheme(),
            self.policy.frequency(),
            self.policy.ever_underflowed(),
            self.policy.rescue_count()
        );
        if let Some(ascertainment) = self.patterns.ascertainment() {
            let _ = writeln!(
                out,
                "  ascertainment: patterns {:?} excluded",
                ascertainment.excluded
            );
        }
        if let Some(restrictions) = &self.restrictions {
            let _ = writeln!(out, "  restrictions: {}", restrictions.len());
        }
        let _ = writeln!(out, "  evaluations: {}", self.evaluations);
        let _ = write!(
            out,
            "  log-likelihood: {}{}",
            self.log_likelihood,
            if self.is_known() { "" } else { " (stale)" }
        );
        out
    }

    // ----- Change notifications -----

    /// Reports a change to the tree.
    pub fn tree_changed(&mut self, tree: &dyn TreeTopology, change: TreeChange) {
        match change {
            TreeChange::NodeChanged(node) => self.dirty.mark_self_and_children(tree, node),
            TreeChange::SubtreeChanged(node) => self.dirty.mark_self_and_descendants(tree, node),
            TreeChange::TreeReplaced => self.dirty.mark_all(),
            TreeChange::AnnotationChanged => {}
        }
        if change.affects_topology() && self.restrictions.is_some() {
            self.dirty.request(RefreshFlags::RESTRICTIONS);
        }
    }

    /// Reports a branch-rate change on the branch above `node`, or on every
    /// branch for `None`.
    pub fn branch_rates_changed(&mut self, node: Option<usize>) {
        match node {
            Some(node) => {
                self.dirty.mark_self(node);
            }
            None => self.dirty.mark_all(),
        }
    }

    /// Reports a substitution-model change on the branch above `node`, or
    /// a global change for `None`.
    pub fn substitution_changed(&mut self, node: Option<usize>) {
        match node {
            Some(node) => {
                self.dirty.mark_self(node);
            }
            None => {
                self.dirty.request(RefreshFlags::SUBSTITUTION);
                self.dirty.mark_all();
            }
        }
    }

    /// Reports a site-rate model change.
    pub fn site_rates_changed(&mut self) {
        self.dirty.request(RefreshFlags::SITE_RATES);
        self.dirty.mark_all();
    }

    /// Replaces the observed data of `taxon` and marks its tip dirty.
    ///
    /// The new data is uploaded at the next evaluation.
    pub fn set_tip_data(&mut self, taxon: &str, data: TipData) -> Result<(), PruningError> {
        let row = self
            .patterns
            .taxon_index(taxon)
            .ok_or_else(|| PruningError::UnknownTaxon {
                taxon: taxon.to_string(),
            })?;
        if let Some(tip) = self.tips.replace(&mut self.patterns, row, data)? {
            self.dirty.mark_self(tip);
        }
        Ok(())
    }

    // ----- Accessors -----

    /// The last computed log-likelihood, which may be stale.
    #[must_use]
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Per-pattern log-likelihoods of the last evaluation, before any
    /// ascertainment correction.
    #[must_use]
    pub fn pattern_log_likelihoods(&self) -> &[f64] {
        &self.pattern_log_likelihoods
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    ///
    /// Writing to buffers the engine owns invalidates its cache silently;
    /// call [`invalidate_all`](Self::invalidate_all) afterwards if you do.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The evaluation hooks.
    #[must_use]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// The observed data.
    #[must_use]
    pub fn patterns(&self) -> &SitePatterns {
        &self.patterns
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    /// The rescaling state machine.
    #[must_use]
    pub fn rescaling_policy(&self) -> &RescalingPolicy {
        &self.policy
    }

    /// Operations submitted by the last traversal.
    #[must_use]
    pub fn last_operations(&self) -> &OperationList {
        self.builder.operations()
    }

    /// Dirty flags.
    #[must_use]
    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }
}
