// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sylvan Pruning: an incremental phylogenetic likelihood engine.
//!
//! [`TreeLikelihood`] computes the log-probability of aligned character data
//! given a rooted binary tree, a substitution model, among-site rate
//! categories, and per-branch rates, using Felsenstein's pruning algorithm.
//! The numerical work is delegated to a [`LikelihoodBackend`]; this crate
//! owns the bookkeeping around it:
//!
//! - **Dirty tracking** ([`DirtyTracker`]): which nodes changed since the
//!   last evaluation, and which model-level uploads are pending.
//! - **Double buffering** ([`BufferIndexRegistry`]): every cached quantity
//!   has two backend slots, so a rejected proposal is undone by swapping
//!   slot assignments instead of recomputing.
//! - **Traversal** ([`OperationBuilder`]): a post-order walk that turns dirty
//!   flags into one batched list of combine operations and one batch of
//!   transition-matrix updates.
//! - **Rescaling** ([`RescalingPolicy`], [`ScaleBuffers`]): five strategies
//!   for keeping partial likelihoods away from floating-point underflow,
//!   including a single forced-rescaling retry when a result is non-finite.
//! - **Restrictions** ([`RestrictionMap`]): per-clade masks multiplied into
//!   the partials at the common ancestor of a taxon set.
//! - **Hooks** ([`EvaluationHooks`]): the overridable steps of an evaluation.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sylvan_pruning::{
//!     BackendError, BufferLayout, EigenDecomposition, LikelihoodBackend, PartialsOp,
//!     SimpleTree, SitePatterns, SubstitutionModel, TipData, TreeLikelihoodBuilder,
//! };
//!
//! # struct Constant;
//! # impl LikelihoodBackend for Constant {
//! #     fn allocate(&mut self, _: &BufferLayout) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_tip_states(&mut self, _: usize, _: &[u32]) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_tip_partials(&mut self, _: usize, _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_pattern_weights(&mut self, _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_eigen_decomposition(&mut self, _: usize, _: &EigenDecomposition) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_category_rates(&mut self, _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_category_weights(&mut self, _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_state_frequencies(&mut self, _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn set_auto_scaling(&mut self, _: bool) -> Result<(), BackendError> { Ok(()) }
//! #     fn update_transition_matrices(&mut self, _: usize, _: &[usize], _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn update_partials(&mut self, _: &[PartialsOp], _: Option<usize>) -> Result<(), BackendError> { Ok(()) }
//! #     fn multiply_partials(&mut self, _: usize, _: &[f64]) -> Result<(), BackendError> { Ok(()) }
//! #     fn reset_scale_factors(&mut self, _: usize) -> Result<(), BackendError> { Ok(()) }
//! #     fn accumulate_scale_factors(&mut self, _: &[usize], _: Option<usize>) -> Result<(), BackendError> { Ok(()) }
//! #     fn root_log_likelihood(&mut self, _: usize, _: Option<usize>) -> Result<f64, BackendError> { Ok(-4.2) }
//! #     fn site_log_likelihoods(&self, out: &mut [f64]) -> Result<(), BackendError> { out.fill(-2.1); Ok(()) }
//! # }
//! # struct Binary;
//! # impl SubstitutionModel for Binary {
//! #     fn state_count(&self) -> usize { 2 }
//! #     fn eigen_decomposition(&self) -> Result<EigenDecomposition, BackendError> {
//! #         EigenDecomposition::new(vec![0.0, -2.0], vec![1.0, 1.0, 1.0, -1.0], vec![0.5, 0.5, 0.5, -0.5])
//! #     }
//! #     fn frequencies(&self) -> Vec<f64> { vec![0.5, 0.5] }
//! # }
//! let tree = SimpleTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
//! let patterns = SitePatterns::new(2, vec![1.0, 1.0])
//!     .with_taxon("A", TipData::States(vec![0, 1])).unwrap()
//!     .with_taxon("B", TipData::States(vec![0, 0])).unwrap()
//!     .with_taxon("C", TipData::States(vec![1, 1])).unwrap();
//!
//! let mut likelihood = TreeLikelihoodBuilder::new(Constant, patterns, Arc::new(Binary))
//!     .build(&tree)
//!     .unwrap();
//!
//! let before = likelihood.evaluate(&tree).unwrap();
//! likelihood.store_state();
//!
//! // Propose a change, report it, evaluate, then reject.
//! likelihood
//!     .set_tip_data("C", TipData::States(vec![0, 0]))
//!     .unwrap();
//! likelihood.evaluate(&tree).unwrap();
//! likelihood.restore_state().unwrap();
//! assert!(likelihood.is_known());
//! assert_eq!(likelihood.evaluate(&tree).unwrap(), before);
//! ```
//!
//! A complete CPU backend and a few small models for testing live in the
//! `sylvan_pruning_ref` crate.
//!
//! ## `no_std` Support
//!
//! This crate is `no_std` and uses `alloc`. Floating-point functions come
//! from `std` (the default) or from [`libm`] with the `libm` feature.
//!
//! ## Features
//!
//! - `std` (default): use the standard library's float functions and
//!   `std::error::Error`.
//! - `libm`: use `libm` for float functions in `no_std` builds.
//! - `serde`: `Serialize`/`Deserialize` for [`LikelihoodConfig`],
//!   [`RescalingScheme`], [`PartialsRestriction`], and [`Ascertainment`].
//!
//! [`libm`]: https://docs.rs/libm

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

mod backend;
mod buffers;
mod config;
mod dirty;
mod engine;
mod error;
mod hooks;
mod math;
mod metrics;
mod patterns;
mod process;
mod rescaling;
mod restriction;
mod traversal;
mod tree;

pub use backend::{BufferLayout, EigenDecomposition, LikelihoodBackend, PartialsOp};
pub use buffers::BufferIndexRegistry;
pub use config::LikelihoodConfig;
pub use dirty::{DirtyTracker, RefreshFlags};
pub use engine::{TreeLikelihood, TreeLikelihoodBuilder};
pub use error::{BackendError, PruningError, TreeError};
pub use hooks::{EvaluationHooks, PendingTips, StandardHooks};
pub use metrics::{EvaluationStats, MetricsSink, NoopMetrics, OperationCounter};
pub use patterns::{Ascertainment, SitePatterns, TipData};
pub use process::{
    BranchRateModel, DiscreteRates, EvolutionaryProcess, HomogeneousProcess, SiteRateModel,
    StrictClock, SubstitutionModel,
};
pub use rescaling::{
    DEFAULT_RESCALING_FREQUENCY, ParseSchemeError, RescalingPolicy, RescalingScheme, ScaleBuffers,
    ScalingPass,
};
pub use restriction::{PartialsRestriction, RestrictionMap};
pub use traversal::{
    BranchUpdates, MaskStep, OpSegment, OperationBuilder, OperationList, TraversalContext,
    TraversalMode,
};
pub use tree::{SimpleTree, TreeChange, TreeTopology, common_ancestor};
