// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Substitution, site-rate, and branch-rate collaborators.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::backend::{EigenDecomposition, LikelihoodBackend};
use crate::buffers::BufferIndexRegistry;
use crate::error::BackendError;
use crate::tree::TreeTopology;

/// A continuous-time Markov substitution model.
///
/// Implementations must be safe for concurrent reads; engines for separate
/// data partitions may share one model.
pub trait SubstitutionModel: Send + Sync {
    /// Number of character states.
    fn state_count(&self) -> usize;
    /// Current eigen decomposition of the rate matrix.
    fn eigen_decomposition(&self) -> Result<EigenDecomposition, BackendError>;
    /// Equilibrium state frequencies, used at the root.
    fn frequencies(&self) -> Vec<f64>;
}

/// Discrete among-site rate heterogeneity.
pub trait SiteRateModel: Send + Sync {
    /// Number of rate categories.
    fn category_count(&self) -> usize;
    /// Relative rate of each category.
    ///
    /// `None` means the current parameters are invalid; the evaluation then
    /// reports a log-likelihood of `-∞`.
    fn category_rates(&self) -> Option<Vec<f64>>;
    /// Weight of each category.
    fn category_proportions(&self) -> Vec<f64>;
}

/// Per-branch rate multipliers (a molecular clock model).
pub trait BranchRateModel: Send + Sync {
    /// Rate on the branch above `node`.
    fn rate(&self, tree: &dyn TreeTopology, node: usize) -> f64;
}

/// The same rate on every branch.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StrictClock {
    /// Rate on every branch.
    pub rate: f64,
}

impl Default for StrictClock {
    fn default() -> Self {
        Self { rate: 1.0 }
    }
}

impl BranchRateModel for StrictClock {
    fn rate(&self, _tree: &dyn TreeTopology, _node: usize) -> f64 {
        self.rate
    }
}

/// Fixed rate categories.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscreteRates {
    rates: Vec<f64>,
    proportions: Vec<f64>,
}

impl DiscreteRates {
    /// A single category with rate one.
    #[must_use]
    pub fn single() -> Self {
        Self {
            rates: vec![1.0],
            proportions: vec![1.0],
        }
    }

    /// Categories with the given rates and weights.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length or are empty.
    #[must_use]
    pub fn new(rates: Vec<f64>, proportions: Vec<f64>) -> Self {
        assert!(!rates.is_empty(), "at least one rate category is required");
        assert_eq!(rates.len(), proportions.len(), "one proportion per rate category");
        Self { rates, proportions }
    }

    /// Equally weighted categories.
    #[must_use]
    pub fn equal(rates: Vec<f64>) -> Self {
        let weight = 1.0 / rates.len() as f64;
        let proportions = vec![weight; rates.len()];
        Self::new(rates, proportions)
    }
}

impl SiteRateModel for DiscreteRates {
    fn category_count(&self) -> usize {
        self.rates.len()
    }

    fn category_rates(&self) -> Option<Vec<f64>> {
        self.rates
            .iter()
            .all(|r| r.is_finite() && *r >= 0.0)
            .then(|| self.rates.clone())
    }

    fn category_proportions(&self) -> Vec<f64> {
        self.proportions.clone()
    }
}

/// How transition matrices are produced for each branch.
///
/// The process owns the matrix and eigen slot registries, so it takes part
/// in the engine's store/restore cycle.
pub trait EvolutionaryProcess: Send {
    /// Number of character states.
    fn state_count(&self) -> usize;
    /// Eigen buffers to allocate.
    fn eigen_buffer_count(&self) -> usize;
    /// Transition matrix buffers to allocate.
    fn matrix_buffer_count(&self) -> usize;
    /// Current matrix buffer for the branch above `node`.
    fn matrix_slot(&self, node: usize) -> usize;
    /// Moves `node` to a matrix buffer that the stored state does not use.
    fn flip_matrix_slot(&mut self, node: usize);
    /// Uploads model parameters (eigen decomposition) after a model change.
    fn refresh_models(&mut self, backend: &mut dyn LikelihoodBackend) -> Result<(), BackendError>;
    /// Computes transition matrices for the given branches.
    fn refresh_matrices(
        &mut self,
        backend: &mut dyn LikelihoodBackend,
        nodes: &[usize],
        durations: &[f64],
    ) -> Result<(), BackendError>;
    /// State frequencies at the root.
    fn root_state_frequencies(&self) -> Vec<f64>;
    /// Snapshots slot assignments.
    fn store_state(&mut self);
    /// Restores the last snapshot.
    fn restore_state(&mut self);
}

/// One substitution model on every branch.
pub struct HomogeneousProcess {
    model: Arc<dyn SubstitutionModel>,
    matrices: BufferIndexRegistry,
    eigens: BufferIndexRegistry,
    slots: Vec<usize>,
}

impl fmt::Debug for HomogeneousProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HomogeneousProcess")
            .field("state_count", &self.model.state_count())
            .field("matrices", &self.matrices)
            .field("eigens", &self.eigens)
            .finish_non_exhaustive()
    }
}

impl HomogeneousProcess {
    /// Creates a process for a tree of `node_count` nodes.
    #[must_use]
    pub fn new(model: Arc<dyn SubstitutionModel>, node_count: usize) -> Self {
        Self {
            model,
            matrices: BufferIndexRegistry::new(node_count, 0),
            eigens: BufferIndexRegistry::new(1, 0),
            slots: Vec::new(),
        }
    }

    /// The wrapped model.
    #[must_use]
    pub fn model(&self) -> &Arc<dyn SubstitutionModel> {
        &self.model
    }
}

impl EvolutionaryProcess for HomogeneousProcess {
    fn state_count(&self) -> usize {
        self.model.state_count()
    }

    fn eigen_buffer_count(&self) -> usize {
        self.eigens.buffer_count()
    }

    fn matrix_buffer_count(&self) -> usize {
        self.matrices.buffer_count()
    }

    fn matrix_slot(&self, node: usize) -> usize {
        self.matrices.slot(node)
    }

    fn flip_matrix_slot(&mut self, node: usize) {
        self.matrices.claim(node);
    }

    fn refresh_models(&mut self, backend: &mut dyn LikelihoodBackend) -> Result<(), BackendError> {
        let eigen = self.model.eigen_decomposition()?;
        self.eigens.claim(0);
        backend.set_eigen_decomposition(self.eigens.slot(0), &eigen)
    }

    fn refresh_matrices(
        &mut self,
        backend: &mut dyn LikelihoodBackend,
        nodes: &[usize],
        durations: &[f64],
    ) -> Result<(), BackendError> {
        self.slots.clear();
        self.slots
            .extend(nodes.iter().map(|&node| self.matrices.slot(node)));
        backend.update_transition_matrices(self.eigens.slot(0), &self.slots, durations)
    }

    fn root_state_frequencies(&self) -> Vec<f64> {
        self.model.frequencies()
    }

    fn store_state(&mut self) {
        self.matrices.store();
        self.eigens.store();
    }

    fn restore_state(&mut self) {
        self.matrices.restore();
        self.eigens.restore();
    }
}
