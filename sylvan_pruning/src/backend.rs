// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Batched compute backend protocol.
//!
//! The engine never touches likelihood arrays itself. It decides *which*
//! buffers to combine and hands the backend flat lists of operations;
//! the backend owns the numbers.
//!
//! Buffer layouts follow a category-major convention: a partials buffer is
//! `[categories × patterns × states]` and a transition matrix buffer is
//! `[categories × states × states]` (row = parent state, column = child state).

use alloc::vec::Vec;

use crate::error::BackendError;

/// Buffer counts and dimensions requested at construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    /// Number of tips; tip buffers are `0..tip_count`.
    pub tip_count: usize,
    /// Number of partials buffers, tips included.
    pub partials_buffers: usize,
    /// Number of character states.
    pub state_count: usize,
    /// Number of site patterns.
    pub pattern_count: usize,
    /// Number of rate categories.
    pub category_count: usize,
    /// Number of eigen decomposition buffers.
    pub eigen_buffers: usize,
    /// Number of transition matrix buffers.
    pub matrix_buffers: usize,
    /// Number of scale-factor buffers.
    pub scale_buffers: usize,
}

impl BufferLayout {
    /// Length of one partials buffer.
    #[must_use]
    pub fn partials_len(&self) -> usize {
        self.category_count * self.pattern_count * self.state_count
    }

    /// Length of one transition matrix buffer.
    #[must_use]
    pub fn matrix_len(&self) -> usize {
        self.category_count * self.state_count * self.state_count
    }
}

/// One combine step: `dest = (P(matrix1) · child1) ⊙ (P(matrix2) · child2)`.
///
/// `scale_write` asks the backend to rescale `dest` and store the factors in
/// that scale buffer; `scale_read` asks it to divide `dest` by factors
/// already stored there. At most one of them is set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PartialsOp {
    /// Destination partials buffer.
    pub dest: usize,
    /// Scale buffer to write fresh factors into.
    pub scale_write: Option<usize>,
    /// Scale buffer to read existing factors from.
    pub scale_read: Option<usize>,
    /// First child's partials buffer.
    pub child1: usize,
    /// Transition matrix buffer for the first child's branch.
    pub matrix1: usize,
    /// Second child's partials buffer.
    pub child2: usize,
    /// Transition matrix buffer for the second child's branch.
    pub matrix2: usize,
}

/// Spectral decomposition `Q = V · diag(λ) · V⁻¹` of a rate matrix.
///
/// Matrices are row-major `states × states`.
#[derive(Clone, Debug, PartialEq)]
pub struct EigenDecomposition {
    state_count: usize,
    eigenvalues: Vec<f64>,
    eigenvectors: Vec<f64>,
    inverse_eigenvectors: Vec<f64>,
}

impl EigenDecomposition {
    /// Builds a decomposition, checking that the arrays agree on the state count.
    pub fn new(
        eigenvalues: Vec<f64>,
        eigenvectors: Vec<f64>,
        inverse_eigenvectors: Vec<f64>,
    ) -> Result<Self, BackendError> {
        let state_count = eigenvalues.len();
        let square = state_count * state_count;
        for (what, values) in [
            ("eigenvectors", &eigenvectors),
            ("inverse eigenvectors", &inverse_eigenvectors),
        ] {
            if values.len() != square {
                return Err(BackendError::Shape {
                    what,
                    expected: square,
                    actual: values.len(),
                });
            }
        }
        Ok(Self {
            state_count,
            eigenvalues,
            eigenvectors,
            inverse_eigenvectors,
        })
    }

    /// Number of states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.state_count
    }

    /// Eigenvalues `λ`.
    #[must_use]
    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Right eigenvectors `V`, row-major.
    #[must_use]
    pub fn eigenvectors(&self) -> &[f64] {
        &self.eigenvectors
    }

    /// `V⁻¹`, row-major.
    #[must_use]
    pub fn inverse_eigenvectors(&self) -> &[f64] {
        &self.inverse_eigenvectors
    }
}

/// A vectorized likelihood compute backend.
///
/// All operations are batched: the engine builds complete lists of
/// transition-matrix and partials updates for an evaluation and submits
/// them in as few calls as possible. Slot ids index the buffer arrays
/// requested in [`allocate`](Self::allocate).
///
/// The trait is object safe; the engine's hooks receive
/// `&mut dyn LikelihoodBackend`.
pub trait LikelihoodBackend {
    /// Allocates every buffer. Called once, before any other method.
    fn allocate(&mut self, layout: &BufferLayout) -> Result<(), BackendError>;

    /// Sets compact observed states for a tip buffer.
    ///
    /// One entry per pattern; a value `>= state_count` means "unknown" and
    /// contributes a partial likelihood of one for every state.
    fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> Result<(), BackendError>;

    /// Sets partial likelihoods (`patterns × states`) for a tip buffer.
    ///
    /// The backend replicates them across rate categories.
    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<(), BackendError>;

    /// Sets the weight (multiplicity) of each pattern.
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), BackendError>;

    /// Uploads an eigen decomposition into an eigen buffer.
    fn set_eigen_decomposition(
        &mut self,
        slot: usize,
        eigen: &EigenDecomposition,
    ) -> Result<(), BackendError>;

    /// Sets the relative rate of each category.
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), BackendError>;

    /// Sets the weight of each category at the root.
    fn set_category_weights(&mut self, weights: &[f64]) -> Result<(), BackendError>;

    /// Sets the root state frequencies.
    fn set_state_frequencies(&mut self, frequencies: &[f64]) -> Result<(), BackendError>;

    /// Turns backend-managed rescaling on or off.
    ///
    /// Backends that cannot rescale on their own return
    /// [`BackendError::Unsupported`].
    fn set_auto_scaling(&mut self, enabled: bool) -> Result<(), BackendError>;

    /// Computes `P(d) = exp(Q · r_c · d)` for each duration into each matrix buffer.
    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        slots: &[usize],
        durations: &[f64],
    ) -> Result<(), BackendError>;

    /// Runs combine operations in order.
    ///
    /// Later operations may read buffers written by earlier ones in the
    /// same call. `cumulative`, if set, is a scale buffer that fresh
    /// factors are also added into.
    fn update_partials(
        &mut self,
        ops: &[PartialsOp],
        cumulative: Option<usize>,
    ) -> Result<(), BackendError>;

    /// Multiplies a partials buffer element-wise by `mask`.
    ///
    /// `mask` has the full partials length.
    fn multiply_partials(&mut self, slot: usize, mask: &[f64]) -> Result<(), BackendError>;

    /// Zeroes a scale buffer.
    fn reset_scale_factors(&mut self, slot: usize) -> Result<(), BackendError>;

    /// Adds the log scale factors of `slots` into `dest`.
    ///
    /// With `dest == None` the slots are partials buffers and the backend
    /// accumulates its own automatically produced factors.
    fn accumulate_scale_factors(
        &mut self,
        slots: &[usize],
        dest: Option<usize>,
    ) -> Result<(), BackendError>;

    /// Integrates the root partials over categories and root frequencies and
    /// returns `Σ weight × log-likelihood` over patterns.
    ///
    /// A non-finite result signals underflow; it is not an error.
    fn root_log_likelihood(
        &mut self,
        root: usize,
        cumulative: Option<usize>,
    ) -> Result<f64, BackendError>;

    /// Copies the per-pattern log-likelihoods of the last root integration.
    fn site_log_likelihoods(&self, out: &mut [f64]) -> Result<(), BackendError>;
}
