// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Small substitution and clock models with closed-form eigen systems.
//!
//! Parameters sit behind [`RwLock`]s so a model can be shared with an
//! engine through an `Arc` and still be changed by the test driving it.
//! After a change, notify the engine
//! ([`substitution_changed`](sylvan_pruning::TreeLikelihood::substitution_changed)
//! or [`branch_rates_changed`](sylvan_pruning::TreeLikelihood::branch_rates_changed)).

use std::sync::{PoisonError, RwLock};

use sylvan_pruning::{
    BackendError, BranchRateModel, EigenDecomposition, SubstitutionModel, TreeTopology,
};

/// A two-state continuous-time Markov chain.
///
/// `forward` is the rate from state 0 to state 1 and `backward` the rate
/// from state 1 to state 0.
#[derive(Debug)]
pub struct TwoStateModel {
    rates: RwLock<(f64, f64)>,
}

impl TwoStateModel {
    /// Creates a model with the given rates.
    #[must_use]
    pub fn new(forward: f64, backward: f64) -> Self {
        Self {
            rates: RwLock::new((forward, backward)),
        }
    }

    /// Creates a model with equal rates in both directions.
    #[must_use]
    pub fn symmetric(rate: f64) -> Self {
        Self::new(rate, rate)
    }

    /// Current `(forward, backward)` rates.
    pub fn rates(&self) -> (f64, f64) {
        *self.rates.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces both rates.
    pub fn set_rates(&self, forward: f64, backward: f64) {
        *self.rates.write().unwrap_or_else(PoisonError::into_inner) = (forward, backward);
    }
}

impl SubstitutionModel for TwoStateModel {
    fn state_count(&self) -> usize {
        2
    }

    fn eigen_decomposition(&self) -> Result<EigenDecomposition, BackendError> {
        let (a, b) = self.rates();
        let total = a + b;
        // Q = [[-a, a], [b, -b]]; right eigenvectors (1, 1) and (a, -b).
        EigenDecomposition::new(
            vec![0.0, -total],
            vec![1.0, a, 1.0, -b],
            vec![b / total, a / total, 1.0 / total, -1.0 / total],
        )
    }

    fn frequencies(&self) -> Vec<f64> {
        let (a, b) = self.rates();
        vec![b / (a + b), a / (a + b)]
    }
}

/// The Jukes–Cantor model on `n` states, scaled to one expected
/// substitution per unit time.
#[derive(Clone, Debug)]
pub struct JukesCantor {
    state_count: usize,
    eigenvalues: Vec<f64>,
    /// Helmert basis: orthonormal, so the inverse is the transpose.
    eigenvectors: Vec<f64>,
    inverse_eigenvectors: Vec<f64>,
}

impl JukesCantor {
    /// Creates the model.
    ///
    /// # Panics
    ///
    /// Panics if `state_count < 2`.
    #[must_use]
    pub fn new(state_count: usize) -> Self {
        assert!(state_count >= 2, "Jukes-Cantor needs at least two states");
        let n = state_count;
        let nonzero = -(n as f64) / (n as f64 - 1.0);
        let mut values = vec![nonzero; n];
        values[0] = 0.0;

        let mut vectors = vec![0.0; n * n];
        for row in 0..n {
            vectors[row * n] = 1.0 / (n as f64).sqrt();
        }
        for k in 1..n {
            let norm = ((k * (k + 1)) as f64).sqrt();
            for row in 0..k {
                vectors[row * n + k] = 1.0 / norm;
            }
            vectors[k * n + k] = -(k as f64) / norm;
        }
        let mut inverse = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                inverse[j * n + i] = vectors[i * n + j];
            }
        }

        Self {
            state_count,
            eigenvalues: values,
            eigenvectors: vectors,
            inverse_eigenvectors: inverse,
        }
    }

    /// Probability of no net change over `time`.
    #[must_use]
    pub fn same_state_probability(&self, time: f64) -> f64 {
        let n = self.state_count as f64;
        1.0 / n + (n - 1.0) / n * (-n / (n - 1.0) * time).exp()
    }
}

impl SubstitutionModel for JukesCantor {
    fn state_count(&self) -> usize {
        self.state_count
    }

    fn eigen_decomposition(&self) -> Result<EigenDecomposition, BackendError> {
        EigenDecomposition::new(
            self.eigenvalues.clone(),
            self.eigenvectors.clone(),
            self.inverse_eigenvectors.clone(),
        )
    }

    fn frequencies(&self) -> Vec<f64> {
        vec![1.0 / self.state_count as f64; self.state_count]
    }
}

/// A separate rate on each branch, indexed by the child node.
#[derive(Debug)]
pub struct LocalClock {
    rates: RwLock<Vec<f64>>,
}

impl LocalClock {
    /// Rate one on every branch of a tree with `node_count` nodes.
    #[must_use]
    pub fn new(node_count: usize) -> Self {
        Self {
            rates: RwLock::new(vec![1.0; node_count]),
        }
    }

    /// Sets the rate on the branch above `node`.
    pub fn set_rate(&self, node: usize, rate: f64) {
        self.rates.write().unwrap_or_else(PoisonError::into_inner)[node] = rate;
    }
}

impl BranchRateModel for LocalClock {
    fn rate(&self, _tree: &dyn TreeTopology, node: usize) -> f64 {
        self.rates.read().unwrap_or_else(PoisonError::into_inner)[node]
    }
}
