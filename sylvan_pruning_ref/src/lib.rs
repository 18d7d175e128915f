// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sylvan Pruning Reference Backend.
//!
//! This crate provides a small, single-threaded implementation of
//! [`LikelihoodBackend`] that does the arithmetic in plain `f64` loops and
//! records every protocol call as an [`Event`].
//!
//! It is meant for tests and debugging:
//! - It is **not** fast; there is no vectorization or threading.
//! - Every call is validated against the allocated [`BufferLayout`], so
//!   engine bugs surface as [`BackendError`]s instead of silent garbage.
//! - The event log lets tests assert on exactly which slots an evaluation
//!   touched, or that it touched none.
//!
//! Reference substitution and clock models live in [`models`].

pub mod models;

use sylvan_pruning::{
    BackendError, BufferLayout, EigenDecomposition, LikelihoodBackend, PartialsOp,
};

/// Event recorded by the reference backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Buffers were allocated.
    Allocate(BufferLayout),
    /// Compact states were set for a tip.
    TipStates {
        /// Tip buffer.
        tip: usize,
    },
    /// Partials were set for a tip.
    TipPartials {
        /// Tip buffer.
        tip: usize,
    },
    /// Pattern weights were set.
    PatternWeights,
    /// An eigen decomposition was uploaded.
    EigenDecomposition {
        /// Eigen buffer.
        slot: usize,
    },
    /// Category rates were set.
    CategoryRates(Vec<f64>),
    /// Category weights were set.
    CategoryWeights,
    /// Root state frequencies were set.
    StateFrequencies,
    /// Automatic rescaling was switched.
    AutoScaling(bool),
    /// Transition matrices were computed.
    TransitionMatrices {
        /// Eigen buffer used.
        eigen: usize,
        /// Matrix buffers written.
        slots: Vec<usize>,
        /// Effective branch durations.
        durations: Vec<f64>,
    },
    /// Combine operations were run.
    Partials {
        /// The operations, in order.
        ops: Vec<PartialsOp>,
        /// Cumulative scale buffer, if any.
        cumulative: Option<usize>,
    },
    /// A partials buffer was multiplied by a mask.
    Multiply {
        /// Partials buffer.
        slot: usize,
    },
    /// A scale buffer was zeroed.
    ResetScale {
        /// Scale buffer.
        slot: usize,
    },
    /// Scale factors were accumulated.
    AccumulateScale {
        /// Source buffers.
        slots: Vec<usize>,
        /// Destination scale buffer, or `None` for automatic factors.
        dest: Option<usize>,
    },
    /// The root was integrated.
    RootLikelihood {
        /// Root partials buffer.
        root: usize,
        /// Cumulative scale buffer, if any.
        cumulative: Option<usize>,
        /// Result.
        value: f64,
    },
}

#[derive(Clone, Debug, Default)]
enum Tip {
    #[default]
    Empty,
    States(Vec<u32>),
    /// Full length, replicated across categories.
    Partials(Vec<f64>),
}

/// Reference implementation of the likelihood backend.
///
/// Partials are laid out `[category][pattern][state]`; transition matrices
/// are `[category][parent state][child state]`. Scale buffers hold one
/// natural-log factor per pattern.
#[derive(Debug)]
pub struct RefBackend {
    layout: Option<BufferLayout>,
    supports_auto_scaling: bool,
    auto_scaling: bool,

    tips: Vec<Tip>,
    partials: Vec<Vec<f64>>,
    matrices: Vec<Vec<f64>>,
    eigens: Vec<Option<EigenDecomposition>>,
    scales: Vec<Vec<f64>>,
    /// Factors produced by automatic rescaling, per partials buffer.
    auto_factors: Vec<Vec<f64>>,
    auto_cumulative: Vec<f64>,

    pattern_weights: Vec<f64>,
    category_rates: Vec<f64>,
    category_weights: Vec<f64>,
    frequencies: Vec<f64>,
    site_log_likelihoods: Vec<f64>,

    /// Log of events in the order they were applied.
    events: Vec<Event>,
    root_evaluations: usize,
}

impl Default for RefBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RefBackend {
    /// Creates a backend that supports automatic rescaling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            layout: None,
            supports_auto_scaling: true,
            auto_scaling: false,
            tips: Vec::new(),
            partials: Vec::new(),
            matrices: Vec::new(),
            eigens: Vec::new(),
            scales: Vec::new(),
            auto_factors: Vec::new(),
            auto_cumulative: Vec::new(),
            pattern_weights: Vec::new(),
            category_rates: Vec::new(),
            category_weights: Vec::new(),
            frequencies: Vec::new(),
            site_log_likelihoods: Vec::new(),
            events: Vec::new(),
            root_evaluations: 0,
        }
    }

    /// Creates a backend that rejects [`set_auto_scaling`](LikelihoodBackend::set_auto_scaling).
    #[must_use]
    pub fn without_auto_scaling() -> Self {
        Self {
            supports_auto_scaling: false,
            ..Self::new()
        }
    }

    /// Returns a slice of recorded events.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Clears all recorded events but keeps buffer contents.
    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Number of root integrations since construction.
    pub fn root_evaluations(&self) -> usize {
        self.root_evaluations
    }

    /// Contents of a partials buffer, if allocated and written.
    pub fn partials(&self, slot: usize) -> Option<&[f64]> {
        self.partials
            .get(slot)
            .filter(|buffer| !buffer.is_empty())
            .map(Vec::as_slice)
    }

    /// The allocated layout.
    pub fn layout(&self) -> Option<&BufferLayout> {
        self.layout.as_ref()
    }

    fn allocated(&self) -> Result<BufferLayout, BackendError> {
        self.layout.ok_or(BackendError::NotAllocated)
    }

    fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), BackendError> {
        if expected == actual {
            Ok(())
        } else {
            Err(BackendError::Shape {
                what,
                expected,
                actual,
            })
        }
    }

    fn check_slot(kind: &'static str, slot: usize, allocated: usize) -> Result<(), BackendError> {
        if slot < allocated {
            Ok(())
        } else {
            Err(BackendError::InvalidSlot {
                kind,
                slot,
                allocated,
            })
        }
    }

    fn check_op(&self, layout: &BufferLayout, op: &PartialsOp) -> Result<(), BackendError> {
        Self::check_slot("partials", op.dest, layout.partials_buffers)?;
        if op.dest < layout.tip_count || op.dest == op.child1 || op.dest == op.child2 {
            return Err(BackendError::InvalidSlot {
                kind: "destination partials",
                slot: op.dest,
                allocated: layout.partials_buffers,
            });
        }
        for child in [op.child1, op.child2] {
            Self::check_slot("partials", child, layout.partials_buffers)?;
            let written = if child < layout.tip_count {
                !matches!(self.tips[child], Tip::Empty)
            } else {
                !self.partials[child].is_empty()
            };
            if !written {
                return Err(BackendError::Shape {
                    what: "child partials",
                    expected: layout.partials_len(),
                    actual: 0,
                });
            }
        }
        for matrix in [op.matrix1, op.matrix2] {
            Self::check_slot("matrix", matrix, layout.matrix_buffers)?;
        }
        for scale in op.scale_write.into_iter().chain(op.scale_read) {
            Self::check_slot("scale", scale, layout.scale_buffers)?;
        }
        Ok(())
    }

    /// `Σ_j P[i][j] · child[c][p][j]` for one row of a matrix.
    fn propagate(&self, layout: &BufferLayout, child: usize, row: &[f64], c: usize, p: usize) -> f64 {
        let states = layout.state_count;
        let offset = (c * layout.pattern_count + p) * states;
        if child < layout.tip_count {
            match &self.tips[child] {
                Tip::States(observed) => {
                    let state = observed[p] as usize;
                    if state < states {
                        row[state]
                    } else {
                        row.iter().sum()
                    }
                }
                Tip::Partials(partials) => dot(row, &partials[offset..offset + states]),
                Tip::Empty => 0.0,
            }
        } else {
            dot(row, &self.partials[child][offset..offset + states])
        }
    }

    /// Divides each pattern of `buffer` by its largest entry and returns the
    /// log factors.
    fn rescale(layout: &BufferLayout, buffer: &mut [f64], factors: &mut [f64]) {
        let states = layout.state_count;
        let patterns = layout.pattern_count;
        for (p, factor) in factors.iter_mut().enumerate() {
            let mut max = 0.0_f64;
            for c in 0..layout.category_count {
                let offset = (c * patterns + p) * states;
                for value in &buffer[offset..offset + states] {
                    max = max.max(*value);
                }
            }
            if max > 0.0 {
                for c in 0..layout.category_count {
                    let offset = (c * patterns + p) * states;
                    for value in &mut buffer[offset..offset + states] {
                        *value /= max;
                    }
                }
                *factor = max.ln();
            } else {
                *factor = 0.0;
            }
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl LikelihoodBackend for RefBackend {
    fn allocate(&mut self, layout: &BufferLayout) -> Result<(), BackendError> {
        if layout.tip_count > layout.partials_buffers {
            return Err(BackendError::Shape {
                what: "partials buffers",
                expected: layout.tip_count,
                actual: layout.partials_buffers,
            });
        }
        let categories = layout.category_count;
        self.tips = vec![Tip::Empty; layout.tip_count];
        self.partials = vec![Vec::new(); layout.partials_buffers];
        self.matrices = vec![vec![0.0; layout.matrix_len()]; layout.matrix_buffers];
        self.eigens = vec![None; layout.eigen_buffers];
        self.scales = vec![vec![0.0; layout.pattern_count]; layout.scale_buffers];
        self.auto_factors = vec![vec![0.0; layout.pattern_count]; layout.partials_buffers];
        self.auto_cumulative = vec![0.0; layout.pattern_count];
        self.pattern_weights = vec![1.0; layout.pattern_count];
        self.category_rates = vec![1.0; categories];
        self.category_weights = vec![1.0 / categories as f64; categories];
        self.frequencies = vec![1.0 / layout.state_count as f64; layout.state_count];
        self.site_log_likelihoods = vec![0.0; layout.pattern_count];
        self.layout = Some(*layout);
        log::debug!(
            "RefBackend: {} partials, {} matrix, {} scale buffers of {} patterns",
            layout.partials_buffers,
            layout.matrix_buffers,
            layout.scale_buffers,
            layout.pattern_count
        );
        self.events.push(Event::Allocate(*layout));
        Ok(())
    }

    fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("tip", tip, layout.tip_count)?;
        Self::check_len("tip states", layout.pattern_count, states.len())?;
        self.tips[tip] = Tip::States(states.to_vec());
        self.events.push(Event::TipStates { tip });
        Ok(())
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("tip", tip, layout.tip_count)?;
        Self::check_len(
            "tip partials",
            layout.pattern_count * layout.state_count,
            partials.len(),
        )?;
        self.tips[tip] = Tip::Partials(partials.repeat(layout.category_count));
        self.events.push(Event::TipPartials { tip });
        Ok(())
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_len("pattern weights", layout.pattern_count, weights.len())?;
        self.pattern_weights.copy_from_slice(weights);
        self.events.push(Event::PatternWeights);
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        slot: usize,
        eigen: &EigenDecomposition,
    ) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("eigen", slot, layout.eigen_buffers)?;
        Self::check_len("eigen states", layout.state_count, eigen.state_count())?;
        self.eigens[slot] = Some(eigen.clone());
        self.events.push(Event::EigenDecomposition { slot });
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_len("category rates", layout.category_count, rates.len())?;
        self.category_rates.copy_from_slice(rates);
        self.events.push(Event::CategoryRates(rates.to_vec()));
        Ok(())
    }

    fn set_category_weights(&mut self, weights: &[f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_len("category weights", layout.category_count, weights.len())?;
        self.category_weights.copy_from_slice(weights);
        self.events.push(Event::CategoryWeights);
        Ok(())
    }

    fn set_state_frequencies(&mut self, frequencies: &[f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_len("state frequencies", layout.state_count, frequencies.len())?;
        self.frequencies.copy_from_slice(frequencies);
        self.events.push(Event::StateFrequencies);
        Ok(())
    }

    fn set_auto_scaling(&mut self, enabled: bool) -> Result<(), BackendError> {
        if !self.supports_auto_scaling {
            return Err(BackendError::Unsupported("automatic rescaling"));
        }
        self.auto_scaling = enabled;
        self.events.push(Event::AutoScaling(enabled));
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        slots: &[usize],
        durations: &[f64],
    ) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("eigen", eigen, layout.eigen_buffers)?;
        Self::check_len("branch durations", slots.len(), durations.len())?;
        let states = layout.state_count;
        let Some(decomposition) = &self.eigens[eigen] else {
            return Err(BackendError::Shape {
                what: "eigen decomposition",
                expected: states * states,
                actual: 0,
            });
        };
        let values = decomposition.eigenvalues();
        let vectors = decomposition.eigenvectors();
        let inverse = decomposition.inverse_eigenvectors();

        let mut exps = vec![0.0; states];
        for (&slot, &duration) in slots.iter().zip(durations) {
            Self::check_slot("matrix", slot, layout.matrix_buffers)?;
            let matrix = &mut self.matrices[slot];
            for (c, rate) in self.category_rates.iter().enumerate() {
                for (e, value) in exps.iter_mut().zip(values) {
                    *e = (value * rate * duration).exp();
                }
                let block = &mut matrix[c * states * states..(c + 1) * states * states];
                for i in 0..states {
                    for j in 0..states {
                        let p: f64 = (0..states)
                            .map(|k| vectors[i * states + k] * exps[k] * inverse[k * states + j])
                            .sum();
                        block[i * states + j] = p.max(0.0);
                    }
                }
            }
        }
        self.events.push(Event::TransitionMatrices {
            eigen,
            slots: slots.to_vec(),
            durations: durations.to_vec(),
        });
        Ok(())
    }

    fn update_partials(
        &mut self,
        ops: &[PartialsOp],
        cumulative: Option<usize>,
    ) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        if let Some(cumulative) = cumulative {
            Self::check_slot("scale", cumulative, layout.scale_buffers)?;
        }
        let states = layout.state_count;
        let mut factors = vec![0.0; layout.pattern_count];
        for op in ops {
            self.check_op(&layout, op)?;
            let mut dest = core::mem::take(&mut self.partials[op.dest]);
            dest.resize(layout.partials_len(), 0.0);
            for c in 0..layout.category_count {
                let block = c * states * states;
                let m1 = &self.matrices[op.matrix1][block..block + states * states];
                let m2 = &self.matrices[op.matrix2][block..block + states * states];
                for p in 0..layout.pattern_count {
                    let offset = (c * layout.pattern_count + p) * states;
                    for i in 0..states {
                        let row1 = &m1[i * states..(i + 1) * states];
                        let row2 = &m2[i * states..(i + 1) * states];
                        dest[offset + i] = self.propagate(&layout, op.child1, row1, c, p)
                            * self.propagate(&layout, op.child2, row2, c, p);
                    }
                }
            }

            if let Some(write) = op.scale_write {
                Self::rescale(&layout, &mut dest, &mut factors);
                self.scales[write].copy_from_slice(&factors);
                if let Some(cumulative) = cumulative {
                    for (total, factor) in self.scales[cumulative].iter_mut().zip(&factors) {
                        *total += factor;
                    }
                }
            } else if let Some(read) = op.scale_read {
                for p in 0..layout.pattern_count {
                    let factor = self.scales[read][p].exp();
                    for c in 0..layout.category_count {
                        let offset = (c * layout.pattern_count + p) * states;
                        for value in &mut dest[offset..offset + states] {
                            *value /= factor;
                        }
                    }
                }
            } else if self.auto_scaling {
                Self::rescale(&layout, &mut dest, &mut self.auto_factors[op.dest]);
            }
            self.partials[op.dest] = dest;
        }
        self.events.push(Event::Partials {
            ops: ops.to_vec(),
            cumulative,
        });
        Ok(())
    }

    fn multiply_partials(&mut self, slot: usize, mask: &[f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("partials", slot, layout.partials_buffers)?;
        Self::check_len("partials mask", layout.partials_len(), mask.len())?;
        let buffer = &mut self.partials[slot];
        Self::check_len("partials", layout.partials_len(), buffer.len())?;
        for (value, m) in buffer.iter_mut().zip(mask) {
            *value *= m;
        }
        self.events.push(Event::Multiply { slot });
        Ok(())
    }

    fn reset_scale_factors(&mut self, slot: usize) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("scale", slot, layout.scale_buffers)?;
        self.scales[slot].fill(0.0);
        self.events.push(Event::ResetScale { slot });
        Ok(())
    }

    fn accumulate_scale_factors(
        &mut self,
        slots: &[usize],
        dest: Option<usize>,
    ) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        match dest {
            Some(dest) => {
                Self::check_slot("scale", dest, layout.scale_buffers)?;
                let mut total = core::mem::take(&mut self.scales[dest]);
                for &slot in slots {
                    Self::check_slot("scale", slot, layout.scale_buffers)?;
                    if slot == dest {
                        continue;
                    }
                    for (t, factor) in total.iter_mut().zip(&self.scales[slot]) {
                        *t += factor;
                    }
                }
                self.scales[dest] = total;
            }
            None => {
                if !self.auto_scaling {
                    return Err(BackendError::Unsupported(
                        "accumulating automatic factors while automatic rescaling is off",
                    ));
                }
                self.auto_cumulative.fill(0.0);
                for &slot in slots {
                    Self::check_slot("partials", slot, layout.partials_buffers)?;
                    for (t, factor) in self.auto_cumulative.iter_mut().zip(&self.auto_factors[slot])
                    {
                        *t += factor;
                    }
                }
            }
        }
        self.events.push(Event::AccumulateScale {
            slots: slots.to_vec(),
            dest,
        });
        Ok(())
    }

    fn root_log_likelihood(
        &mut self,
        root: usize,
        cumulative: Option<usize>,
    ) -> Result<f64, BackendError> {
        let layout = self.allocated()?;
        Self::check_slot("partials", root, layout.partials_buffers)?;
        if let Some(cumulative) = cumulative {
            Self::check_slot("scale", cumulative, layout.scale_buffers)?;
        }
        let partials = &self.partials[root];
        Self::check_len("root partials", layout.partials_len(), partials.len())?;

        let states = layout.state_count;
        let mut total = 0.0;
        for p in 0..layout.pattern_count {
            let mut likelihood = 0.0;
            for (c, weight) in self.category_weights.iter().enumerate() {
                let offset = (c * layout.pattern_count + p) * states;
                likelihood += weight * dot(&self.frequencies, &partials[offset..offset + states]);
            }
            let mut log_likelihood = likelihood.ln();
            if let Some(cumulative) = cumulative {
                log_likelihood += self.scales[cumulative][p];
            } else if self.auto_scaling {
                log_likelihood += self.auto_cumulative[p];
            }
            self.site_log_likelihoods[p] = log_likelihood;
            total += self.pattern_weights[p] * log_likelihood;
        }

        self.root_evaluations += 1;
        self.events.push(Event::RootLikelihood {
            root,
            cumulative,
            value: total,
        });
        Ok(total)
    }

    fn site_log_likelihoods(&self, out: &mut [f64]) -> Result<(), BackendError> {
        let layout = self.allocated()?;
        Self::check_len("site log-likelihoods", layout.pattern_count, out.len())?;
        out.copy_from_slice(&self.site_log_likelihoods);
        Ok(())
    }
}
