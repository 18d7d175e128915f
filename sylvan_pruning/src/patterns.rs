// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observed site patterns and per-tip data.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use hashbrown::HashMap;

use crate::backend::LikelihoodBackend;
use crate::error::PruningError;
use crate::math;

/// Observed data for one taxon.
#[derive(Clone, Debug, PartialEq)]
pub enum TipData {
    /// One state per pattern. A value `>= state_count` is unknown (a gap or
    /// missing data) and contributes a likelihood of one for every state.
    States(Vec<u32>),
    /// Partial likelihoods, `patterns × states`, for ambiguous observations.
    Partials(Vec<f64>),
}

impl TipData {
    fn expected_len(&self, state_count: usize, pattern_count: usize) -> usize {
        match self {
            Self::States(_) => pattern_count,
            Self::Partials(_) => pattern_count * state_count,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::States(states) => states.len(),
            Self::Partials(partials) => partials.len(),
        }
    }

    /// Expands compact states to one-hot partials (all ones for unknown).
    fn to_partials(&self, state_count: usize) -> Vec<f64> {
        match self {
            Self::Partials(partials) => partials.clone(),
            Self::States(states) => {
                let mut partials = vec![0.0; states.len() * state_count];
                for (row, &state) in partials.chunks_exact_mut(state_count).zip(states) {
                    match row.get_mut(state as usize) {
                        Some(cell) => *cell = 1.0,
                        None => row.fill(1.0),
                    }
                }
                partials
            }
        }
    }
}

/// Marks a contiguous range of patterns as unobservable.
///
/// Those patterns are present only so their probability can be computed;
/// the likelihood of the remaining patterns is conditioned on not observing
/// any of them:
///
/// `log L = Σ_{i ∉ excluded} w_i (ℓ_i − ln(1 − Σ_{j ∈ excluded} exp ℓ_j))`
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ascertainment {
    /// Pattern indices of the excluded patterns.
    pub excluded: Range<usize>,
}

impl Ascertainment {
    /// Log-probability that a pattern is observable,
    /// `ln(1 − Σ_{j ∈ excluded} exp ℓ_j)`.
    #[must_use]
    pub fn log_correction(&self, pattern_log_likelihoods: &[f64]) -> f64 {
        let excluded: f64 = pattern_log_likelihoods[self.excluded.clone()]
            .iter()
            .map(|&l| math::exp(l))
            .sum();
        math::ln(1.0 - excluded)
    }

    /// Ascertainment-corrected log-likelihood.
    ///
    /// Returns `-∞` when the excluded patterns carry all of the probability
    /// mass, since no observable pattern remains to condition on.
    #[must_use]
    pub fn corrected_log_likelihood(&self, pattern_log_likelihoods: &[f64], weights: &[f64]) -> f64 {
        let correction = self.log_correction(pattern_log_likelihoods);
        if !correction.is_finite() {
            return f64::NEG_INFINITY;
        }
        pattern_log_likelihoods
            .iter()
            .zip(weights)
            .enumerate()
            .filter(|(pattern, _)| !self.excluded.contains(pattern))
            .map(|(_, (&l, &w))| w * (l - correction))
            .sum()
    }
}

/// Compressed alignment: one column per distinct site pattern.
///
/// # Example
///
/// ```
/// use sylvan_pruning::{SitePatterns, TipData};
///
/// let patterns = SitePatterns::new(2, vec![3.0, 1.0])
///     .with_taxon("A", TipData::States(vec![0, 1]))
///     .unwrap()
///     .with_taxon("B", TipData::Partials(vec![1.0, 0.0, 0.5, 0.5]))
///     .unwrap();
/// assert_eq!(patterns.taxon_count(), 2);
/// assert_eq!(patterns.taxon_index("B"), Some(1));
/// ```
#[derive(Clone, Debug)]
pub struct SitePatterns {
    state_count: usize,
    weights: Vec<f64>,
    taxa: Vec<String>,
    data: Vec<TipData>,
    index: HashMap<String, usize>,
    ascertainment: Option<Ascertainment>,
}

impl SitePatterns {
    /// Creates an empty alignment with one weight per pattern.
    #[must_use]
    pub fn new(state_count: usize, weights: Vec<f64>) -> Self {
        Self {
            state_count,
            weights,
            taxa: Vec::new(),
            data: Vec::new(),
            index: HashMap::new(),
            ascertainment: None,
        }
    }

    /// Adds a taxon, builder style.
    pub fn with_taxon(mut self, taxon: impl Into<String>, data: TipData) -> Result<Self, PruningError> {
        self.add_taxon(taxon, data)?;
        Ok(self)
    }

    /// Marks a range of patterns as unobservable.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the last pattern.
    #[must_use]
    pub fn with_ascertainment(mut self, excluded: Range<usize>) -> Self {
        assert!(
            excluded.end <= self.pattern_count(),
            "ascertainment range {excluded:?} exceeds {} patterns",
            self.pattern_count()
        );
        self.ascertainment = Some(Ascertainment { excluded });
        self
    }

    /// Adds a taxon, replacing any existing data under the same label.
    pub fn add_taxon(&mut self, taxon: impl Into<String>, data: TipData) -> Result<(), PruningError> {
        let taxon = taxon.into();
        self.check_shape(&taxon, &data)?;
        if let Some(&row) = self.index.get(&taxon) {
            self.data[row] = data;
        } else {
            self.index.insert(taxon.clone(), self.taxa.len());
            self.taxa.push(taxon);
            self.data.push(data);
        }
        Ok(())
    }

    fn check_shape(&self, taxon: &str, data: &TipData) -> Result<(), PruningError> {
        let expected = data.expected_len(self.state_count, self.pattern_count());
        if data.len() != expected {
            return Err(PruningError::PatternShape {
                taxon: taxon.to_string(),
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// Number of character states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.state_count
    }

    /// Number of distinct patterns.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    /// Number of taxa.
    #[must_use]
    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    /// Pattern weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Row index of `taxon`.
    #[must_use]
    pub fn taxon_index(&self, taxon: &str) -> Option<usize> {
        self.index.get(taxon).copied()
    }

    /// Label of row `row`.
    #[must_use]
    pub fn taxon(&self, row: usize) -> &str {
        &self.taxa[row]
    }

    /// Data of row `row`.
    #[must_use]
    pub fn data(&self, row: usize) -> &TipData {
        &self.data[row]
    }

    /// Ascertainment descriptor, if any.
    #[must_use]
    pub fn ascertainment(&self) -> Option<&Ascertainment> {
        self.ascertainment.as_ref()
    }

    /// Replaces the data of a row and returns the previous data.
    pub(crate) fn replace(&mut self, row: usize, data: TipData) -> Result<TipData, PruningError> {
        self.check_shape(&self.taxa[row], &data)?;
        Ok(core::mem::replace(&mut self.data[row], data))
    }
}

/// Tip-to-row mapping, pending uploads, and the undo log for tip data.
#[derive(Clone, Debug)]
pub(crate) struct TipStore {
    /// Pattern row for each tip.
    rows: Vec<usize>,
    /// Tip for each pattern row, if the taxon is in the tree.
    tips_by_row: Vec<Option<usize>>,
    pending: Vec<usize>,
    /// Previous data of rows changed since `store`, oldest first.
    undo: Vec<(usize, TipData)>,
    recording: bool,
    use_ambiguities: bool,
}

impl TipStore {
    pub(crate) fn new(rows: Vec<usize>, row_count: usize, use_ambiguities: bool) -> Self {
        let mut tips_by_row = vec![None; row_count];
        for (tip, &row) in rows.iter().enumerate() {
            tips_by_row[row] = Some(tip);
        }
        Self {
            rows,
            tips_by_row,
            pending: Vec::new(),
            undo: Vec::new(),
            recording: false,
            use_ambiguities,
        }
    }

    /// Replaces a row's data, logs the old value, and queues the tip for upload.
    pub(crate) fn replace(
        &mut self,
        patterns: &mut SitePatterns,
        row: usize,
        data: TipData,
    ) -> Result<Option<usize>, PruningError> {
        let old = patterns.replace(row, data)?;
        if self.recording {
            self.undo.push((row, old));
        }
        let tip = self.tips_by_row[row];
        if let Some(tip) = tip {
            if !self.pending.contains(&tip) {
                self.pending.push(tip);
            }
        }
        Ok(tip)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Uploads every queued tip.
    pub(crate) fn upload_pending(
        &mut self,
        patterns: &SitePatterns,
        backend: &mut dyn LikelihoodBackend,
    ) -> Result<(), PruningError> {
        for &tip in &self.pending {
            self.upload(patterns, backend, tip)?;
        }
        self.pending.clear();
        Ok(())
    }

    /// Uploads every tip.
    pub(crate) fn upload_all(
        &mut self,
        patterns: &SitePatterns,
        backend: &mut dyn LikelihoodBackend,
    ) -> Result<(), PruningError> {
        for tip in 0..self.rows.len() {
            self.upload(patterns, backend, tip)?;
        }
        self.pending.clear();
        Ok(())
    }

    fn upload(
        &self,
        patterns: &SitePatterns,
        backend: &mut dyn LikelihoodBackend,
        tip: usize,
    ) -> Result<(), PruningError> {
        match patterns.data(self.rows[tip]) {
            TipData::States(states) if !self.use_ambiguities => backend.set_tip_states(tip, states)?,
            data => backend.set_tip_partials(tip, &data.to_partials(patterns.state_count()))?,
        }
        Ok(())
    }

    pub(crate) fn store(&mut self) {
        self.undo.clear();
        self.recording = true;
    }

    /// Reverts every change since `store` and re-uploads the affected tips.
    ///
    /// Returns the reverted tips.
    pub(crate) fn restore(
        &mut self,
        patterns: &mut SitePatterns,
        backend: &mut dyn LikelihoodBackend,
    ) -> Result<Vec<usize>, PruningError> {
        let mut reverted = Vec::new();
        while let Some((row, old)) = self.undo.pop() {
            patterns.replace(row, old)?;
            if let Some(tip) = self.tips_by_row[row] {
                if !reverted.contains(&tip) {
                    reverted.push(tip);
                }
            }
        }
        self.recording = false;
        for &tip in &reverted {
            self.upload(patterns, backend, tip)?;
        }
        self.pending.retain(|tip| !reverted.contains(tip));
        Ok(reverted)
    }
}
