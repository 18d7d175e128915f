// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Underflow rescaling policy and scale-buffer bookkeeping.

use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use crate::backend::LikelihoodBackend;
use crate::buffers::BufferIndexRegistry;
use crate::error::BackendError;

/// Evaluations between fresh-factor recomputes under [`RescalingScheme::Dynamic`].
pub const DEFAULT_RESCALING_FREQUENCY: u32 = 100;

/// Rescue attempts between two underflow log lines.
const RESCUE_LOG_INTERVAL: u64 = 1000;

/// When partial likelihoods are rescaled to avoid underflow.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RescalingScheme {
    /// Never rescale; deep or large trees may evaluate to `-∞`.
    Never,
    /// Fresh factors for every recomputed node on every evaluation.
    Always,
    /// No rescaling until the first underflow; afterwards fresh factors
    /// with a full recompute every `frequency` evaluations and reuse of the
    /// stored factors in between.
    #[default]
    Dynamic,
    /// No rescaling until the first underflow; afterwards like `Always`.
    Delayed,
    /// The backend rescales on its own.
    Delegated,
}

impl RescalingScheme {
    /// Returns the lowercase name of the scheme.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Always => "always",
            Self::Dynamic => "dynamic",
            Self::Delayed => "delayed",
            Self::Delegated => "delegated",
        }
    }
}

impl fmt::Display for RescalingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown rescaling scheme name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown rescaling scheme; expected one of never, always, dynamic, delayed, delegated")]
pub struct ParseSchemeError;

impl FromStr for RescalingScheme {
    type Err = ParseSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scheme = match s.trim() {
            s if s.eq_ignore_ascii_case("never") || s.eq_ignore_ascii_case("none") => Self::Never,
            s if s.eq_ignore_ascii_case("always") => Self::Always,
            s if s.eq_ignore_ascii_case("dynamic") => Self::Dynamic,
            s if s.eq_ignore_ascii_case("delayed") => Self::Delayed,
            s if s.eq_ignore_ascii_case("delegated") || s.eq_ignore_ascii_case("auto") => {
                Self::Delegated
            }
            _ => return Err(ParseSchemeError),
        };
        Ok(scheme)
    }
}

/// Scaling decision for one traversal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalingPass {
    /// Scale factors take part in this evaluation.
    pub use_scale_factors: bool,
    /// Recomputed nodes write fresh factors (otherwise they read stored ones).
    pub recompute: bool,
    /// Every node must be recomputed.
    pub full_recompute: bool,
    /// The backend produces factors on its own.
    pub delegated: bool,
}

impl ScalingPass {
    const UNSCALED: Self = Self {
        use_scale_factors: false,
        recompute: false,
        full_recompute: false,
        delegated: false,
    };

    const FRESH: Self = Self {
        use_scale_factors: true,
        recompute: true,
        full_recompute: false,
        delegated: false,
    };
}

/// Per-evaluation scaling state machine.
///
/// # Example
///
/// ```
/// use sylvan_pruning::{RescalingPolicy, RescalingScheme};
///
/// let mut policy = RescalingPolicy::new(RescalingScheme::Dynamic, 3);
/// assert!(!policy.begin_evaluation().use_scale_factors);
///
/// // First underflow: retry with a full, freshly scaled recompute.
/// policy.record_underflow();
/// assert!(policy.permits_retry());
/// let retry = policy.retry_pass();
/// assert!(retry.full_recompute && retry.recompute);
///
/// // Two evaluations reuse the factors, the third recomputes them.
/// assert!(!policy.begin_evaluation().recompute);
/// assert!(!policy.begin_evaluation().recompute);
/// assert!(policy.begin_evaluation().full_recompute);
/// ```
#[derive(Clone, Debug)]
pub struct RescalingPolicy {
    scheme: RescalingScheme,
    frequency: u32,
    ever_underflowed: bool,
    /// Evaluations left before the next fresh-factor recompute (`Dynamic`).
    countdown: u32,
    full_recompute_pending: bool,
    rescue_count: u64,
}

impl RescalingPolicy {
    /// Creates a policy. A `frequency` of zero is treated as one.
    #[must_use]
    pub fn new(scheme: RescalingScheme, frequency: u32) -> Self {
        Self {
            scheme,
            frequency: frequency.max(1),
            ever_underflowed: false,
            countdown: 0,
            full_recompute_pending: false,
            rescue_count: 0,
        }
    }

    /// The active scheme.
    #[must_use]
    pub fn scheme(&self) -> RescalingScheme {
        self.scheme
    }

    /// Replaces the scheme, e.g. when the backend cannot honor `Delegated`.
    pub fn set_scheme(&mut self, scheme: RescalingScheme) {
        self.scheme = scheme;
    }

    /// Evaluations between fresh-factor recomputes under `Dynamic`.
    #[must_use]
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Returns `true` once any evaluation has underflowed.
    #[must_use]
    pub fn ever_underflowed(&self) -> bool {
        self.ever_underflowed
    }

    /// Number of rescue attempts so far.
    #[must_use]
    pub fn rescue_count(&self) -> u64 {
        self.rescue_count
    }

    /// Returns `true` if the next evaluation would read or write explicit
    /// scale factors.
    #[must_use]
    pub fn uses_scale_factors(&self) -> bool {
        match self.scheme {
            RescalingScheme::Never | RescalingScheme::Delegated => false,
            RescalingScheme::Always => true,
            RescalingScheme::Dynamic | RescalingScheme::Delayed => self.ever_underflowed,
        }
    }

    /// Forces the next scaled evaluation to recompute every node with fresh factors.
    pub fn request_full_recompute(&mut self) {
        self.full_recompute_pending = true;
    }

    /// Decides how the coming evaluation uses scale factors.
    pub fn begin_evaluation(&mut self) -> ScalingPass {
        match self.scheme {
            RescalingScheme::Never => ScalingPass::UNSCALED,
            RescalingScheme::Delegated => ScalingPass {
                delegated: true,
                ..ScalingPass::UNSCALED
            },
            RescalingScheme::Always => self.fresh_pass(),
            RescalingScheme::Delayed if self.ever_underflowed => self.fresh_pass(),
            RescalingScheme::Dynamic if self.ever_underflowed => {
                if self.countdown == 0 || self.full_recompute_pending {
                    self.retry_pass()
                } else {
                    self.countdown -= 1;
                    ScalingPass {
                        use_scale_factors: true,
                        ..ScalingPass::UNSCALED
                    }
                }
            }
            RescalingScheme::Delayed | RescalingScheme::Dynamic => ScalingPass::UNSCALED,
        }
    }

    fn fresh_pass(&mut self) -> ScalingPass {
        ScalingPass {
            full_recompute: core::mem::take(&mut self.full_recompute_pending),
            ..ScalingPass::FRESH
        }
    }

    /// Records a non-finite root result.
    pub fn record_underflow(&mut self) {
        self.ever_underflowed = true;
    }

    /// Returns `true` if the scheme allows one forced-rescaling retry.
    #[must_use]
    pub fn permits_retry(&self) -> bool {
        matches!(
            self.scheme,
            RescalingScheme::Dynamic | RescalingScheme::Delayed
        )
    }

    /// A full recompute with fresh factors; restarts the `Dynamic` countdown.
    pub fn retry_pass(&mut self) -> ScalingPass {
        self.countdown = self.frequency - 1;
        self.full_recompute_pending = false;
        ScalingPass {
            full_recompute: true,
            ..ScalingPass::FRESH
        }
    }

    /// Counts a rescue attempt; returns `true` if it should be logged.
    pub fn note_rescue(&mut self) -> bool {
        let log = self.rescue_count % RESCUE_LOG_INTERVAL == 0;
        self.rescue_count += 1;
        log
    }
}

/// Scale buffer assignment for internal nodes plus the cumulative slot.
///
/// Index `i < internal_count` belongs to internal node `tip_count + i`;
/// index `internal_count` is the cumulative accumulator.
#[derive(Clone, Debug)]
pub struct ScaleBuffers {
    registry: BufferIndexRegistry,
    /// Buffer currently holding the factors of each internal node.
    slots: Vec<usize>,
    stored_slots: Vec<usize>,
    /// The current partials were produced with scale factors.
    scaled: bool,
    stored_scaled: bool,
}

impl ScaleBuffers {
    /// Creates buffers for `internal_count` internal nodes.
    #[must_use]
    pub fn new(internal_count: usize) -> Self {
        Self {
            registry: BufferIndexRegistry::new(internal_count + 1, 0),
            slots: (0..internal_count).collect(),
            stored_slots: (0..internal_count).collect(),
            scaled: false,
            stored_scaled: false,
        }
    }

    /// Scale buffers to allocate: `2 × (internal_count + 1)`.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.registry.buffer_count()
    }

    /// Index of the cumulative accumulator.
    #[must_use]
    pub fn cumulative_index(&self) -> usize {
        self.slots.len()
    }

    /// Buffer currently holding the factors of scale index `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> usize {
        self.slots[index]
    }

    /// Returns `true` if the current partials were produced with scale factors.
    #[must_use]
    pub fn is_scaled(&self) -> bool {
        self.scaled
    }

    pub(crate) fn set_scaled(&mut self, scaled: bool) {
        self.scaled = scaled;
    }

    /// Returns `(scale_write, scale_read)` for a node being recomputed.
    ///
    /// Under delegated scaling the node's factors live with its partials
    /// buffer, so the partials slot is recorded for accumulation.
    pub fn node_io(
        &mut self,
        pass: &ScalingPass,
        index: usize,
        partials_slot: usize,
    ) -> (Option<usize>, Option<usize>) {
        if pass.use_scale_factors {
            if pass.recompute {
                self.registry.claim(index);
                self.slots[index] = self.registry.slot(index);
                (Some(self.slots[index]), None)
            } else {
                (None, Some(self.slots[index]))
            }
        } else {
            if pass.delegated {
                self.slots[index] = partials_slot;
            }
            (None, None)
        }
    }

    /// Accumulates node factors and returns the cumulative buffer to read at the root.
    pub fn accumulate(
        &mut self,
        pass: &ScalingPass,
        backend: &mut dyn LikelihoodBackend,
    ) -> Result<Option<usize>, BackendError> {
        let cumulative = self.cumulative_index();
        if pass.use_scale_factors {
            if pass.recompute {
                self.registry.claim(cumulative);
                let dest = self.registry.slot(cumulative);
                backend.reset_scale_factors(dest)?;
                backend.accumulate_scale_factors(&self.slots, Some(dest))?;
            }
            Ok(Some(self.registry.slot(cumulative)))
        } else {
            if pass.delegated {
                backend.accumulate_scale_factors(&self.slots, None)?;
            }
            Ok(None)
        }
    }

    /// Snapshots slot assignments.
    pub fn store(&mut self) {
        self.registry.store();
        self.stored_slots.copy_from_slice(&self.slots);
        self.stored_scaled = self.scaled;
    }

    /// Swaps live and stored slot assignments.
    pub fn restore(&mut self) {
        self.registry.restore();
        core::mem::swap(&mut self.slots, &mut self.stored_slots);
        core::mem::swap(&mut self.scaled, &mut self.stored_scaled);
    }
}

impl Default for ScaleBuffers {
    fn default() -> Self {
        Self::new(0)
    }
}
