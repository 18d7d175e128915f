// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine configuration.

use alloc::vec::Vec;

use crate::rescaling::{DEFAULT_RESCALING_FREQUENCY, RescalingScheme};
use crate::restriction::PartialsRestriction;

/// Options fixed at engine construction.
///
/// # Example
///
/// ```
/// use sylvan_pruning::{LikelihoodConfig, RescalingScheme};
///
/// let config = LikelihoodConfig::default()
///     .with_rescaling(RescalingScheme::Delayed)
///     .with_rescaling_frequency(10);
/// assert_eq!(config.rescaling, RescalingScheme::Delayed);
/// assert!(config.restrictions.is_empty());
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LikelihoodConfig {
    /// Underflow rescaling scheme.
    pub rescaling: RescalingScheme,
    /// Evaluations between fresh-factor recomputes under
    /// [`RescalingScheme::Dynamic`].
    pub rescaling_frequency: u32,
    /// Upload compact tip states as one-hot partials.
    ///
    /// Needed by backends that do not accept compact states.
    pub use_ambiguities: bool,
    /// Clade masks.
    pub restrictions: Vec<PartialsRestriction>,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            rescaling: RescalingScheme::default(),
            rescaling_frequency: DEFAULT_RESCALING_FREQUENCY,
            use_ambiguities: false,
            restrictions: Vec::new(),
        }
    }
}

impl LikelihoodConfig {
    /// Sets the rescaling scheme.
    #[must_use]
    pub fn with_rescaling(mut self, scheme: RescalingScheme) -> Self {
        self.rescaling = scheme;
        self
    }

    /// Sets the `Dynamic` recompute frequency.
    #[must_use]
    pub fn with_rescaling_frequency(mut self, frequency: u32) -> Self {
        self.rescaling_frequency = frequency;
        self
    }

    /// Uploads tip states as partials.
    #[must_use]
    pub fn with_ambiguities(mut self, use_ambiguities: bool) -> Self {
        self.use_ambiguities = use_ambiguities;
        self
    }

    /// Adds a clade mask.
    #[must_use]
    pub fn with_restriction(mut self, restriction: PartialsRestriction) -> Self {
        self.restrictions.push(restriction);
        self
    }
}
