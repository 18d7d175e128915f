// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Masks applied to the partial likelihoods of a clade.
//!
//! A restriction names a set of taxa and a mask. After the partials of the
//! taxa's most recent common ancestor are computed, they are multiplied by
//! the mask before any parent reads them. A typical use is conditioning the
//! ancestral state of a clade.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::error::PruningError;
use crate::patterns::SitePatterns;
use crate::tree::{TreeTopology, common_ancestor};

/// A taxon set and the mask applied at its MRCA.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PartialsRestriction {
    /// Taxa whose MRCA is restricted.
    pub taxa: Vec<String>,
    /// `states × patterns` (broadcast over categories) or
    /// `categories × patterns × states` values.
    pub mask: Vec<f64>,
}

impl PartialsRestriction {
    /// Creates a restriction.
    pub fn new<I, S>(taxa: I, mask: Vec<f64>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            taxa: taxa.into_iter().map(Into::into).collect(),
            mask,
        }
    }
}

#[derive(Clone, Debug)]
struct Resolved {
    taxa: Vec<String>,
    /// Mask expanded to the full partials length.
    mask: Vec<f64>,
}

/// Restrictions validated against the data and mapped onto nodes.
///
/// The node mapping is computed lazily and dropped by
/// [`invalidate`](Self::invalidate) whenever the topology may have changed.
#[derive(Clone, Debug)]
pub struct RestrictionMap {
    restrictions: Vec<Resolved>,
    node_masks: Vec<Option<usize>>,
    tips: Vec<usize>,
    stale: bool,
}

impl RestrictionMap {
    /// Validates masks and taxa, and expands masks over categories.
    pub fn new(
        restrictions: &[PartialsRestriction],
        tree: &dyn TreeTopology,
        patterns: &SitePatterns,
        category_count: usize,
    ) -> Result<Self, PruningError> {
        let per_category = patterns.state_count() * patterns.pattern_count();
        let full = per_category * category_count;
        let tips_by_taxon = tips_by_taxon(tree);

        let mut resolved = Vec::with_capacity(restrictions.len());
        for restriction in restrictions {
            let mask = if restriction.mask.len() == full {
                restriction.mask.clone()
            } else if restriction.mask.len() == per_category {
                restriction.mask.repeat(category_count)
            } else {
                return Err(PruningError::RestrictionLength {
                    actual: restriction.mask.len(),
                    per_category,
                    full,
                });
            };
            if let Some(unknown) = restriction
                .taxa
                .iter()
                .find(|taxon| !tips_by_taxon.contains_key(taxon.as_str()))
            {
                return Err(PruningError::UnknownTaxon {
                    taxon: unknown.to_string(),
                });
            }
            resolved.push(Resolved {
                taxa: restriction.taxa.clone(),
                mask,
            });
        }

        Ok(Self {
            restrictions: resolved,
            node_masks: vec![None; tree.node_count()],
            tips: Vec::new(),
            stale: true,
        })
    }

    /// Number of restrictions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.restrictions.len()
    }

    /// Returns `true` if there are no restrictions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restrictions.is_empty()
    }

    /// Drops the node mapping; it is rebuilt on the next lookup.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    /// Returns `true` if the node mapping will be rebuilt on the next lookup.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn refresh(&mut self, tree: &dyn TreeTopology) {
        self.node_masks.fill(None);
        let tips_by_taxon = tips_by_taxon(tree);
        for (index, restriction) in self.restrictions.iter().enumerate() {
            self.tips.clear();
            self.tips.extend(
                restriction
                    .taxa
                    .iter()
                    .filter_map(|taxon| tips_by_taxon.get(taxon.as_str()).copied()),
            );
            if let Some(node) = common_ancestor(tree, &self.tips) {
                // With overlapping MRCAs the later restriction wins.
                self.node_masks[node] = Some(index);
            }
        }
        self.stale = false;
    }

    /// Restriction index applied at `node`, if any.
    pub fn mask_for(&mut self, tree: &dyn TreeTopology, node: usize) -> Option<usize> {
        if self.stale {
            self.refresh(tree);
        }
        self.node_masks[node]
    }

    /// Full-length mask of restriction `index`.
    #[must_use]
    pub fn mask(&self, index: usize) -> &[f64] {
        &self.restrictions[index].mask
    }
}

fn tips_by_taxon(tree: &dyn TreeTopology) -> HashMap<&str, usize> {
    (0..tree.tip_count())
        .filter_map(|tip| tree.taxon(tip).map(|taxon| (taxon, tip)))
        .collect()
}
