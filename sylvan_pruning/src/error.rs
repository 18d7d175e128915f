// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for the engine, the backend protocol, and the Newick reader.

use alloc::string::String;

use thiserror::Error;

/// Errors reported by a [`LikelihoodBackend`](crate::LikelihoodBackend).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    /// A call was made before [`allocate`](crate::LikelihoodBackend::allocate).
    #[error("backend buffers have not been allocated")]
    NotAllocated,
    /// A slot id was outside the allocated range for its buffer kind.
    #[error("{kind} slot {slot} is out of range (allocated {allocated})")]
    InvalidSlot {
        /// Buffer kind, e.g. `"partials"` or `"matrix"`.
        kind: &'static str,
        /// The offending slot id.
        slot: usize,
        /// Number of allocated buffers of this kind.
        allocated: usize,
    },
    /// A value array had the wrong length.
    #[error("expected {expected} values for {what}, got {actual}")]
    Shape {
        /// What was being uploaded.
        what: &'static str,
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },
    /// The backend does not implement an optional capability.
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
}

/// Errors reported by [`TreeLikelihood`](crate::TreeLikelihood) and its builder.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum PruningError {
    /// A branch would have negative duration after applying its rate.
    ///
    /// This is fatal for the evaluation in which it is detected; no backend
    /// call is made for that evaluation.
    #[error(
        "negative branch duration {duration} on the branch above node {node} (parent {parent}); \
         node height {node_height}, parent height {parent_height}"
    )]
    NegativeBranchDuration {
        /// Child end of the branch.
        node: usize,
        /// Parent end of the branch.
        parent: usize,
        /// `rate × (parent_height − node_height)`.
        duration: f64,
        /// Height of `node`.
        node_height: f64,
        /// Height of `parent`.
        parent_height: f64,
    },
    /// A tip of the tree names a taxon that has no observed data.
    #[error("taxon `{taxon}` is in the tree but not in the site patterns")]
    MissingTaxon {
        /// The taxon label.
        taxon: String,
    },
    /// A tip of the tree carries no taxon label.
    #[error("tip {tip} has no taxon label")]
    UnlabelledTip {
        /// The tip node.
        tip: usize,
    },
    /// A taxon named by the caller is not known.
    #[error("taxon `{taxon}` is not a tip of the tree")]
    UnknownTaxon {
        /// The taxon label.
        taxon: String,
    },
    /// The tree violates the numbering or arity contract.
    #[error("node {node} is not a binary internal node numbered after the tips")]
    NotBinary {
        /// The offending node.
        node: usize,
    },
    /// The tree handed to an evaluation does not match the construction-time shape.
    #[error("tree has {nodes} nodes and {tips} tips; expected {expected_nodes} and {expected_tips}")]
    TopologyMismatch {
        /// Node count of the supplied tree.
        nodes: usize,
        /// Tip count of the supplied tree.
        tips: usize,
        /// Node count fixed at construction.
        expected_nodes: usize,
        /// Tip count fixed at construction.
        expected_tips: usize,
    },
    /// Observed data for a taxon has the wrong number of entries.
    #[error("data for taxon `{taxon}` has {actual} entries, expected {expected}")]
    PatternShape {
        /// The taxon label.
        taxon: String,
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },
    /// The substitution process and the data disagree on the state count.
    #[error("site patterns have {patterns} states but the substitution process has {process}")]
    StateCountMismatch {
        /// State count of the data.
        patterns: usize,
        /// State count of the process.
        process: usize,
    },
    /// A restriction mask has a length that cannot be broadcast.
    #[error(
        "restriction mask has {actual} entries; expected {per_category} (states × patterns) \
         or {full} (× categories)"
    )]
    RestrictionLength {
        /// Supplied length.
        actual: usize,
        /// `states × patterns`.
        per_category: usize,
        /// `states × patterns × categories`.
        full: usize,
    },
    /// An error from the compute backend, propagated unchanged.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors from [`SimpleTree::from_newick`](crate::SimpleTree::from_newick).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Input ended in the middle of a tree.
    #[error("unexpected end of Newick input")]
    UnexpectedEnd,
    /// A character that cannot appear at this position.
    #[error("unexpected character `{found}` at byte {position}")]
    UnexpectedChar {
        /// The character found.
        found: char,
        /// Byte offset into the input.
        position: usize,
    },
    /// A branch length could not be parsed as a number.
    #[error("invalid branch length at byte {position}")]
    BadLength {
        /// Byte offset of the length.
        position: usize,
    },
    /// An internal node does not have exactly two children.
    #[error("internal node with {children} children at byte {position}; only binary trees are supported")]
    NotBinary {
        /// Number of children found.
        children: usize,
        /// Byte offset of the closing parenthesis.
        position: usize,
    },
    /// A tip has no label.
    #[error("unlabelled tip at byte {position}")]
    MissingLabel {
        /// Byte offset of the tip.
        position: usize,
    },
    /// The same tip label appears twice.
    #[error("duplicate taxon `{0}`")]
    DuplicateTaxon(String),
}
