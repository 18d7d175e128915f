// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-node dirty flags and model refresh flags.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::tree::TreeTopology;

bitflags! {
    /// Model-level uploads that must happen before the next evaluation.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct RefreshFlags: u8 {
        /// Substitution model parameters (eigen decomposition, frequencies).
        const SUBSTITUTION = 1 << 0;
        /// Site-rate category rates.
        const SITE_RATES = 1 << 1;
        /// Restriction masks must be re-mapped onto the current topology.
        const RESTRICTIONS = 1 << 2;
    }
}

/// Tracks which nodes need their partial likelihoods recomputed.
///
/// A node's flag means "the branch above this node changed, or its data
/// changed". Any mark also clears the whole-likelihood validity flag, so a
/// cached log-likelihood is only ever reported while every node is clean.
///
/// The tracker keeps a generation counter that advances on every mutation,
/// which can be used to detect whether anything changed between two
/// observations.
#[derive(Clone, Debug)]
pub struct DirtyTracker {
    nodes: Vec<bool>,
    dirty_count: usize,
    refresh: RefreshFlags,
    likelihood_known: bool,
    generation: u64,
    stored_nodes: Vec<bool>,
    stored_refresh: RefreshFlags,
    stored_known: bool,
}

impl DirtyTracker {
    /// Creates a tracker for `node_count` nodes with everything dirty.
    #[must_use]
    pub fn new(node_count: usize) -> Self {
        Self {
            nodes: vec![true; node_count],
            dirty_count: node_count,
            refresh: RefreshFlags::all(),
            likelihood_known: false,
            generation: 0,
            stored_nodes: vec![true; node_count],
            stored_refresh: RefreshFlags::all(),
            stored_known: false,
        }
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the current generation.
    ///
    /// The generation is incremented on every mutation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.likelihood_known = false;
    }

    /// Marks one node dirty.
    ///
    /// Returns `true` if the node was newly marked.
    pub fn mark_self(&mut self, node: usize) -> bool {
        self.touch();
        let was = core::mem::replace(&mut self.nodes[node], true);
        if !was {
            self.dirty_count += 1;
        }
        !was
    }

    /// Marks a node and its immediate children.
    ///
    /// This is what a height change needs: the node's own branch and the
    /// two branches below it change length.
    pub fn mark_self_and_children<T: TreeTopology + ?Sized>(&mut self, tree: &T, node: usize) {
        self.mark_self(node);
        if let Some(children) = tree.children(node) {
            for child in children {
                self.mark_self(child);
            }
        }
    }

    /// Marks a node and every node below it.
    pub fn mark_self_and_descendants<T: TreeTopology + ?Sized>(&mut self, tree: &T, node: usize) {
        self.mark_self(node);
        if let Some(children) = tree.children(node) {
            for child in children {
                self.mark_self_and_descendants(tree, child);
            }
        }
    }

    /// Marks every node.
    pub fn mark_all(&mut self) {
        self.touch();
        self.nodes.fill(true);
        self.dirty_count = self.nodes.len();
    }

    /// Returns `true` if `node` is marked.
    #[must_use]
    pub fn is_dirty(&self, node: usize) -> bool {
        self.nodes[node]
    }

    /// Returns `true` if any node is marked.
    #[must_use]
    pub fn any_dirty(&self) -> bool {
        self.dirty_count > 0
    }

    /// Number of marked nodes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    /// Returns an iterator over the marked nodes in ascending order.
    pub fn dirty_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(node, &dirty)| dirty.then_some(node))
    }

    /// Returns `true` if the cached whole-tree log-likelihood is current.
    #[must_use]
    pub fn likelihood_known(&self) -> bool {
        self.likelihood_known
    }

    /// Requests model-level refreshes before the next evaluation.
    ///
    /// A refresh always invalidates the cached likelihood.
    pub fn request(&mut self, flags: RefreshFlags) {
        self.touch();
        self.refresh |= flags;
    }

    /// Schedules model-level refreshes without invalidating the cached likelihood.
    ///
    /// Used when backend-side model state may be out of date but the cached
    /// value is still correct, as after restoring a snapshot.
    pub fn schedule(&mut self, flags: RefreshFlags) {
        self.generation = self.generation.wrapping_add(1);
        self.refresh |= flags;
    }

    /// Returns `true` if any of `flags` is pending.
    #[must_use]
    pub fn needs(&self, flags: RefreshFlags) -> bool {
        self.refresh.intersects(flags)
    }

    /// Pending refresh flags.
    #[must_use]
    pub fn refresh_flags(&self) -> RefreshFlags {
        self.refresh
    }

    /// Clears all node and refresh flags and records the likelihood as known.
    pub fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.nodes.fill(false);
        self.dirty_count = 0;
        self.refresh = RefreshFlags::empty();
        self.likelihood_known = true;
    }

    /// Snapshots flags and the validity bit.
    pub fn store(&mut self) {
        self.stored_nodes.copy_from_slice(&self.nodes);
        self.stored_refresh = self.refresh;
        self.stored_known = self.likelihood_known;
    }

    /// Restores the snapshot, keeping any flag that is set in either state.
    ///
    /// A change that was marked but never evaluated before the restore stays
    /// dirty, so the next evaluation recomputes it against the restored
    /// model. The likelihood is only known again if nothing stays dirty.
    pub fn restore(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        let mut count = 0;
        for (live, stored) in self.nodes.iter_mut().zip(&self.stored_nodes) {
            *live |= *stored;
            count += usize::from(*live);
        }
        self.dirty_count = count;
        self.refresh |= self.stored_refresh;
        self.likelihood_known = self.stored_known && count == 0;
    }
}
