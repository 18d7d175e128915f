// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Double-buffered slot assignment.

use alloc::vec;
use alloc::vec::Vec;

/// Maps logical indices (nodes, branches, scale entries) to backend buffer slots.
///
/// Indices below `first_double_buffered` own a single slot equal to the index
/// itself; these are the tips, whose data never changes during an evaluation.
/// Every other index owns a pair of slots `(i, i + pairs)` and a parity bit
/// choosing the current one. Flipping the parity never touches buffer
/// contents, so the previous values stay intact in the other slot.
///
/// [`store`](Self::store) snapshots the parities and
/// [`restore`](Self::restore) swaps the live and snapshot parities, which
/// undoes every flip since the store in O(1).
///
/// # Example
///
/// ```
/// use sylvan_pruning::BufferIndexRegistry;
///
/// // Three tips followed by two double-buffered internal nodes.
/// let mut registry = BufferIndexRegistry::new(5, 3);
/// assert_eq!(registry.buffer_count(), 7);
/// assert_eq!(registry.slot(1), 1);
/// assert_eq!(registry.slot(3), 3);
///
/// registry.store();
/// assert!(registry.claim(3));
/// assert_eq!(registry.slot(3), 5);
/// // Claiming again before the next store keeps the same slot.
/// assert!(!registry.claim(3));
/// assert_eq!(registry.slot(3), 5);
///
/// registry.restore();
/// assert_eq!(registry.slot(3), 3);
/// ```
#[derive(Clone, Debug)]
pub struct BufferIndexRegistry {
    index_count: usize,
    first_double_buffered: usize,
    /// Live parity per double-buffered index; `true` selects the upper slot.
    parity: Vec<bool>,
    /// Parity captured by the last `store`.
    stored: Vec<bool>,
}

impl BufferIndexRegistry {
    /// Creates a registry for `index_count` logical indices, of which those
    /// at or above `first_double_buffered` get two slots.
    ///
    /// # Panics
    ///
    /// Panics if `first_double_buffered > index_count`.
    #[must_use]
    pub fn new(index_count: usize, first_double_buffered: usize) -> Self {
        assert!(
            first_double_buffered <= index_count,
            "first double-buffered index {first_double_buffered} exceeds index count {index_count}"
        );
        let pairs = index_count - first_double_buffered;
        Self {
            index_count,
            first_double_buffered,
            parity: vec![false; pairs],
            stored: vec![false; pairs],
        }
    }

    /// Number of logical indices.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.index_count
    }

    /// Number of double-buffered indices.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.parity.len()
    }

    /// Number of backend buffers needed: `2 × pairs + first_double_buffered`.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        2 * self.pair_count() + self.first_double_buffered
    }

    /// Current slot for `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> usize {
        debug_assert!(index < self.index_count, "index {index} out of range");
        match index.checked_sub(self.first_double_buffered) {
            Some(pair) if self.parity[pair] => index + self.pair_count(),
            _ => index,
        }
    }

    /// Toggles the parity of `index`. Single-buffered indices are unaffected.
    pub fn flip(&mut self, index: usize) {
        if let Some(pair) = index.checked_sub(self.first_double_buffered) {
            self.parity[pair] = !self.parity[pair];
        }
    }

    /// Points `index` at the slot not referenced by the last snapshot.
    ///
    /// Returns `true` if the parity changed. Repeated claims between two
    /// snapshots are no-ops, so a pending slot can be rewritten any number of
    /// times without touching the stored one.
    pub fn claim(&mut self, index: usize) -> bool {
        match index.checked_sub(self.first_double_buffered) {
            Some(pair) if self.parity[pair] == self.stored[pair] => {
                self.parity[pair] = !self.parity[pair];
                true
            }
            _ => false,
        }
    }

    /// Snapshots the current parities.
    pub fn store(&mut self) {
        self.stored.copy_from_slice(&self.parity);
    }

    /// Swaps the live parities with the snapshot.
    pub fn restore(&mut self) {
        core::mem::swap(&mut self.parity, &mut self.stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tips_map_to_themselves() {
        let mut registry = BufferIndexRegistry::new(7, 4);
        for tip in 0..4 {
            registry.flip(tip);
            assert!(!registry.claim(tip));
            assert_eq!(registry.slot(tip), tip);
        }
        assert_eq!(registry.buffer_count(), 4 + 2 * 3);
    }

    #[test]
    fn flip_alternates_between_pair() {
        let mut registry = BufferIndexRegistry::new(5, 3);
        assert_eq!(registry.slot(4), 4);
        registry.flip(4);
        assert_eq!(registry.slot(4), 6);
        registry.flip(4);
        assert_eq!(registry.slot(4), 4);
    }

    #[test]
    fn claim_is_idempotent_until_store() {
        let mut registry = BufferIndexRegistry::new(4, 2);
        assert!(registry.claim(2));
        let pending = registry.slot(2);
        assert!(!registry.claim(2));
        assert_eq!(registry.slot(2), pending);

        registry.store();
        assert!(registry.claim(2));
        assert_ne!(registry.slot(2), pending);
    }

    #[test]
    fn restore_undoes_every_claim_since_store() {
        let mut registry = BufferIndexRegistry::new(6, 2);
        registry.claim(3);
        registry.store();
        let stored: Vec<_> = (0..6).map(|i| registry.slot(i)).collect();

        registry.claim(2);
        registry.claim(3);
        registry.claim(5);
        registry.flip(4);
        registry.restore();

        let restored: Vec<_> = (0..6).map(|i| registry.slot(i)).collect();
        assert_eq!(stored, restored);
    }

    #[test]
    fn store_without_change_restores_to_same_slots() {
        let mut registry = BufferIndexRegistry::new(3, 1);
        registry.flip(2);
        registry.store();
        registry.restore();
        assert_eq!(registry.slot(2), 4);
        assert_eq!(registry.slot(1), 1);
    }

    #[test]
    #[should_panic(expected = "exceeds index count")]
    fn rejects_more_singles_than_indices() {
        let _ = BufferIndexRegistry::new(2, 3);
    }
}
