// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tree topology contract and a small reference tree.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::error::TreeError;

/// Read access to a rooted binary tree with node heights.
///
/// Nodes are numbered `0..node_count()`. Tips are `0..tip_count()` and
/// internal nodes (including the root) are `tip_count()..node_count()`;
/// the engine relies on this numbering for its per-internal-node arrays.
pub trait TreeTopology {
    /// Total number of nodes.
    fn node_count(&self) -> usize;
    /// Number of tips.
    fn tip_count(&self) -> usize;
    /// The root node.
    fn root(&self) -> usize;
    /// Parent of `node`, or `None` for the root.
    fn parent(&self, node: usize) -> Option<usize>;
    /// The two children of an internal node, or `None` for a tip.
    fn children(&self, node: usize) -> Option<[usize; 2]>;
    /// Height of `node` above the present.
    fn height(&self, node: usize) -> f64;
    /// Taxon label of a tip.
    fn taxon(&self, node: usize) -> Option<&str>;

    /// Returns `true` if `node` is a tip.
    fn is_tip(&self, node: usize) -> bool {
        node < self.tip_count()
    }
}

/// What changed in a tree, as reported to
/// [`TreeLikelihood::tree_changed`](crate::TreeLikelihood::tree_changed).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TreeChange {
    /// One node's height changed; its own branch and its children's branches are affected.
    NodeChanged(usize),
    /// Everything below (and including) a node changed.
    SubtreeChanged(usize),
    /// The whole tree was replaced or rearranged.
    TreeReplaced,
    /// A change that does not affect heights or topology, e.g. a label edit.
    AnnotationChanged,
}

impl TreeChange {
    /// Returns `true` if the change can move the MRCA of a taxon set.
    #[must_use]
    pub fn affects_topology(self) -> bool {
        !matches!(self, Self::AnnotationChanged)
    }
}

/// Most recent common ancestor of a set of nodes.
///
/// Returns `None` for an empty set.
#[must_use]
pub fn common_ancestor<T: TreeTopology + ?Sized>(tree: &T, nodes: &[usize]) -> Option<usize> {
    let (&first, rest) = nodes.split_first()?;
    let mut chain = Vec::new();
    let mut position = vec![None; tree.node_count()];
    let mut cursor = Some(first);
    while let Some(node) = cursor {
        position[node] = Some(chain.len());
        chain.push(node);
        cursor = tree.parent(node);
    }
    let mut highest = 0;
    for &node in rest {
        let mut cursor = node;
        loop {
            if let Some(at) = position[cursor] {
                highest = highest.max(at);
                break;
            }
            match tree.parent(cursor) {
                Some(parent) => cursor = parent,
                // Disconnected input; the root is the only safe answer.
                None => return Some(tree.root()),
            }
        }
    }
    Some(chain[highest])
}

/// A plain, owned binary tree.
///
/// Heights are stored per node, so moving a node only touches one value;
/// callers then report the change to the engine with
/// [`TreeChange::NodeChanged`].
///
/// # Example
///
/// ```
/// use sylvan_pruning::{SimpleTree, TreeTopology};
///
/// let tree = SimpleTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
/// assert_eq!(tree.node_count(), 5);
/// assert_eq!(tree.tip_count(), 3);
/// assert_eq!(tree.root(), 4);
/// assert_eq!(tree.taxon(0), Some("A"));
/// assert_eq!(tree.height(3), 1.0);
/// assert_eq!(tree.height(4), 2.0);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SimpleTree {
    parents: Vec<Option<usize>>,
    children: Vec<Option<[usize; 2]>>,
    heights: Vec<f64>,
    taxa: Vec<String>,
    tips_by_taxon: HashMap<String, usize>,
}

impl SimpleTree {
    /// Parses a rooted binary Newick tree.
    ///
    /// Tips are numbered in order of appearance and internal nodes in
    /// post-order, so the root is always the last node. Node heights are
    /// derived from branch lengths: the deepest tip sits at height zero.
    /// Missing branch lengths are read as zero and the root's length is
    /// ignored.
    pub fn from_newick(input: &str) -> Result<Self, TreeError> {
        let mut parser = NewickParser {
            bytes: input.as_bytes(),
            input,
            pos: 0,
        };
        let root = parser.subtree()?;
        parser.skip_whitespace();
        match parser.peek() {
            Some(b';') => parser.pos += 1,
            Some(other) => {
                return Err(TreeError::UnexpectedChar {
                    found: char::from(other),
                    position: parser.pos,
                });
            }
            None => {}
        }
        parser.skip_whitespace();
        if let Some(other) = parser.peek() {
            return Err(TreeError::UnexpectedChar {
                found: char::from(other),
                position: parser.pos,
            });
        }

        let tip_count = root.tip_count();
        let node_count = 2 * tip_count - 1;
        let mut tree = Self {
            parents: vec![None; node_count],
            children: vec![None; node_count],
            heights: vec![0.0; node_count],
            taxa: Vec::with_capacity(tip_count),
            tips_by_taxon: HashMap::with_capacity(tip_count),
        };
        let mut depths = vec![0.0; node_count];
        let mut next_internal = tip_count;
        tree.number(&root, 0.0, &mut depths, &mut next_internal)?;

        let max_depth = depths.iter().copied().fold(0.0, f64::max);
        for (height, depth) in tree.heights.iter_mut().zip(&depths) {
            *height = max_depth - depth;
        }
        Ok(tree)
    }

    fn number(
        &mut self,
        node: &ParsedNode,
        depth: f64,
        depths: &mut [f64],
        next_internal: &mut usize,
    ) -> Result<usize, TreeError> {
        match &node.kind {
            ParsedKind::Tip(label) => {
                let id = self.taxa.len();
                if self.tips_by_taxon.insert(label.clone(), id).is_some() {
                    return Err(TreeError::DuplicateTaxon(label.clone()));
                }
                self.taxa.push(label.clone());
                depths[id] = depth;
                Ok(id)
            }
            ParsedKind::Internal(pair) => {
                let left = self.number(&pair[0], depth + pair[0].length, depths, next_internal)?;
                let right = self.number(&pair[1], depth + pair[1].length, depths, next_internal)?;
                let id = *next_internal;
                *next_internal += 1;
                self.children[id] = Some([left, right]);
                self.parents[left] = Some(id);
                self.parents[right] = Some(id);
                depths[id] = depth;
                Ok(id)
            }
        }
    }

    /// Sets the height of `node`.
    ///
    /// This does not check that the parent stays above its children; a
    /// violated ordering is reported by the next evaluation as a negative
    /// branch duration.
    pub fn set_height(&mut self, node: usize, height: f64) {
        self.heights[node] = height;
    }

    /// Tip node carrying `taxon`.
    #[must_use]
    pub fn tip_for_taxon(&self, taxon: &str) -> Option<usize> {
        self.tips_by_taxon.get(taxon).copied()
    }

    /// Length of the branch above `node`, or `None` for the root.
    #[must_use]
    pub fn branch_length(&self, node: usize) -> Option<f64> {
        self.parents[node].map(|parent| self.heights[parent] - self.heights[node])
    }
}

impl TreeTopology for SimpleTree {
    fn node_count(&self) -> usize {
        self.parents.len()
    }

    fn tip_count(&self) -> usize {
        self.taxa.len()
    }

    fn root(&self) -> usize {
        self.parents.len() - 1
    }

    fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    fn children(&self, node: usize) -> Option<[usize; 2]> {
        self.children[node]
    }

    fn height(&self, node: usize) -> f64 {
        self.heights[node]
    }

    fn taxon(&self, node: usize) -> Option<&str> {
        self.taxa.get(node).map(String::as_str)
    }
}

// ----- Newick reader -----

struct ParsedNode {
    length: f64,
    kind: ParsedKind,
}

enum ParsedKind {
    Tip(String),
    Internal(alloc::boxed::Box<[ParsedNode; 2]>),
}

impl ParsedNode {
    fn tip_count(&self) -> usize {
        match &self.kind {
            ParsedKind::Tip(_) => 1,
            ParsedKind::Internal(pair) => pair[0].tip_count() + pair[1].tip_count(),
        }
    }
}

struct NewickParser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> NewickParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn subtree(&mut self) -> Result<ParsedNode, TreeError> {
        self.skip_whitespace();
        let start = self.pos;
        let kind = if self.peek() == Some(b'(') {
            self.pos += 1;
            let mut parsed = Vec::with_capacity(2);
            loop {
                parsed.push(self.subtree()?);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    Some(other) => {
                        return Err(TreeError::UnexpectedChar {
                            found: char::from(other),
                            position: self.pos,
                        });
                    }
                    None => return Err(TreeError::UnexpectedEnd),
                }
            }
            // Internal labels are accepted and ignored.
            let _ = self.label();
            let children = parsed.len();
            let pair: [ParsedNode; 2] = parsed.try_into().map_err(|_| TreeError::NotBinary {
                children,
                position: self.pos,
            })?;
            ParsedKind::Internal(alloc::boxed::Box::new(pair))
        } else {
            let label = self.label();
            if label.is_empty() {
                return match self.peek() {
                    None => Err(TreeError::UnexpectedEnd),
                    Some(b':' | b',' | b')' | b';') => Err(TreeError::MissingLabel { position: start }),
                    Some(other) => Err(TreeError::UnexpectedChar {
                        found: char::from(other),
                        position: self.pos,
                    }),
                };
            }
            ParsedKind::Tip(label.to_string())
        };
        let length = self.length()?;
        Ok(ParsedNode { length, kind })
    }

    fn label(&mut self) -> &'a str {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b'(' | b')' | b',' | b':' | b';') && !b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn length(&mut self) -> Result<f64, TreeError> {
        self.skip_whitespace();
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
        {
            self.pos += 1;
        }
        self.input[start..self.pos]
            .parse::<f64>()
            .map_err(|_| TreeError::BadLength { position: start })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_tips_first_and_root_last() {
        let tree = SimpleTree::from_newick("((A:1,B:2):1,(C:1,D:1):3);").unwrap();
        assert_eq!(tree.tip_count(), 4);
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.root(), 6);
        assert_eq!(tree.children(4), Some([0, 1]));
        assert_eq!(tree.children(5), Some([2, 3]));
        assert_eq!(tree.children(6), Some([4, 5]));
        assert_eq!(tree.parent(6), None);
        assert!(tree.is_tip(3));
        assert!(!tree.is_tip(4));
    }

    #[test]
    fn heights_are_measured_from_the_deepest_tip() {
        let tree = SimpleTree::from_newick("((A:1,B:2):1,(C:1,D:1):3);").unwrap();
        // C and D are the deepest tips.
        assert_eq!(tree.height(6), 4.0);
        assert_eq!(tree.height(4), 3.0);
        assert_eq!(tree.height(5), 1.0);
        assert_eq!(tree.height(0), 2.0);
        assert_eq!(tree.height(1), 1.0);
        assert_eq!(tree.height(3), 0.0);
        assert_eq!(tree.branch_length(1), Some(2.0));
        assert_eq!(tree.branch_length(6), None);
    }

    #[test]
    fn tolerates_whitespace_internal_labels_and_missing_semicolon() {
        let tree = SimpleTree::from_newick(" ( A : 0.5 , B:0.5 ) root ").unwrap();
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.tip_for_taxon("B"), Some(1));
        assert_eq!(tree.height(2), 0.5);
    }

    #[test]
    fn rejects_polytomies() {
        let err = SimpleTree::from_newick("(A:1,B:1,C:1);").unwrap_err();
        assert!(matches!(err, TreeError::NotBinary { children: 3, .. }));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(SimpleTree::from_newick("((A:1,B:1)"), Err(TreeError::UnexpectedEnd));
        assert!(matches!(
            SimpleTree::from_newick("(A:x,B:1);"),
            Err(TreeError::BadLength { position: 3 })
        ));
        assert!(matches!(
            SimpleTree::from_newick("(:1,B:1);"),
            Err(TreeError::MissingLabel { position: 1 })
        ));
        assert!(matches!(
            SimpleTree::from_newick("(A,A);"),
            Err(TreeError::DuplicateTaxon(_))
        ));
        assert!(matches!(
            SimpleTree::from_newick("(A,B);x"),
            Err(TreeError::UnexpectedChar { found: 'x', .. })
        ));
    }

    #[test]
    fn common_ancestor_of_tip_sets() {
        let tree = SimpleTree::from_newick("(((A,B),C),(D,E));").unwrap();
        let a = tree.tip_for_taxon("A").unwrap();
        let b = tree.tip_for_taxon("B").unwrap();
        let c = tree.tip_for_taxon("C").unwrap();
        let d = tree.tip_for_taxon("D").unwrap();
        let ab = tree.parent(a).unwrap();
        let abc = tree.parent(c).unwrap();

        assert_eq!(common_ancestor(&tree, &[a, b]), Some(ab));
        assert_eq!(common_ancestor(&tree, &[b, c, a]), Some(abc));
        assert_eq!(common_ancestor(&tree, &[a, d]), Some(tree.root()));
        assert_eq!(common_ancestor(&tree, &[c]), Some(c));
        assert_eq!(common_ancestor(&tree, &[]), None);
    }

    #[test]
    fn set_height_moves_one_node() {
        let mut tree = SimpleTree::from_newick("((A:1,B:1):1,C:2);").unwrap();
        tree.set_height(3, 1.5);
        assert_eq!(tree.branch_length(0), Some(1.5));
        assert_eq!(tree.branch_length(3), Some(0.5));
        assert_eq!(tree.branch_length(2), Some(2.0));
    }
}
