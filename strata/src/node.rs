// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Dirty trie nodes and owner-keyed node sets.

use std::collections::HashMap;

use bytes::Bytes;

use crate::types::Hash;

/// A trie node blob tagged with its hash. Node blobs are immutable and
/// shared between layers and the node buffer without copying.
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    /// The hash of the blob; zero for a deleted node.
    pub hash: Hash,
    /// The encoded node; empty for a deleted node.
    pub blob: Bytes,
}

impl Node {
    /// Wraps an encoded node and its hash.
    #[must_use]
    pub fn new(hash: Hash, blob: Bytes) -> Self {
        Node { hash, blob }
    }

    /// Hashes an encoded node and wraps it.
    #[must_use]
    pub fn from_blob(blob: Bytes) -> Self {
        Node {
            hash: Hash::of(&blob),
            blob,
        }
    }

    /// The marker for a node removed from the trie.
    #[must_use]
    pub fn deleted() -> Self {
        Node {
            hash: Hash::ZERO,
            blob: Bytes::new(),
        }
    }

    /// Returns whether the node marks a deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.blob.is_empty()
    }

    /// Returns the payload size of the node.
    #[must_use]
    pub fn size(&self) -> usize {
        self.blob.len()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("hash", &format_args!("{:.8}", self.hash))
            .field("len", &self.blob.len())
            .finish()
    }
}

/// Dirty nodes of one trie, keyed by node path.
pub type PathMap = HashMap<Vec<u8>, Node>;

/// Dirty nodes of a whole state transition, keyed by the owning trie.
///
/// The zero owner designates the account trie; any other owner is the
/// account hash of a contract whose storage trie the nodes belong to.
#[derive(Clone, Default)]
pub struct NodeSet {
    nodes: HashMap<Hash, PathMap>,
}

impl NodeSet {
    /// Creates an empty node set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dirty node.
    pub fn insert(&mut self, owner: Hash, path: Vec<u8>, node: Node) {
        self.nodes.entry(owner).or_default().insert(path, node);
    }

    /// Looks up a dirty node.
    #[must_use]
    pub fn get(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.get(owner)?.get(path)
    }

    /// Returns the per-owner map, if any node of that trie is dirty.
    #[must_use]
    pub fn subset(&self, owner: &Hash) -> Option<&PathMap> {
        self.nodes.get(owner)
    }

    /// Iterates all `(owner, paths)` groups in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &PathMap)> {
        self.nodes.iter()
    }

    /// Merges another node set into this one, later writes winning.
    pub fn merge(&mut self, other: NodeSet) {
        for (owner, subset) in other.nodes {
            let current = self.nodes.entry(owner).or_default();
            for (path, node) in subset {
                current.insert(path, node);
            }
        }
    }

    /// Returns the number of dirty nodes across all owners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.values().map(HashMap::len).sum()
    }

    /// Returns whether no node is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Approximate payload size: blob bytes plus path bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.nodes
            .values()
            .flat_map(|subset| subset.iter())
            .map(|(path, node)| (path.len() + node.size()) as u64)
            .sum()
    }

    /// Returns the owners and paths in sorted order, for deterministic
    /// serialization.
    #[must_use]
    pub fn sorted(&self) -> Vec<(&Hash, Vec<(&Vec<u8>, &Node)>)> {
        let mut owners: Vec<_> = self
            .nodes
            .iter()
            .map(|(owner, subset)| {
                let mut paths: Vec<_> = subset.iter().collect();
                paths.sort_by(|a, b| a.0.cmp(b.0));
                (owner, paths)
            })
            .collect();
        owners.sort_by(|a, b| a.0.cmp(b.0));
        owners
    }
}

impl std::fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSet")
            .field("owners", &self.nodes.len())
            .field("nodes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_sentinel() {
        let node = Node::deleted();
        assert!(node.is_deleted());
        assert!(node.hash.is_zero());
        assert_eq!(node.size(), 0);

        let live = Node::from_blob(Bytes::from_static(b"blob"));
        assert!(!live.is_deleted());
        assert_eq!(live.hash, Hash::of(b"blob"));
    }

    #[test]
    fn test_merge_and_size() {
        let owner = Hash::from([1u8; 32]);
        let mut set = NodeSet::new();
        set.insert(Hash::ZERO, vec![1], Node::from_blob(Bytes::from_static(b"aa")));
        set.insert(owner, vec![2], Node::from_blob(Bytes::from_static(b"bb")));

        let mut other = NodeSet::new();
        other.insert(Hash::ZERO, vec![1], Node::deleted());
        other.insert(Hash::ZERO, vec![3], Node::from_blob(Bytes::from_static(b"cc")));
        set.merge(other);

        assert_eq!(set.len(), 3);
        assert!(set.get(&Hash::ZERO, &[1]).unwrap().is_deleted());
        assert_eq!(set.get(&Hash::ZERO, &[3]).unwrap().blob.as_ref(), b"cc");
        // 1 path byte + 0 blob, 1 + 2, 1 + 2
        assert_eq!(set.size(), 7);
    }
}
