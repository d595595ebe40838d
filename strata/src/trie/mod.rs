// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The authenticated trie interface.
//!
//! The layered database never interprets trie nodes itself; everything
//! it needs from the trie implementation is expressed through the traits
//! in this module. [mem] ships a deterministic reference implementation
//! used by the tests and the inspection tooling; a production deployment
//! plugs a Merkle-Patricia or Verkle trie into the same seams.

pub mod mem;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::node::NodeSet;
use crate::types::Hash;
use strata_storage::{schema, KeyValueReader, Store};

/// Where a trie reads its nodes from.
///
/// A missing node yields an empty blob, not an error: the trie traversal
/// itself decides whether absence is fatal. When an expected hash is
/// demanded, implementations must verify it and fail with
/// [Error::UnexpectedNode] on a mismatch.
pub trait NodeSource {
    /// Resolves the node of `owner` at `path`.
    fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes>;
}

/// A range proof attesting one contiguous segment of a trie.
#[derive(Clone, Debug, Default)]
pub struct RangeProof {
    /// The proof nodes, opaque to everything but the trie
    /// implementation that produced them.
    pub nodes: Vec<Vec<u8>>,
}

/// An authenticated key-value map whose root hash commits to all
/// entries.
pub trait Trie {
    /// The root hash the trie currently commits to.
    fn root(&self) -> Hash;

    /// Reads the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Stages a value write. Not visible to the root until [commit].
    ///
    /// [commit]: Trie::commit
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Stages a key deletion.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Applies all staged writes, returning the new root and the dirty
    /// node set of the mutation.
    fn commit(&mut self) -> Result<(Hash, NodeSet)>;

    /// Iterates the trie's nodes in deterministic order, starting at the
    /// leaf with the smallest key greater than or equal to `start`.
    fn node_iterator(&self, start: &[u8]) -> Result<Box<dyn NodeIterator + '_>>;

    /// Produces a proof for the segment spanning `origin` through
    /// `last`.
    fn range_proof(&self, origin: &[u8], last: &[u8]) -> Result<RangeProof>;
}

/// A cursor over the nodes of a trie.
pub trait NodeIterator {
    /// Advances to the next node. Returns `Ok(false)` once exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Path of the current node within its trie.
    fn path(&self) -> &[u8];

    /// Hash of the current node.
    fn hash(&self) -> Hash;

    /// Encoded blob of the current node.
    fn blob(&self) -> &[u8];

    /// `(key, value)` when the current node is a leaf.
    fn leaf(&self) -> Option<(&[u8], &[u8])>;
}

/// An incremental trie builder consuming keys in ascending order,
/// reproducing the root without retaining internal nodes.
pub trait StackTrie {
    /// Feeds the next key-value pair. Keys must arrive strictly
    /// ascending.
    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Finalizes the trie and returns its root hash.
    fn finish(&mut self) -> Hash;
}

/// Callback receiving every node hash (and blob) a [StackTrie] computes.
pub type OnStackNode<'a> = Box<dyn FnMut(&Hash, &[u8]) + 'a>;

/// The trie implementation facade handed to the database.
pub trait TrieLoader: Send + Sync {
    /// Opens the account trie committed to by `root`.
    fn open<'a>(&self, root: &Hash, source: &'a dyn NodeSource) -> Result<Box<dyn Trie + 'a>>;

    /// Opens the storage trie of account `owner` committed to by `root`.
    fn open_storage<'a>(
        &self,
        owner: &Hash,
        root: &Hash,
        source: &'a dyn NodeSource,
    ) -> Result<Box<dyn Trie + 'a>>;

    /// Creates a stack trie that reports every computed node through
    /// `on_node`.
    fn stack_trie<'a>(&self, on_node: OnStackNode<'a>) -> Box<dyn StackTrie + 'a>;

    /// Verifies that `(keys, vals)` is exactly the trie segment starting
    /// at the first key >= `origin`. Returns whether the trie continues
    /// past the last supplied key.
    fn verify_range_proof(
        &self,
        root: &Hash,
        origin: &[u8],
        keys: &[Vec<u8>],
        vals: &[Vec<u8>],
        proof: &RangeProof,
    ) -> Result<bool>;
}

/// A [NodeSource] reading persisted nodes straight from the store's
/// path-keyed tables, bypassing any in-memory layers.
pub struct StoreNodeSource<'a> {
    store: &'a dyn Store,
}

impl<'a> StoreNodeSource<'a> {
    /// Wraps a store handle.
    #[must_use]
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }
}

impl NodeSource for StoreNodeSource<'_> {
    fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        let blob = if owner.is_zero() {
            schema::read_account_trie_node(self.store, path)?
        } else {
            schema::read_storage_trie_node(self.store, owner.as_ref(), path)?
        };
        let blob = Bytes::from(blob.unwrap_or_default());
        if let Some(expected) = expected {
            if blob.is_empty() {
                return Err(Error::MissingNode {
                    owner: *owner,
                    path: path.to_vec(),
                });
            }
            let got = Hash::of(&blob);
            if got != *expected {
                return Err(Error::UnexpectedNode {
                    expected: *expected,
                    got,
                    owner: *owner,
                    path: path.to_vec(),
                });
            }
        }
        Ok(blob)
    }
}

/// A [NodeSource] over a hash-addressed node layout, where every node is
/// stored under its own hash. Only lookups demanding an expected hash
/// can be resolved.
pub struct HashNodeSource<'a> {
    store: &'a dyn Store,
}

impl<'a> HashNodeSource<'a> {
    /// Wraps a store handle.
    #[must_use]
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }
}

impl NodeSource for HashNodeSource<'_> {
    fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        let Some(expected) = expected else {
            return Ok(Bytes::new());
        };
        match self.store.get(expected.as_ref())? {
            Some(blob) => Ok(Bytes::from(blob)),
            None => Err(Error::MissingNode {
                owner: *owner,
                path: path.to_vec(),
            }),
        }
    }
}
