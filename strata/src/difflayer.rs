// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! In-memory diff layers.
//!
//! A diff layer is the journal of one block's state transition: the
//! dirty trie nodes it produced and the flat state values it wrote,
//! together with their pre-images. Diff layers are immutable except for
//! the parent pointer, which `persist` re-homes onto the freshly built
//! disk layer under the layer's exclusive lock.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::RwLock;

use crate::disklayer::DiskLayer;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::node::NodeSet;
use crate::stateset::StateSetWithOrigin;
use crate::types::{Hash, StateId};

/// A collection of modifications made on top of a parent layer by
/// running one block.
pub(crate) struct DiffLayer {
    root: Hash,
    id: StateId,
    block: u64,
    memory: u64,

    nodes: NodeSet,
    states: StateSetWithOrigin,

    /// The parent layer. Never `None`, but mutated when the chain below
    /// is flattened; the lock doubles as this layer's read-write lock.
    parent: RwLock<Layer>,
}

impl DiffLayer {
    /// Creates a new diff layer on top of `parent` with the transition's
    /// dirty nodes and state changes.
    pub fn new(
        parent: Layer,
        root: Hash,
        id: StateId,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Arc<Self> {
        let memory = nodes.size() + states.size();
        debug!("Created new diff layer, id: {id}, block: {block}");
        Arc::new(DiffLayer {
            root,
            id,
            block,
            memory,
            nodes,
            states,
            parent: RwLock::new(parent),
        })
    }

    /// The state root this layer diff belongs to.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// The state id of the layer.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// The block number that produced the transition.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Approximate memory held by the layer.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    /// The dirty trie nodes of the transition.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// The flat state changes of the transition.
    pub fn states(&self) -> &StateSetWithOrigin {
        &self.states
    }

    /// The current parent layer.
    pub fn parent(&self) -> Layer {
        self.parent.read().clone()
    }

    /// Re-homes the layer onto a new parent. Only the flattening path
    /// uses this, under the layer tree's write discipline.
    pub fn set_parent(&self, parent: Layer) {
        *self.parent.write() = parent;
    }

    /// Resolves a trie node, trying this layer first and falling through
    /// to the parent chain.
    pub fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        // hold the shared lock so the parent cannot change mid-read
        let parent = self.parent.read();
        if let Some(node) = self.nodes.get(owner, path) {
            if let Some(expected) = expected {
                if node.hash != *expected {
                    return Err(Error::UnexpectedNode {
                        expected: *expected,
                        got: node.hash,
                        owner: *owner,
                        path: path.to_vec(),
                    });
                }
            }
            return Ok(node.blob.clone());
        }
        parent.node(owner, path, expected)
    }

    /// Resolves a flat account value, falling through to the parent.
    pub fn account(&self, account_hash: &Hash) -> Result<Option<Bytes>> {
        let parent = self.parent.read();
        if let Some(blob) = self.states.state.account(account_hash) {
            return Ok(Some(blob.clone()));
        }
        parent.account(account_hash)
    }

    /// Resolves a flat storage value, falling through to the parent.
    pub fn storage(&self, account_hash: &Hash, slot_hash: &Hash) -> Result<Option<Bytes>> {
        let parent = self.parent.read();
        if let Some(blob) = self.states.state.storage(account_hash, slot_hash) {
            return Ok(Some(blob.clone()));
        }
        parent.storage(account_hash, slot_hash)
    }

    /// Flattens this layer and every diff below it into the disk layer,
    /// bottom first. Returns the disk layer that absorbed the chain.
    pub fn persist(self: &Arc<Self>, force: bool) -> Result<Arc<DiskLayer>> {
        let maybe_parent_diff = match &*self.parent.read() {
            Layer::Diff(parent) => Some(Arc::clone(parent)),
            Layer::Disk(_) => None,
        };
        if let Some(parent_diff) = maybe_parent_diff {
            // hold the exclusive lock so no reader walks through a
            // half-relinked parent
            let mut parent = self.parent.write();
            let flattened = parent_diff.persist(force)?;
            *parent = Layer::Disk(flattened);
        }
        let parent = self.parent.read().clone();
        match parent {
            Layer::Disk(disk) => disk.commit(self, force),
            Layer::Diff(_) => unreachable!("parent flattened above"),
        }
    }
}

impl std::fmt::Debug for DiffLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffLayer")
            .field("root", &format_args!("{:.8}", self.root))
            .field("id", &self.id)
            .field("block", &self.block)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
