// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The polymorphic layer handle.

use std::sync::Arc;

use bytes::Bytes;

use crate::difflayer::DiffLayer;
use crate::disklayer::DiskLayer;
use crate::error::Result;
use crate::node::NodeSet;
use crate::stateset::StateSetWithOrigin;
use crate::trie::NodeSource;
use crate::types::{Hash, StateId};

/// A state layer: either the single persistent disk layer or one of the
/// in-memory diff layers stacked on top of it.
///
/// Layers are reference-counted; long-running readers and the snapshot
/// generator may keep a layer alive after it left the tree.
#[derive(Clone)]
pub(crate) enum Layer {
    /// The persistent bottom layer.
    Disk(Arc<DiskLayer>),
    /// An in-memory per-block delta.
    Diff(Arc<DiffLayer>),
}

impl Layer {
    /// The state root this layer was made for.
    pub fn root(&self) -> Hash {
        match self {
            Layer::Disk(disk) => disk.root(),
            Layer::Diff(diff) => diff.root(),
        }
    }

    /// The state transition number of this layer.
    pub fn state_id(&self) -> StateId {
        match self {
            Layer::Disk(disk) => disk.id(),
            Layer::Diff(diff) => diff.id(),
        }
    }

    /// The parent layer, or `None` below the disk layer.
    pub fn parent(&self) -> Option<Layer> {
        match self {
            Layer::Disk(_) => None,
            Layer::Diff(diff) => Some(diff.parent()),
        }
    }

    /// Resolves the trie node of `owner` at `path`, walking the diff
    /// chain down to the disk layer. A missing node yields an empty
    /// blob.
    pub fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        match self {
            Layer::Disk(disk) => disk.node(owner, path, expected),
            Layer::Diff(diff) => diff.node(owner, path, expected),
        }
    }

    /// Resolves the flat account blob visible from this layer. `None`
    /// means the account does not exist; an empty blob means it was
    /// deleted by a buffered transition.
    pub fn account(&self, account_hash: &Hash) -> Result<Option<Bytes>> {
        match self {
            Layer::Disk(disk) => disk.account(account_hash),
            Layer::Diff(diff) => diff.account(account_hash),
        }
    }

    /// Resolves the flat storage slot value visible from this layer.
    pub fn storage(&self, account_hash: &Hash, slot_hash: &Hash) -> Result<Option<Bytes>> {
        match self {
            Layer::Disk(disk) => disk.storage(account_hash, slot_hash),
            Layer::Diff(diff) => diff.storage(account_hash, slot_hash),
        }
    }

    /// Stacks a new diff layer carrying one transition on top of this
    /// layer.
    pub fn update(
        &self,
        root: Hash,
        id: StateId,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Arc<DiffLayer> {
        DiffLayer::new(self.clone(), root, id, block, nodes, states)
    }
}

impl NodeSource for Layer {
    fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        Layer::node(self, owner, path, expected)
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Disk(disk) => write!(f, "DiskLayer({:.8}, id {})", disk.root(), disk.id()),
            Layer::Diff(diff) => write!(f, "DiffLayer({:.8}, id {})", diff.root(), diff.id()),
        }
    }
}
