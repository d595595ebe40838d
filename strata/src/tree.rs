// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The layer tree: all live layers, keyed by state root.
//!
//! The tree is a set of diff chains bottoming out in the single disk
//! layer; forks share their lower layers. Flattening replaces the disk
//! layer, after which any chain still rooted in the stale one is pruned.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::disklayer::DiskLayer;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::node::NodeSet;
use crate::stateset::StateSetWithOrigin;
use crate::types::Hash;

pub(crate) struct LayerTree {
    layers: RwLock<HashMap<Hash, Layer>>,
}

impl LayerTree {
    /// Builds a tree holding the given chain head and everything below
    /// it.
    pub fn new(head: Layer) -> Self {
        let tree = LayerTree {
            layers: RwLock::new(HashMap::new()),
        };
        tree.reset(head);
        tree
    }

    /// Replaces the whole tree with one chain.
    pub fn reset(&self, head: Layer) {
        let mut layers = HashMap::new();
        let mut cursor = Some(head);
        while let Some(layer) = cursor {
            cursor = layer.parent();
            layers.insert(layer.root(), layer);
        }
        *self.layers.write() = layers;
    }

    /// Looks up a layer by its state root.
    pub fn get(&self, root: &Hash) -> Option<Layer> {
        self.layers.read().get(root).cloned()
    }

    /// The single non-stale disk layer at the bottom of the tree.
    ///
    /// # Panics
    ///
    /// The tree always bottoms out in a disk layer.
    pub fn bottom(&self) -> Arc<DiskLayer> {
        let layers = self.layers.read();
        let any = layers.values().next().expect("tree is never empty").clone();
        drop(layers);
        let mut cursor = any;
        loop {
            match cursor {
                Layer::Disk(disk) => return disk,
                Layer::Diff(diff) => cursor = diff.parent(),
            }
        }
    }

    /// The number of tracked layers, the disk layer included.
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Approximate memory held by the tracked diff layers.
    pub fn diff_memory(&self) -> u64 {
        self.layers
            .read()
            .values()
            .map(|layer| match layer {
                Layer::Diff(diff) => diff.memory(),
                Layer::Disk(_) => 0,
            })
            .sum()
    }

    /// Stacks a new diff layer onto the parent identified by
    /// `parent_root`.
    pub fn add(
        &self,
        root: Hash,
        parent_root: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Result<()> {
        if root == parent_root {
            return Err(Error::LayerCycle { root });
        }
        let parent = self
            .get(&parent_root)
            .ok_or(Error::LayerNotFound { root: parent_root })?;
        let id = parent.state_id() + 1;
        let diff = parent.update(root, id, block, nodes, states);
        self.layers.write().insert(root, Layer::Diff(diff));
        Ok(())
    }

    /// Flattens diff layers below the chain identified by `root` into
    /// the disk layer until at most `retain` diffs remain on that chain.
    /// `retain == 0` persists the whole chain.
    pub fn cap(&self, root: Hash, retain: usize) -> Result<()> {
        let head = self.get(&root).ok_or(Error::LayerNotFound { root })?;
        let Layer::Diff(head_diff) = head else {
            // the disk layer itself carries nothing to flatten
            return Ok(());
        };
        if retain == 0 {
            let disk = head_diff.persist(true)?;
            self.reset(Layer::Disk(disk));
            return Ok(());
        }
        let mut chain = vec![head_diff];
        loop {
            let last = chain.last().expect("chain is non-empty");
            match last.parent() {
                Layer::Diff(parent) => chain.push(parent),
                Layer::Disk(_) => break,
            }
        }
        if chain.len() <= retain {
            return Ok(());
        }
        // the chain below the survivor collapses into a new disk layer
        let survivor = &chain[retain - 1];
        if let Layer::Diff(parent) = survivor.parent() {
            let disk = parent.persist(false)?;
            survivor.set_parent(Layer::Disk(disk.clone()));
            self.layers
                .write()
                .insert(disk.root(), Layer::Disk(disk));
        }
        self.prune_stale();
        Ok(())
    }

    /// Drops every layer whose chain bottoms out in a stale disk layer.
    fn prune_stale(&self) {
        self.layers.write().retain(|_, layer| {
            let mut cursor = layer.clone();
            loop {
                match cursor {
                    Layer::Disk(disk) => return !disk.is_stale(),
                    Layer::Diff(diff) => cursor = diff.parent(),
                }
            }
        });
    }
}

impl std::fmt::Debug for LayerTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerTree")
            .field("layers", &self.len())
            .finish()
    }
}
