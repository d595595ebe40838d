// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The disk layer's write-aggregation buffer.
//!
//! The buffer collects the dirty trie nodes and flat state values of
//! committed transitions until the configured memory allowance is
//! exceeded, then flushes everything in one atomic batch. Its content
//! must be consulted before diving into the store, since it basically is
//! not-yet-written data.

use bytes::Bytes;
use log::{debug, error};
use metrics::counter;

use crate::error::{Error, Result};
use crate::node::{Node, NodeSet};
use crate::stateset::StateSet;
use crate::types::{Hash, StateId};
use strata_storage::{schema, Batch, Batcher, CleanCache, Iteratee, Store};

/// The default memory allowance of the node buffer. Raising it
/// arbitrarily lengthens the system pause when the flush finally
/// happens.
pub const DEFAULT_BUFFER_LIMIT: u64 = 128 * 1024 * 1024;

/// Aggregated writes of one or more committed transitions.
#[derive(Default)]
pub struct NodeBuffer {
    /// The number of transitions merged into the buffer.
    layers: u64,
    /// The approximate byte size of buffered nodes.
    size: u64,
    /// The memory allowance in bytes.
    limit: u64,
    /// The dirty node set, keyed by owner and path.
    nodes: NodeSet,
    /// The aggregated flat state values.
    states: StateSet,
}

impl NodeBuffer {
    /// Creates a buffer with the given allowance, seeded with the nodes
    /// and states recovered from a journal.
    #[must_use]
    pub fn new(limit: u64, nodes: NodeSet, states: StateSet, layers: u64) -> Self {
        let size = nodes.size();
        NodeBuffer {
            layers,
            size,
            limit,
            nodes,
            states,
        }
    }

    /// Looks up a buffered trie node.
    #[must_use]
    pub fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.get(owner, path)
    }

    /// Looks up a buffered flat account value.
    #[must_use]
    pub fn account(&self, account_hash: &Hash) -> Option<&Bytes> {
        self.states.account(account_hash)
    }

    /// Looks up a buffered flat storage value.
    #[must_use]
    pub fn storage(&self, account_hash: &Hash, slot_hash: &Hash) -> Option<&Bytes> {
        self.states.storage(account_hash, slot_hash)
    }

    /// The number of transitions aggregated inside.
    #[must_use]
    pub fn layers(&self) -> u64 {
        self.layers
    }

    /// Whether the buffer holds no transition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers == 0
    }

    /// Whether the buffered size exceeds the allowance.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size > self.limit
    }

    /// The approximate buffered byte size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Updates the memory allowance.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Read access to the buffered nodes, for journaling.
    #[must_use]
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Read access to the buffered states, for journaling.
    #[must_use]
    pub fn states(&self) -> &StateSet {
        &self.states
    }

    /// Merges the dirty set of one committed transition into the buffer.
    /// Node blobs are shared, not copied.
    pub fn commit(&mut self, nodes: &NodeSet, states: &StateSet) {
        let mut delta: i64 = 0;
        let mut overwrites: u64 = 0;
        for (owner, subset) in nodes.iter() {
            for (path, node) in subset {
                match self.nodes.get(owner, path) {
                    Some(orig) => {
                        delta += node.size() as i64 - orig.size() as i64;
                        overwrites += 1;
                    }
                    None => delta += (node.size() + path.len()) as i64,
                }
                self.nodes.insert(*owner, path.clone(), node.clone());
            }
        }
        self.states.merge(states);
        self.update_size(delta);
        self.layers += 1;
        counter!("strata.buffer.overwrites").increment(overwrites);
    }

    /// The reverse of [commit]: merges the pre-images of the newest
    /// buffered transition and decrements the layer counter.
    ///
    /// # Panics
    ///
    /// Every reverted node must already exist in the buffer; a miss
    /// means the history record does not correspond to this buffer,
    /// which is a programming error.
    ///
    /// [commit]: NodeBuffer::commit
    pub fn revert(
        &mut self,
        nodes: &NodeSet,
        accounts: &std::collections::HashMap<Hash, Bytes>,
        storages: &std::collections::HashMap<Hash, std::collections::HashMap<Hash, Bytes>>,
    ) -> Result<()> {
        if self.layers == 0 {
            return Err(Error::StateUnrecoverable { id: 0 });
        }
        self.layers -= 1;
        if self.layers == 0 {
            self.reset();
            return Ok(());
        }
        let mut delta: i64 = 0;
        for (owner, subset) in nodes.iter() {
            for (path, node) in subset {
                let Some(current) = self.nodes.get(owner, path) else {
                    panic!("reverting non-existent node ({owner:.8} {})", hex::encode(path));
                };
                delta += node.size() as i64 - current.size() as i64;
                let replacement = if node.is_deleted() {
                    Node::deleted()
                } else {
                    node.clone()
                };
                self.nodes.insert(*owner, path.clone(), replacement);
            }
        }
        for (account, blob) in accounts {
            self.states.accounts.insert(*account, blob.clone());
        }
        for (account, slots) in storages {
            let current = self.states.storages.entry(*account).or_default();
            for (slot, value) in slots {
                current.insert(*slot, value.clone());
            }
        }
        self.update_size(delta);
        Ok(())
    }

    /// Persists the buffered writes in one atomic batch and resets the
    /// buffer. `progress` carries the generator marker to checkpoint
    /// inside the same batch; flat rows beyond the marker are withheld.
    pub fn flush(
        &mut self,
        store: &dyn Store,
        cleans: Option<&CleanCache>,
        id: StateId,
        root: &Hash,
        progress: Option<&[u8]>,
    ) -> Result<()> {
        let disk = schema::read_persistent_state_id(store)?;
        if disk + self.layers != id {
            return Err(Error::StateIdMismatch {
                disk,
                layers: self.layers,
                target: id,
            });
        }
        let mut batch = store.new_batch_with_size(self.size as usize);

        for (owner, subset) in self.nodes.iter() {
            for (path, node) in subset {
                if node.is_deleted() {
                    if owner.is_zero() {
                        schema::delete_account_trie_node(&*batch, path)?;
                    } else {
                        schema::delete_storage_trie_node(&*batch, owner.as_ref(), path)?;
                    }
                } else if owner.is_zero() {
                    schema::write_account_trie_node(&*batch, path, &node.blob)?;
                } else {
                    schema::write_storage_trie_node(&*batch, owner.as_ref(), path, &node.blob)?;
                }
            }
        }
        self.write_states(store, &mut *batch, progress)?;

        schema::write_persistent_state_id(&*batch, id)?;
        schema::write_snapshot_root(&*batch, root.as_ref())?;
        if let Some(marker) = progress {
            schema::write_snapshot_progress(&*batch, marker)?;
        }
        let written = batch.value_size();
        batch.write()?;
        store.sync()?;

        if let Some(cleans) = cleans {
            for (owner, subset) in self.nodes.iter() {
                for (path, node) in subset {
                    let key = if owner.is_zero() {
                        schema::account_trie_node_key(path)
                    } else {
                        schema::storage_trie_node_key(owner.as_ref(), path)
                    };
                    if node.is_deleted() {
                        cleans.remove(&key);
                    } else {
                        cleans.set(key, node.blob.clone());
                    }
                }
            }
        }
        counter!("strata.buffer.flushed_bytes").increment(written as u64);
        counter!("strata.buffer.flushed_nodes").increment(self.nodes.len() as u64);
        debug!(
            "Persisted buffered nodes, nodes: {}, bytes: {}, id: {}",
            self.nodes.len(),
            written,
            id
        );
        self.reset();
        Ok(())
    }

    /// Writes the flat state rows into the batch, respecting the
    /// generator coverage marker.
    fn write_states(
        &self,
        store: &dyn Store,
        batch: &mut dyn strata_storage::Batch,
        progress: Option<&[u8]>,
    ) -> Result<()> {
        let covered = |key: &[u8]| match progress {
            None => true,
            Some(marker) => key <= marker,
        };
        // storage left over from bulk contract destructions is wiped
        // wholesale, the per-slot set is incomplete by definition
        for account in &self.states.incomplete {
            let prefix = schema::storage_snapshots_prefix(account.as_ref());
            let mut iter = store.iter(&prefix, &[]);
            while iter.next() {
                batch.delete(iter.key())?;
            }
            iter.release();
        }
        for (account, blob) in &self.states.accounts {
            if !covered(account.as_ref()) {
                continue;
            }
            if blob.is_empty() {
                schema::delete_account_snapshot(&*batch, account.as_ref())?;
            } else {
                schema::write_account_snapshot(&*batch, account.as_ref(), blob)?;
            }
        }
        for (account, slots) in &self.states.storages {
            for (slot, value) in slots {
                let mut key = Vec::with_capacity(64);
                key.extend_from_slice(account.as_ref());
                key.extend_from_slice(slot.as_ref());
                if !covered(&key) {
                    continue;
                }
                if value.is_empty() {
                    schema::delete_storage_snapshot(&*batch, account.as_ref(), slot.as_ref())?;
                } else {
                    schema::write_storage_snapshot(
                        &*batch,
                        account.as_ref(),
                        slot.as_ref(),
                        value,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn update_size(&mut self, delta: i64) {
        let size = self.size as i64 + delta;
        if size >= 0 {
            self.size = size as u64;
        } else {
            error!("Invalid buffer size, prev: {}, delta: {}", self.size, delta);
            self.size = 0;
        }
    }

    /// Drops all buffered content.
    pub fn reset(&mut self) {
        self.layers = 0;
        self.size = 0;
        self.nodes = NodeSet::new();
        self.states.reset();
    }
}

impl std::fmt::Debug for NodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuffer")
            .field("layers", &self.layers)
            .field("size", &self.size)
            .field("limit", &self.limit)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::MemDb;

    fn hash(n: u8) -> Hash {
        Hash::from([n; 32])
    }

    fn node_set(entries: &[(Hash, &[u8], &[u8])]) -> NodeSet {
        let mut set = NodeSet::new();
        for (owner, path, blob) in entries {
            let node = if blob.is_empty() {
                Node::deleted()
            } else {
                Node::from_blob(Bytes::copy_from_slice(blob))
            };
            set.insert(*owner, path.to_vec(), node);
        }
        set
    }

    #[test]
    fn test_commit_tracks_size_and_layers() {
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);
        assert!(buffer.is_empty());

        buffer.commit(
            &node_set(&[(Hash::ZERO, b"ab", b"val1"), (hash(1), b"cd", b"value2")]),
            &StateSet::new(),
        );
        assert_eq!(buffer.layers(), 1);
        assert_eq!(buffer.size(), 2 + 4 + 2 + 6);

        // overwriting accounts only the size difference
        buffer.commit(
            &node_set(&[(Hash::ZERO, b"ab", b"v")]),
            &StateSet::new(),
        );
        assert_eq!(buffer.layers(), 2);
        assert_eq!(buffer.size(), 2 + 1 + 2 + 6);
        assert!(!buffer.is_full());

        buffer.set_limit(4);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_revert_restores_preimages() {
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);
        buffer.commit(&node_set(&[(Hash::ZERO, b"ab", b"old")]), &StateSet::new());
        buffer.commit(&node_set(&[(Hash::ZERO, b"ab", b"newer")]), &StateSet::new());

        buffer
            .revert(
                &node_set(&[(Hash::ZERO, b"ab", b"old")]),
                &Default::default(),
                &Default::default(),
            )
            .unwrap();
        assert_eq!(buffer.layers(), 1);
        assert_eq!(buffer.node(&Hash::ZERO, b"ab").unwrap().blob.as_ref(), b"old");
    }

    #[test]
    fn test_revert_to_zero_resets() {
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);
        buffer.commit(&node_set(&[(Hash::ZERO, b"ab", b"x")]), &StateSet::new());
        buffer
            .revert(
                &node_set(&[(Hash::ZERO, b"ab", b"")]),
                &Default::default(),
                &Default::default(),
            )
            .unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.node(&Hash::ZERO, b"ab").is_none());
    }

    #[test]
    fn test_revert_empty_buffer_fails() {
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);
        assert!(matches!(
            buffer.revert(&NodeSet::new(), &Default::default(), &Default::default()),
            Err(Error::StateUnrecoverable { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "reverting non-existent node")]
    fn test_revert_unknown_node_panics() {
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);
        buffer.commit(&node_set(&[(Hash::ZERO, b"ab", b"x")]), &StateSet::new());
        buffer.commit(&node_set(&[(Hash::ZERO, b"ab", b"y")]), &StateSet::new());
        let _ = buffer.revert(
            &node_set(&[(Hash::ZERO, b"zz", b"q")]),
            &Default::default(),
            &Default::default(),
        );
    }

    #[test]
    fn test_flush_writes_everything_atomically() {
        let db = MemDb::new();
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);

        let mut states = StateSet::new();
        states.accounts.insert(hash(5), Bytes::from_static(b"acct"));
        states
            .storages
            .entry(hash(5))
            .or_default()
            .insert(hash(6), Bytes::from_static(b"slot"));
        buffer.commit(
            &node_set(&[(Hash::ZERO, b"ab", b"node"), (hash(1), b"cd", b"")]),
            &states,
        );

        let root = hash(9);
        buffer.flush(&db, None, 1, &root, None).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(
            schema::read_account_trie_node(&db, b"ab").unwrap(),
            Some(b"node".to_vec())
        );
        assert_eq!(
            schema::read_account_snapshot(&db, hash(5).as_ref()).unwrap(),
            Some(b"acct".to_vec())
        );
        assert_eq!(
            schema::read_storage_snapshot(&db, hash(5).as_ref(), hash(6).as_ref()).unwrap(),
            Some(b"slot".to_vec())
        );
        assert_eq!(schema::read_persistent_state_id(&db).unwrap(), 1);
        assert_eq!(
            schema::read_snapshot_root(&db).unwrap(),
            Some(root.as_ref().to_vec())
        );
    }

    #[test]
    fn test_flush_rejects_misaligned_id() {
        let db = MemDb::new();
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);
        buffer.commit(&node_set(&[(Hash::ZERO, b"ab", b"x")]), &StateSet::new());

        // persistent id is 0 and one layer is buffered, so only id 1 works
        assert!(matches!(
            buffer.flush(&db, None, 5, &hash(1), None),
            Err(Error::StateIdMismatch { .. })
        ));
    }

    #[test]
    fn test_flush_withholds_uncovered_states() {
        let db = MemDb::new();
        let mut buffer = NodeBuffer::new(1024, NodeSet::new(), StateSet::new(), 0);

        let mut states = StateSet::new();
        states.accounts.insert(hash(1), Bytes::from_static(b"lo"));
        states.accounts.insert(hash(9), Bytes::from_static(b"hi"));
        buffer.commit(&NodeSet::new(), &states);

        // marker sits between the two accounts
        let marker = [5u8; 32];
        buffer.flush(&db, None, 1, &hash(2), Some(&marker)).unwrap();

        assert_eq!(
            schema::read_account_snapshot(&db, hash(1).as_ref()).unwrap(),
            Some(b"lo".to_vec())
        );
        assert_eq!(
            schema::read_account_snapshot(&db, hash(9).as_ref()).unwrap(),
            None
        );
        assert_eq!(
            schema::read_snapshot_progress(&db).unwrap(),
            Some(marker.to_vec())
        );
    }
}
