// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The persistent bottom layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use metrics::counter;
use parking_lot::RwLock;

use crate::buffer::NodeBuffer;
use crate::db::DbShared;
use crate::difflayer::DiffLayer;
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::history::{self, History};
use crate::node::NodeSet;
use crate::types::{Hash, StateId};
use strata_storage::{schema, Batch, Batcher, CleanCache, KeyValueReader, Store};

/// The low-level persistent layer backed by the key-value store, with a
/// buffer of not-yet-flushed writes in front of it.
pub(crate) struct DiskLayer {
    root: Hash,
    id: StateId,
    shared: Arc<DbShared>,

    /// Shared with the successor layer on commit; only mutated while
    /// this layer holds its exclusive lock and is not yet stale.
    buffer: Arc<RwLock<NodeBuffer>>,

    /// Set once when the layer is flattened across; the lock also
    /// guards reads against an in-flight commit.
    stale: RwLock<bool>,

    /// Present while the flat snapshot is still being generated.
    generator: RwLock<Option<Arc<Generator>>>,
}

impl DiskLayer {
    /// Creates a disk layer over the shared store handles.
    pub fn new(
        root: Hash,
        id: StateId,
        shared: Arc<DbShared>,
        buffer: Arc<RwLock<NodeBuffer>>,
    ) -> Arc<Self> {
        Arc::new(DiskLayer {
            root,
            id,
            shared,
            buffer,
            stale: RwLock::new(false),
            generator: RwLock::new(None),
        })
    }

    /// Root hash of the corresponding state.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// State id of the disk layer.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// The write-aggregation buffer, shared with successor layers.
    pub fn buffer(&self) -> &Arc<RwLock<NodeBuffer>> {
        &self.buffer
    }

    /// Links a generator, marking the flat snapshot as incomplete.
    pub fn set_generator(&self, generator: Arc<Generator>) {
        *self.generator.write() = Some(generator);
    }

    /// The linked generator, if the snapshot is still being generated.
    pub fn generator(&self) -> Option<Arc<Generator>> {
        self.generator.read().clone()
    }

    /// Whether this layer has been flattened across.
    pub fn is_stale(&self) -> bool {
        *self.stale.read()
    }

    /// Tags the layer stale.
    ///
    /// # Panics
    ///
    /// Panics when the layer is already stale: two children were
    /// flattened into the same base, which is a programming error.
    fn mark_stale(&self) {
        let mut stale = self.stale.write();
        if *stale {
            panic!("triedb disk layer is stale");
        }
        *stale = true;
    }

    /// Resolves a trie node: buffer first, then the clean cache, then
    /// the store. A missing node yields an empty blob unless a hash is
    /// demanded.
    pub fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        let stale = self.stale.read();
        if *stale {
            return Err(Error::Stale);
        }
        // the buffer needs no extra locking: it is frozen from the
        // moment the layer can be observed until it is tagged stale
        if let Some(node) = self.buffer.read().node(owner, path) {
            counter!("strata.dirty.hit").increment(1);
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
        counter!("strata.dirty.miss").increment(1);

        let key = if owner.is_zero() {
            schema::account_trie_node_key(path)
        } else {
            schema::storage_trie_node_key(owner.as_ref(), path)
        };
        if let Some(cleans) = &self.shared.cleans {
            if let Some(blob) = cleans.get(&key) {
                if let Some(expected) = expected {
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
                return Ok(blob);
            }
        }
        let blob = Bytes::from(self.shared.store.get(&key)?.unwrap_or_default());
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
        if !blob.is_empty() {
            if let Some(cleans) = &self.shared.cleans {
                cleans.set(key, blob.clone());
            }
        }
        Ok(blob)
    }

    /// Resolves a flat account blob: buffer first, then the snapshot
    /// table, deferring to the trie while generation has not covered the
    /// key yet.
    pub fn account(&self, account_hash: &Hash) -> Result<Option<Bytes>> {
        let stale = self.stale.read();
        if *stale {
            return Err(Error::Stale);
        }
        if let Some(blob) = self.buffer.read().account(account_hash) {
            return Ok(Some(blob.clone()));
        }
        if let Some(generator) = self.generator.read().as_ref() {
            if let Some(marker) = generator.progress() {
                if account_hash.as_ref() > marker.as_slice() {
                    return Err(Error::NotCoveredYet);
                }
            }
        }
        Ok(schema::read_account_snapshot(self.shared.store.as_ref(), account_hash.as_ref())?
            .map(Bytes::from))
    }

    /// Resolves a flat storage value, analogous to [account].
    ///
    /// [account]: DiskLayer::account
    pub fn storage(&self, account_hash: &Hash, slot_hash: &Hash) -> Result<Option<Bytes>> {
        let stale = self.stale.read();
        if *stale {
            return Err(Error::Stale);
        }
        if let Some(blob) = self.buffer.read().storage(account_hash, slot_hash) {
            return Ok(Some(blob.clone()));
        }
        if let Some(generator) = self.generator.read().as_ref() {
            if let Some(marker) = generator.progress() {
                let mut key = Vec::with_capacity(64);
                key.extend_from_slice(account_hash.as_ref());
                key.extend_from_slice(slot_hash.as_ref());
                if key.as_slice() > marker.as_slice() {
                    return Err(Error::NotCoveredYet);
                }
            }
        }
        Ok(schema::read_storage_snapshot(
            self.shared.store.as_ref(),
            account_hash.as_ref(),
            slot_hash.as_ref(),
        )?
        .map(Bytes::from))
    }

    /// Merges the bottom-most diff layer into the buffer and returns the
    /// successor disk layer. The current layer is tagged stale.
    pub fn commit(&self, bottom: &DiffLayer, force: bool) -> Result<Arc<DiskLayer>> {
        let store = self.shared.store.as_ref();

        // construct and store the state history first: if a crash lands
        // between the history write and the journal, the surplus record
        // is truncated from the head on the next startup
        let mut overflow = false;
        let mut oldest: StateId = 0;
        if let Some(freezer) = &self.shared.freezer {
            let states = bottom.states();
            let record = History::new(
                bottom.root(),
                self.root,
                bottom.block(),
                states
                    .account_origin
                    .iter()
                    .map(|(hash, blob)| (*hash, blob.to_vec()))
                    .collect(),
                states
                    .storage_origin
                    .iter()
                    .map(|(hash, slots)| {
                        let slots: BTreeMap<Hash, Vec<u8>> = slots
                            .iter()
                            .map(|(slot, value)| (*slot, value.to_vec()))
                            .collect();
                        (*hash, slots)
                    })
                    .collect(),
                states.state.incomplete.iter().copied().collect(),
            );
            history::write_history(freezer, bottom.id(), &record)?;

            let limit = self.shared.config.state_history;
            if limit != 0 && bottom.id() - freezer.tail() > limit {
                overflow = true;
                // id of the oldest history retained after truncation
                oldest = bottom.id() - limit + 1;
            }
        }
        self.mark_stale();

        // the root->id lookups locate histories by state root; the
        // genesis layer needs one the first time something lands on it
        if self.id == 0 {
            schema::write_state_id(store, self.root.as_ref(), 0)?;
        }
        schema::write_state_id(store, bottom.root().as_ref(), bottom.id())?;

        // if the oldest surviving history would outrun the persisted
        // state, force a flush to keep the persisted id ahead of it
        let mut force = force;
        if !force && schema::read_persistent_state_id(store)? < oldest {
            force = true;
        }
        let generator = self.generator.read().clone();
        let mut complete = generator.is_none();
        {
            let mut buffer = self.buffer.write();
            buffer.commit(bottom.nodes(), &bottom.states().state);
            if buffer.is_full() || force {
                // generation must not run while the persistent state
                // moves underneath it
                let progress = match &generator {
                    Some(generator) => {
                        generator.stop();
                        generator.progress()
                    }
                    None => None,
                };
                complete = progress.is_none();
                buffer.flush(
                    store,
                    self.shared.cleans.as_deref(),
                    bottom.id(),
                    &bottom.root(),
                    progress.as_deref(),
                )?;
                if let Some(generator) = &generator {
                    if !complete {
                        generator.run(bottom.root());
                        info!("Resumed state snapshot generation, root: {:.8}", bottom.root());
                    }
                }
            }
        }
        let ndl = DiskLayer::new(
            bottom.root(),
            bottom.id(),
            self.shared.clone(),
            self.buffer.clone(),
        );
        if !complete {
            if let Some(generator) = generator {
                ndl.set_generator(generator);
            }
        }
        if overflow {
            if let Some(freezer) = &self.shared.freezer {
                let pruned = history::truncate_tail(store, freezer, oldest - 1)?;
                debug!("Pruned state history, items: {pruned}, tail id: {oldest}");
            }
        }
        Ok(ndl)
    }

    /// Applies a state history in reverse, returning the predecessor
    /// disk layer.
    pub fn revert(&self, record: &History) -> Result<Arc<DiskLayer>> {
        if record.meta.root != self.root {
            return Err(Error::UnexpectedHistory);
        }
        if self.id == 0 {
            return Err(Error::StateUnrecoverable { id: 0 });
        }
        // apply the reverse changes against this layer's own read path
        // before anything is locked or tagged
        let nodes = history::apply(self.shared.loader.as_ref(), self, record)?;

        let accounts: std::collections::HashMap<Hash, Bytes> = record
            .accounts
            .iter()
            .map(|(hash, blob)| (*hash, Bytes::from(blob.clone())))
            .collect();
        let storages: std::collections::HashMap<Hash, std::collections::HashMap<Hash, Bytes>> =
            record
                .storages
                .iter()
                .map(|(hash, slots)| {
                    let slots = slots
                        .iter()
                        .map(|(slot, value)| (*slot, Bytes::from(value.clone())))
                        .collect();
                    (*hash, slots)
                })
                .collect();

        self.mark_stale();

        let mut buffer = self.buffer.write();
        if !buffer.is_empty() {
            // the transition being reverted is still buffered, unwind it
            // in memory
            buffer.revert(&nodes, &accounts, &storages)?;
            drop(buffer);
            let ndl = DiskLayer::new(
                record.meta.parent,
                self.id - 1,
                self.shared.clone(),
                self.buffer.clone(),
            );
            if let Some(generator) = self.generator.read().clone() {
                ndl.set_generator(generator);
            }
            return Ok(ndl);
        }
        drop(buffer);

        // the transition is already persistent, rewrite the store
        let store = self.shared.store.as_ref();
        let generator = self.generator.read().clone();
        let progress = match &generator {
            Some(generator) => {
                generator.stop();
                generator.progress()
            }
            None => None,
        };
        let mut batch = store.new_batch();
        write_nodes(&mut *batch, &nodes, self.shared.cleans.as_deref())?;
        let covered = |key: &[u8]| match progress.as_deref() {
            None => true,
            Some(marker) => key <= marker,
        };
        for (account, blob) in &accounts {
            if !covered(account.as_ref()) {
                continue;
            }
            if blob.is_empty() {
                schema::delete_account_snapshot(&*batch, account.as_ref())?;
            } else {
                schema::write_account_snapshot(&*batch, account.as_ref(), blob)?;
            }
        }
        for (account, slots) in &storages {
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
                    schema::write_storage_snapshot(&*batch, account.as_ref(), slot.as_ref(), value)?;
                }
            }
        }
        schema::write_persistent_state_id(&*batch, self.id - 1)?;
        schema::write_snapshot_root(&*batch, record.meta.parent.as_ref())?;
        if let Some(marker) = progress.as_deref() {
            schema::write_snapshot_progress(&*batch, marker)?;
        }
        batch.write()?;
        store.sync()?;

        let ndl = DiskLayer::new(
            record.meta.parent,
            self.id - 1,
            self.shared.clone(),
            self.buffer.clone(),
        );
        if progress.is_some() {
            if let Some(generator) = generator {
                ndl.set_generator(generator.clone());
                generator.run(record.meta.parent);
            }
        }
        Ok(ndl)
    }

    /// Approximate size of the buffered writes.
    pub fn size(&self) -> u64 {
        if self.is_stale() {
            return 0;
        }
        self.buffer.read().size()
    }
}

impl crate::trie::NodeSource for DiskLayer {
    fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        DiskLayer::node(self, owner, path, expected)
    }
}

impl std::fmt::Debug for DiskLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLayer")
            .field("root", &format_args!("{:.8}", self.root))
            .field("id", &self.id)
            .field("stale", &self.is_stale())
            .finish()
    }
}

/// Writes a reverted node set into the batch and keeps the clean cache
/// coherent with it.
fn write_nodes(
    batch: &mut dyn Batch,
    nodes: &NodeSet,
    cleans: Option<&CleanCache>,
) -> Result<()> {
    for (owner, subset) in nodes.iter() {
        for (path, node) in subset {
            let key = if owner.is_zero() {
                schema::account_trie_node_key(path)
            } else {
                schema::storage_trie_node_key(owner.as_ref(), path)
            };
            if node.is_deleted() {
                batch.delete(&key)?;
                if let Some(cleans) = cleans {
                    cleans.remove(&key);
                }
            } else {
                batch.put(&key, &node.blob)?;
                if let Some(cleans) = cleans {
                    cleans.set(key, node.blob.clone());
                }
            }
        }
    }
    Ok(())
}
