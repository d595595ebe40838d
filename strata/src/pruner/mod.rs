// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The offline state pruner.
//!
//! Pruning reconstructs the set of hashes reachable from a target state
//! (via the flat snapshot and the stack trie) plus the genesis state,
//! records them in a [StateBloom], then sweeps the whole store deleting
//! every hash-addressed entry the filter does not recognize. The
//! committed bloom file is the crash marker: as long as it exists, a
//! restart resumes the sweep instead of starting over.

mod bloom;

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

pub use bloom::{bloom_file_path, find_bloom_file, StateBloom};

use crate::account::Account;
use crate::error::{Error, Result};
use crate::trie::{HashNodeSource, NodeIterator, StackTrie, Trie, TrieLoader};
use crate::types::Hash;
use strata_storage::{
    schema, Batch, Batcher, Compacter, DatabaseError, Iteratee, KeyValueReader, Store,
    IDEAL_BATCH_SIZE,
};

/// Deletions below this count skip the post-sweep range compaction.
const RANGE_COMPACTION_THRESHOLD: u64 = 100_000;

/// The offline pruning tool.
pub struct Pruner {
    store: Arc<dyn Store>,
    loader: Arc<dyn TrieLoader>,
    datadir: PathBuf,
    bloom_size: u64,
}

impl Pruner {
    /// Creates a pruner working against the store under `datadir`.
    /// `bloom_size` is the filter allowance in megabytes.
    pub fn new(
        store: Arc<dyn Store>,
        loader: Arc<dyn TrieLoader>,
        datadir: PathBuf,
        bloom_size: u64,
    ) -> Self {
        Pruner {
            store,
            loader,
            datadir,
            bloom_size,
        }
    }

    /// Prunes every state not reachable from `target_root` (default: the
    /// persisted snapshot root) or from the genesis state.
    ///
    /// A bloom file left behind by an earlier interrupted run forces
    /// recovery of that run first; a fresh target is only accepted once
    /// no marker exists.
    pub fn prune(&self, target_root: Option<Hash>) -> Result<()> {
        if let Some((path, root)) = find_bloom_file(&self.datadir).map_err(io_err)? {
            warn!("Resuming interrupted pruning, target: {root:.8}");
            let filter = StateBloom::load(&path).map_err(io_err)?;
            return self.sweep_and_finish(&filter, &path);
        }
        let root = self.resolve_target(target_root)?;
        // the presence of the root node is the weak indicator that the
        // whole target state is present
        if !self.store.has(root.as_ref())? {
            return Err(Error::MissingTrie { root });
        }
        info!("Building live state filter, target: {root:.8}");
        let mut filter = StateBloom::new(self.bloom_size);
        self.extract_genesis(&mut filter)?;
        let (accounts, slots) = walk_snapshot(
            self.store.as_ref(),
            self.loader.as_ref(),
            root,
            &mut filter,
        )?;
        info!("Live state filter built, accounts: {accounts}, slots: {slots}");

        let path = bloom_file_path(&self.datadir, &root);
        filter.commit(&path).map_err(io_err)?;
        self.sweep_and_finish(&filter, &path)
    }

    fn resolve_target(&self, target_root: Option<Hash>) -> Result<Hash> {
        if let Some(root) = target_root {
            return Ok(root);
        }
        let blob = schema::read_snapshot_root(self.store.as_ref())?.ok_or_else(|| {
            Error::InvalidProof("no target root and no persisted snapshot".to_string())
        })?;
        Hash::try_from(blob.as_slice())
            .map_err(|_| Error::InvalidProof("malformed snapshot root".to_string()))
    }

    /// Walks the genesis state into the filter so history's anchor is
    /// never swept.
    fn extract_genesis(&self, filter: &mut StateBloom) -> Result<()> {
        let store = self.store.as_ref();
        let Some(blob) = schema::read_genesis_root(store)? else {
            warn!("Genesis root not recorded, skipping genesis retention");
            return Ok(());
        };
        let root = Hash::try_from(blob.as_slice())
            .map_err(|_| Error::InvalidProof("malformed genesis root".to_string()))?;
        let source = HashNodeSource::new(store);
        let trie = self.loader.open(&root, &source)?;
        let mut iter = trie.node_iterator(&[])?;
        while iter.next()? {
            if !iter.hash().is_zero() {
                filter.put(iter.hash().as_ref());
            }
            let Some((key, value)) = iter.leaf() else {
                continue;
            };
            let owner = Hash::try_from(key)
                .map_err(|_| Error::InvalidProof("genesis account key is not a hash".to_string()))?;
            let account = Account::decode_full(value)?;
            if account.has_code() {
                if !schema::has_code(store, account.code_hash.as_ref())? {
                    return Err(Error::MissingCode {
                        hash: account.code_hash,
                    });
                }
                filter.put(account.code_hash.as_ref());
            }
            if account.has_storage() {
                let storage = self.loader.open_storage(&owner, &account.root, &source)?;
                let mut storage_iter = storage.node_iterator(&[])?;
                while storage_iter.next()? {
                    if !storage_iter.hash().is_zero() {
                        filter.put(storage_iter.hash().as_ref());
                    }
                }
            }
        }
        Ok(())
    }

    fn sweep_and_finish(&self, filter: &StateBloom, marker: &Path) -> Result<()> {
        sweep(self.store.as_ref(), filter)?;
        self.store.sync()?;
        // only now is it safe to drop the in-progress marker
        fs::remove_file(marker).map_err(io_err)?;
        info!("State pruned successfully");
        Ok(())
    }
}

impl std::fmt::Debug for Pruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pruner")
            .field("datadir", &self.datadir)
            .field("bloom_size", &self.bloom_size)
            .finish()
    }
}

/// Reconstructs the target state from the flat snapshot through the
/// stack trie, feeding every live node hash into the filter. Returns the
/// visited `(accounts, slots)` counts.
///
/// Fails when the reconstructed roots disagree with the snapshot's
/// account bodies or referenced code is missing, so a stale snapshot can
/// never authorize a sweep.
pub fn walk_snapshot(
    store: &dyn Store,
    loader: &dyn TrieLoader,
    root: Hash,
    filter: &mut StateBloom,
) -> Result<(u64, u64)> {
    let cell = RefCell::new(filter);
    let mut accounts: u64 = 0;
    let mut slots: u64 = 0;

    let mut account_stack =
        loader.stack_trie(Box::new(|hash, _blob| cell.borrow_mut().put(hash.as_ref())));
    let mut iter = store.iter(&[schema::SNAPSHOT_ACCOUNT_PREFIX], &[]);
    while iter.next() {
        let key = iter.key()[1..].to_vec();
        let account = Account::decode_slim(iter.value())?;
        account_stack.update(&key, &account.encode_full())?;
        accounts += 1;

        if account.has_code() {
            if !schema::has_code(store, account.code_hash.as_ref())? {
                return Err(Error::MissingCode {
                    hash: account.code_hash,
                });
            }
            cell.borrow_mut().put(account.code_hash.as_ref());
        }
        if account.has_storage() {
            let mut storage_stack =
                loader.stack_trie(Box::new(|hash, _blob| cell.borrow_mut().put(hash.as_ref())));
            let prefix = schema::storage_snapshots_prefix(&key);
            let mut storage_iter = store.iter(&prefix, &[]);
            while storage_iter.next() {
                storage_stack.update(&storage_iter.key()[33..], storage_iter.value())?;
                slots += 1;
            }
            storage_iter.release();
            let storage_root = storage_stack.finish();
            if storage_root != account.root {
                return Err(Error::InvalidProof(format!(
                    "storage root mismatch for {}: want {:.8}, got {storage_root:.8}",
                    hex::encode(&key),
                    account.root
                )));
            }
        }
    }
    iter.release();

    let computed = account_stack.finish();
    drop(account_stack);
    if computed != root {
        return Err(Error::InvalidProof(format!(
            "snapshot root mismatch: want {root:.8}, got {computed:.8}"
        )));
    }
    Ok((accounts, slots))
}

/// Verifies that the flat snapshot reconstructs exactly the state
/// committed to by `root`.
pub fn verify_state(store: &dyn Store, loader: &dyn TrieLoader, root: Hash) -> Result<(u64, u64)> {
    let mut throwaway = StateBloom::with_bytes(1024);
    walk_snapshot(store, loader, root, &mut throwaway)
}

/// Deletes every hash-addressed entry (raw 32-byte node keys and code
/// keys) the filter does not recognize, then compacts the swept range.
fn sweep(store: &dyn Store, filter: &StateBloom) -> Result<()> {
    let mut batch = store.new_batch();
    let mut count: u64 = 0;
    let mut range: Option<(Vec<u8>, Vec<u8>)> = None;

    let mut iter = store.iter(&[], &[]);
    while iter.next() {
        let key = iter.key();
        let checked = if key.len() == 32 {
            key
        } else if let Some(code_hash) = schema::as_code_key(key) {
            code_hash
        } else {
            continue;
        };
        if filter.contains(checked) {
            continue;
        }
        batch.delete(key)?;
        count += 1;
        range = Some(match range.take() {
            None => (key.to_vec(), key.to_vec()),
            Some((min, max)) => (
                if key < min.as_slice() { key.to_vec() } else { min },
                if key > max.as_slice() { key.to_vec() } else { max },
            ),
        });
        if batch.value_size() >= IDEAL_BATCH_SIZE {
            batch.write()?;
            batch.reset();
        }
    }
    iter.release();
    if batch.value_size() > 0 {
        batch.write()?;
    }
    info!("Pruned state data, count: {count}");

    // compaction only pays for itself past a real amount of deletions
    if count >= RANGE_COMPACTION_THRESHOLD {
        if let Some((min, max)) = range {
            store.compact(&min, &max)?;
        }
    }
    Ok(())
}

fn io_err(err: std::io::Error) -> Error {
    Error::Database(DatabaseError::from(err))
}
