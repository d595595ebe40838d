// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Background flat snapshot generation.
//!
//! The generator walks the flat snapshot tables range by range, proving
//! each segment against the authenticated trie. A proven segment is
//! already correct and is merely visited; a failed proof switches to a
//! trie iteration that repairs the segment entry by entry. Progress is
//! checkpointed as the `gen_marker`, a compound key (account hash,
//! optionally followed by slot-hash bytes) persisted atomically with the
//! repaired data, so generation is restartable across crashes.
//!
//! While a marker is live, flat reads beyond it answer `NotCoveredYet`
//! and callers fall back to the trie.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info};
use metrics::counter;
use parking_lot::Mutex;

use crate::account::Account;
use crate::db::DbShared;
use crate::error::{Error, Result};
use crate::trie::{NodeIterator, StoreNodeSource, Trie, TrieLoader};
use crate::types::{increase_key, Hash, EMPTY_ROOT};
use strata_storage::{schema, Batch, Batcher, DbIterator, Iteratee, IDEAL_BATCH_SIZE};

/// Upper limit on the number of accounts checked per range proof. Too
/// large raises the proof failure rate, too small slows recovery down.
const ACCOUNT_CHECK_RANGE: usize = 128;

/// Upper limit on the number of storage slots checked per range proof.
const STORAGE_CHECK_RANGE: usize = 1024;

type StopRequest = Sender<()>;

/// The background snapshot generation task attached to a disk layer.
///
/// Exactly one generator exists per incomplete snapshot; successors of a
/// disk layer inherit the same instance until generation finishes.
pub(crate) struct Generator {
    shared: Arc<DbShared>,

    /// The last fully generated compound key; `None` once the snapshot
    /// is complete.
    progress: Mutex<Option<Vec<u8>>>,

    ctrl: Mutex<Option<Sender<StopRequest>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Generator {
    /// Creates a generator resuming from the persisted marker.
    pub fn new(shared: Arc<DbShared>, marker: Vec<u8>) -> Arc<Self> {
        Arc::new(Generator {
            shared,
            progress: Mutex::new(Some(marker)),
            ctrl: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// The current progress marker; `None` once generation completed.
    pub fn progress(&self) -> Option<Vec<u8>> {
        self.progress.lock().clone()
    }

    /// Launches the generation task against the given state root.
    pub fn run(self: &Arc<Self>, root: Hash) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel();
        *self.ctrl.lock() = Some(ctrl_tx);
        let generator = Arc::clone(self);
        let handle = thread::spawn(move || generator.generate(root, &ctrl_rx));
        *self.handle.lock() = Some(handle);
    }

    /// Requests a cooperative stop and waits until the task exits. The
    /// task checkpoints its marker before acknowledging.
    pub fn stop(&self) {
        if let Some(ctrl) = self.ctrl.lock().take() {
            let (ack_tx, ack_rx) = mpsc::channel();
            if ctrl.send(ack_tx).is_ok() {
                // the ack channel disconnects if the task finished on
                // its own without seeing the request
                let _ = ack_rx.recv();
            }
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn generate(self: &Arc<Self>, root: Hash, ctrl: &Receiver<StopRequest>) {
        let marker = self.progress().unwrap_or_default();
        info!(
            "Generating state snapshot, root: {root:.8}, at: {}",
            if marker.is_empty() { "start".to_string() } else { hex::encode(&marker) }
        );
        let mut run = GenRun {
            generator: self.as_ref(),
            ctrl,
            batch: self.shared.store.new_batch(),
            marker,
            aborted: None,
            accounts: 0,
            slots: 0,
            wiped: 0,
        };
        match self.generate_accounts(&mut run, root) {
            Ok(()) => {
                if let Err(err) = run.finish(root) {
                    error!("Failed to finalize state snapshot, err: {err}");
                    return;
                }
                info!(
                    "Generated state snapshot, root: {root:.8}, accounts: {}, slots: {}, wiped: {}",
                    run.accounts, run.slots, run.wiped
                );
            }
            Err(Error::Aborted) => {
                debug!("Aborting state snapshot generation, root: {root:.8}");
                if let Some(ack) = run.aborted.take() {
                    let _ = ack.send(());
                }
            }
            Err(err) => {
                // typically a missing trie; generation stays paused
                // until the next commit relaunches it
                error!("State snapshot generation paused, root: {root:.8}, err: {err}");
            }
        }
    }

    fn generate_accounts(&self, run: &mut GenRun<'_, '_>, root: Hash) -> Result<()> {
        let store = self.shared.store.as_ref();
        let source = StoreNodeSource::new(store);
        let trie = self
            .shared
            .loader
            .open(&root, &source)
            .map_err(|_| Error::MissingTrie { root })?;

        let marker = run.marker.clone();
        let mut origin: Vec<u8> = marker.get(..32).map(<[u8]>::to_vec).unwrap_or_default();
        // a compound marker resumes inside the storage of one account
        let mut storage_resume: Option<(Vec<u8>, Vec<u8>)> =
            (marker.len() > 32).then(|| (marker[..32].to_vec(), marker[32..].to_vec()));
        loop {
            let (exhausted, last) =
                self.generate_account_segment(run, &*trie, root, &origin, &mut storage_resume)?;
            let next = if exhausted { None } else { increase_key(&last) };
            match next {
                Some(next) => origin = next,
                // either every account is covered or the key space
                // itself overflowed; storage rows beyond the last
                // account belong to nobody
                None => {
                    if let Some(from) = increase_key(&last) {
                        self.wipe_storage_between(run, &from, None)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Processes one account segment. Returns whether the account space
    /// is exhausted and the highest key the segment covered.
    fn generate_account_segment(
        &self,
        run: &mut GenRun<'_, '_>,
        trie: &dyn Trie,
        root: Hash,
        origin: &[u8],
        storage_resume: &mut Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(bool, Vec<u8>)> {
        let store = self.shared.store.as_ref();

        // collect the flat rows of the segment, converting the slim
        // values into the full encoding the trie commits to
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut vals: Vec<Vec<u8>> = Vec::new();
        let mut disk_more = false;
        let mut convert_failed = false;
        let mut iter = store.iter(&[schema::SNAPSHOT_ACCOUNT_PREFIX], origin);
        while iter.next() {
            if keys.len() == ACCOUNT_CHECK_RANGE {
                disk_more = true;
                break;
            }
            keys.push(iter.key()[1..].to_vec());
            match Account::slim_to_full(iter.value()) {
                Ok(full) => vals.push(full),
                Err(_) => {
                    // corrupted row, force the repair path
                    convert_failed = true;
                    vals.push(iter.value().to_vec());
                }
            }
        }
        iter.release();

        let last_flat = keys.last().cloned().unwrap_or_default();
        let proven = if convert_failed {
            Err(Error::InvalidProof("undecodable slim account".to_string()))
        } else {
            let proof = trie.range_proof(origin, &last_flat)?;
            self.shared
                .loader
                .verify_range_proof(&root, origin, &keys, &vals, &proof)
        };
        match proven {
            Ok(continues) => {
                counter!("strata.generator.proven_segments").increment(1);
                let mut prev: Option<Vec<u8>> = None;
                for (key, val) in keys.iter().zip(&vals) {
                    self.process_account(run, key, val, false, storage_resume, &mut prev, origin)?;
                }
                run.check_and_flush()?;
                Ok((!disk_more && !continues, last_flat))
            }
            Err(_) => {
                counter!("strata.generator.failed_segments").increment(1);
                let limit = disk_more.then_some(last_flat.clone());
                let mut trie_iter = trie.node_iterator(origin)?;
                let mut flat_pos = 0usize;
                let mut prev: Option<Vec<u8>> = None;
                let mut last = last_flat;
                let mut trie_exhausted = true;
                while trie_iter.next()? {
                    let Some((key, value)) = trie_iter.leaf() else {
                        continue;
                    };
                    let (key, value) = (key.to_vec(), value.to_vec());
                    if let Some(limit) = &limit {
                        if key.as_slice() > limit.as_slice() {
                            trie_exhausted = false;
                            break;
                        }
                    }
                    // flat rows sorting below the trie key are orphans
                    while flat_pos < keys.len() && keys[flat_pos] < key {
                        self.delete_account(run, &keys[flat_pos])?;
                        flat_pos += 1;
                    }
                    let write = if flat_pos < keys.len() && keys[flat_pos] == key {
                        let unchanged = vals[flat_pos] == value;
                        flat_pos += 1;
                        !unchanged
                    } else {
                        true
                    };
                    self.process_account(run, &key, &value, write, storage_resume, &mut prev, origin)?;
                    if key > last {
                        last = key;
                    }
                }
                while flat_pos < keys.len() {
                    self.delete_account(run, &keys[flat_pos])?;
                    flat_pos += 1;
                }
                run.check_and_flush()?;
                Ok((!disk_more && trie_exhausted, last))
            }
        }
    }

    /// Handles one account present in the trie: clears dangling storage
    /// of skipped accounts, refreshes the flat row if requested, and
    /// descends into the account's storage.
    #[allow(clippy::too_many_arguments)]
    fn process_account(
        &self,
        run: &mut GenRun<'_, '_>,
        key: &[u8],
        full_value: &[u8],
        write: bool,
        storage_resume: &mut Option<(Vec<u8>, Vec<u8>)>,
        prev: &mut Option<Vec<u8>>,
        segment_origin: &[u8],
    ) -> Result<()> {
        // storage rows of accounts strictly between the previous and the
        // current one belong to nobody
        let gap_start = match prev {
            Some(prev) => increase_key(prev).unwrap_or_default(),
            None => segment_origin.to_vec(),
        };
        self.wipe_storage_between(run, &gap_start, Some(key))?;
        *prev = Some(key.to_vec());

        run.marker = key.to_vec();
        run.accounts += 1;
        let account = Account::decode_full(full_value)
            .map_err(|_| Error::InvalidProof("undecodable account in trie".to_string()))?;
        if write {
            schema::write_account_snapshot(&*run.batch, key, &account.encode_slim())?;
            counter!("strata.generator.accounts.regenerated").increment(1);
        }
        let owner = Hash::try_from(key)
            .map_err(|_| Error::InvalidProof("account key is not a hash".to_string()))?;
        if account.root == *EMPTY_ROOT {
            // no storage trie, clear any lingering rows
            self.wipe_storage_of(run, key)?;
        } else {
            let resume = match storage_resume.take() {
                Some((account, slot)) if account == key => slot,
                other => {
                    *storage_resume = other;
                    Vec::new()
                }
            };
            self.generate_storage(run, &owner, account.root, &resume)?;
        }
        Ok(())
    }

    /// Removes the flat account row and all its storage rows.
    fn delete_account(&self, run: &mut GenRun<'_, '_>, key: &[u8]) -> Result<()> {
        schema::delete_account_snapshot(&*run.batch, key)?;
        self.wipe_storage_of(run, key)?;
        run.marker = key.to_vec();
        counter!("strata.generator.accounts.deleted").increment(1);
        Ok(())
    }

    /// Deletes every flat storage row of one account.
    fn wipe_storage_of(&self, run: &mut GenRun<'_, '_>, account: &[u8]) -> Result<()> {
        let prefix = schema::storage_snapshots_prefix(account);
        let mut iter = self.shared.store.iter(&prefix, &[]);
        while iter.next() {
            run.batch.delete(iter.key())?;
            run.wiped += 1;
        }
        iter.release();
        Ok(())
    }

    /// Deletes every flat storage row whose account hash lies in
    /// `[from, to)`, or in `[from, ∞)` when no bound is given.
    fn wipe_storage_between(
        &self,
        run: &mut GenRun<'_, '_>,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> Result<()> {
        if let Some(to) = to {
            if from >= to {
                return Ok(());
            }
        }
        let mut iter = self
            .shared
            .store
            .iter(&[schema::SNAPSHOT_STORAGE_PREFIX], from);
        while iter.next() {
            if let Some(to) = to {
                if &iter.key()[1..33] >= to {
                    break;
                }
            }
            run.batch.delete(iter.key())?;
            run.wiped += 1;
        }
        iter.release();
        Ok(())
    }

    /// Generates the storage of one account, segment by segment.
    fn generate_storage(
        &self,
        run: &mut GenRun<'_, '_>,
        owner: &Hash,
        root: Hash,
        resume: &[u8],
    ) -> Result<()> {
        let store = self.shared.store.as_ref();
        let source = StoreNodeSource::new(store);
        let trie = self
            .shared
            .loader
            .open_storage(owner, &root, &source)
            .map_err(|_| Error::MissingTrie { root })?;

        let mut origin = resume.to_vec();
        loop {
            let (exhausted, last) =
                self.generate_storage_segment(run, &*trie, owner, root, &origin)?;
            if exhausted {
                return Ok(());
            }
            match increase_key(&last) {
                Some(next) => origin = next,
                None => return Ok(()),
            }
        }
    }

    fn generate_storage_segment(
        &self,
        run: &mut GenRun<'_, '_>,
        trie: &dyn Trie,
        owner: &Hash,
        root: Hash,
        origin: &[u8],
    ) -> Result<(bool, Vec<u8>)> {
        let store = self.shared.store.as_ref();
        let prefix = schema::storage_snapshots_prefix(owner.as_ref());

        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut vals: Vec<Vec<u8>> = Vec::new();
        let mut disk_more = false;
        let mut iter = store.iter(&prefix, origin);
        while iter.next() {
            if keys.len() == STORAGE_CHECK_RANGE {
                disk_more = true;
                break;
            }
            keys.push(iter.key()[33..].to_vec());
            vals.push(iter.value().to_vec());
        }
        iter.release();

        let last_flat = keys.last().cloned().unwrap_or_default();
        let proof = trie.range_proof(origin, &last_flat)?;
        let proven = self
            .shared
            .loader
            .verify_range_proof(&root, origin, &keys, &vals, &proof);
        match proven {
            Ok(continues) => {
                for key in &keys {
                    run.marker = compound_marker(owner, key);
                    run.slots += 1;
                }
                run.check_and_flush()?;
                Ok((!disk_more && !continues, last_flat))
            }
            Err(_) => {
                let limit = disk_more.then_some(last_flat.clone());
                let mut trie_iter = trie.node_iterator(origin)?;
                let mut flat_pos = 0usize;
                let mut last = last_flat;
                let mut trie_exhausted = true;
                while trie_iter.next()? {
                    let Some((key, value)) = trie_iter.leaf() else {
                        continue;
                    };
                    let (key, value) = (key.to_vec(), value.to_vec());
                    if let Some(limit) = &limit {
                        if key.as_slice() > limit.as_slice() {
                            trie_exhausted = false;
                            break;
                        }
                    }
                    while flat_pos < keys.len() && keys[flat_pos] < key {
                        schema::delete_storage_snapshot(&*run.batch, owner.as_ref(), &keys[flat_pos])?;
                        flat_pos += 1;
                    }
                    let write = if flat_pos < keys.len() && keys[flat_pos] == key {
                        let unchanged = vals[flat_pos] == value;
                        flat_pos += 1;
                        !unchanged
                    } else {
                        true
                    };
                    if write {
                        schema::write_storage_snapshot(&*run.batch, owner.as_ref(), &key, &value)?;
                        counter!("strata.generator.slots.regenerated").increment(1);
                    }
                    run.marker = compound_marker(owner, &key);
                    run.slots += 1;
                    if key > last {
                        last = key;
                    }
                }
                while flat_pos < keys.len() {
                    schema::delete_storage_snapshot(&*run.batch, owner.as_ref(), &keys[flat_pos])?;
                    flat_pos += 1;
                }
                run.check_and_flush()?;
                Ok((!disk_more && trie_exhausted, last))
            }
        }
    }
}

fn compound_marker(owner: &Hash, slot: &[u8]) -> Vec<u8> {
    let mut marker = Vec::with_capacity(32 + slot.len());
    marker.extend_from_slice(owner.as_ref());
    marker.extend_from_slice(slot);
    marker
}

/// Mutable state of one generation pass.
struct GenRun<'a, 'b> {
    generator: &'a Generator,
    ctrl: &'b Receiver<StopRequest>,
    batch: Box<dyn Batch>,
    marker: Vec<u8>,
    aborted: Option<Sender<()>>,
    accounts: u64,
    slots: u64,
    wiped: u64,
}

impl GenRun<'_, '_> {
    /// Flushes the pending batch together with the progress marker when
    /// it grew past the ideal size or a stop request arrived. A stop
    /// request surfaces as [Error::Aborted] after the flush.
    fn check_and_flush(&mut self) -> Result<()> {
        let stop = self.ctrl.try_recv().ok();
        if stop.is_some() || self.batch.value_size() > IDEAL_BATCH_SIZE {
            schema::write_snapshot_progress(&*self.batch, &self.marker)?;
            self.batch.write()?;
            self.batch.reset();
            *self.generator.progress.lock() = Some(self.marker.clone());
        }
        if let Some(ack) = stop {
            self.aborted = Some(ack);
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Writes the final batch: snapshot rows, the snapshot root, and the
    /// removal of the progress marker.
    fn finish(&mut self, root: Hash) -> Result<()> {
        schema::write_snapshot_root(&*self.batch, root.as_ref())?;
        schema::delete_snapshot_progress(&*self.batch)?;
        self.batch.write()?;
        self.batch.reset();
        *self.generator.progress.lock() = None;
        Ok(())
    }
}
