// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! End-to-end tests of the layered database: commit, fallthrough reads,
//! reverts, journaling, snapshot generation and pruning.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;

use strata::trie::mem::MemTrieLoader;
use strata::trie::{NodeSource, StackTrie, Trie, TrieLoader};
use strata::{
    bloom_file_path, walk_snapshot, Account, Config, Database, Hash, NodeSet, Pruner, StateBloom,
    StateSet, StateSetWithOrigin, EMPTY_ROOT, HISTORY_TABLES,
};
use strata_storage::{schema, Freezer, KeyValueReader, KeyValueWriter, MemDb};

struct Harness {
    store: Arc<MemDb>,
    dir: tempfile::TempDir,
    db: Database,
}

fn open_db(store: Arc<MemDb>, dir: &std::path::Path, config: Config) -> Database {
    let freezer = Freezer::open(dir, HISTORY_TABLES, false).unwrap();
    Database::open(store, Some(freezer), Arc::new(MemTrieLoader), config).unwrap()
}

fn open_harness(config: Config) -> Harness {
    let store = Arc::new(MemDb::new());
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(store.clone(), dir.path(), config);
    Harness { store, dir, db }
}

fn reopen(harness: Harness, config: Config) -> Harness {
    let Harness { store, dir, db } = harness;
    db.close();
    drop(db);
    let db = open_db(store.clone(), dir.path(), config);
    Harness { store, dir, db }
}

/// A per-account mutation of one block.
enum Edit {
    /// Create or update, optionally touching storage slots.
    Put {
        key: Hash,
        nonce: u64,
        storage: Vec<(Hash, Option<Vec<u8>>)>,
    },
    /// Remove a storage-less account.
    Delete { key: Hash },
}

/// Builds and stacks one block transition, returning its state root.
fn apply_block(db: &Database, parent: Hash, block: u64, edits: Vec<Edit>) -> Hash {
    let reader = db.state_reader(parent).unwrap();
    let loader = MemTrieLoader;
    let mut trie = loader.open(&parent, &reader).unwrap();

    let mut nodes = NodeSet::new();
    let mut state = StateSet::new();
    let mut account_origin = HashMap::new();
    let mut storage_origin: HashMap<Hash, HashMap<Hash, Bytes>> = HashMap::new();

    for edit in edits {
        let key = match &edit {
            Edit::Put { key, .. } | Edit::Delete { key } => *key,
        };
        let pre_full = trie.get(key.as_ref()).unwrap();
        let pre_slim = pre_full
            .as_deref()
            .map(|blob| Account::full_to_slim(blob).unwrap())
            .unwrap_or_default();
        account_origin.insert(key, Bytes::from(pre_slim));

        match edit {
            Edit::Put {
                nonce, storage, ..
            } => {
                let pre_root = pre_full
                    .as_deref()
                    .map(|blob| Account::decode_full(blob).unwrap().root)
                    .unwrap_or(*EMPTY_ROOT);
                let mut account = Account {
                    nonce,
                    root: pre_root,
                    ..Default::default()
                };
                if !storage.is_empty() {
                    let mut storage_trie =
                        loader.open_storage(&key, &pre_root, &reader).unwrap();
                    for (slot, value) in storage {
                        let pre_slot = storage_trie.get(slot.as_ref()).unwrap().unwrap_or_default();
                        storage_origin
                            .entry(key)
                            .or_default()
                            .insert(slot, Bytes::from(pre_slot));
                        match value {
                            Some(value) => {
                                storage_trie.put(slot.as_ref(), value.clone()).unwrap();
                                state
                                    .storages
                                    .entry(key)
                                    .or_default()
                                    .insert(slot, Bytes::from(value));
                            }
                            None => {
                                storage_trie.delete(slot.as_ref()).unwrap();
                                state
                                    .storages
                                    .entry(key)
                                    .or_default()
                                    .insert(slot, Bytes::new());
                            }
                        }
                    }
                    let (storage_root, set) = storage_trie.commit().unwrap();
                    nodes.merge(set);
                    account.root = storage_root;
                }
                trie.put(key.as_ref(), account.encode_full()).unwrap();
                state.accounts.insert(key, Bytes::from(account.encode_slim()));
            }
            Edit::Delete { .. } => {
                trie.delete(key.as_ref()).unwrap();
                state.accounts.insert(key, Bytes::new());
            }
        }
    }
    let (root, set) = trie.commit().unwrap();
    nodes.merge(set);
    db.update(
        root,
        parent,
        block,
        nodes,
        StateSetWithOrigin::new(state, account_origin, storage_origin),
    )
    .unwrap();
    root
}

fn acct(n: u8) -> Hash {
    Hash::of(&[b'a', n])
}

fn slot(n: u8) -> Hash {
    Hash::of(&[b's', n])
}

fn put(key: Hash, nonce: u64) -> Edit {
    Edit::Put {
        key,
        nonce,
        storage: Vec::new(),
    }
}

/// Snapshot of every state-bearing record in the store, ignoring
/// metadata singletons.
fn dump_state(store: &MemDb) -> BTreeMap<Vec<u8>, Vec<u8>> {
    use strata_storage::Iteratee;
    let mut dump = BTreeMap::new();
    let mut iter = store.iter(&[], &[]);
    while iter.next() {
        let key = iter.key();
        let state_prefix = matches!(
            key.first(),
            Some(&schema::ACCOUNT_TRIE_PREFIX)
                | Some(&schema::STORAGE_TRIE_PREFIX)
                | Some(&schema::SNAPSHOT_ACCOUNT_PREFIX)
                | Some(&schema::SNAPSHOT_STORAGE_PREFIX)
                | Some(&schema::CODE_PREFIX)
        );
        if state_prefix && key.len() > 1 {
            dump.insert(key.to_vec(), iter.value().to_vec());
        }
    }
    iter.release();
    dump
}

#[test]
fn test_commit_and_persist() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;
    assert_eq!(db.disk_root(), *EMPTY_ROOT);
    assert_eq!(db.disk_state_id(), 0);

    let r1 = apply_block(db, *EMPTY_ROOT, 1, vec![put(acct(1), 7)]);
    // visible from the head before any persistence
    let reader = db.state_reader(r1).unwrap();
    assert_eq!(reader.account(&acct(1)).unwrap().unwrap().nonce, 7);
    // the account leaf is a dirty node visible through the layer
    assert!(!reader.node(&Hash::ZERO, acct(1).as_ref(), None).unwrap().is_empty());

    db.commit(r1).unwrap();
    assert_eq!(db.disk_root(), r1);
    assert_eq!(db.disk_state_id(), 1);
    assert_eq!(
        schema::read_persistent_state_id(harness.store.as_ref()).unwrap(),
        1
    );
    // the node made it into the store under its trie path
    assert!(
        schema::read_account_trie_node(harness.store.as_ref(), acct(1).as_ref())
            .unwrap()
            .is_some()
    );
    // and the flat snapshot serves the account
    let reader = db.state_reader(r1).unwrap();
    assert_eq!(reader.account(&acct(1)).unwrap().unwrap().nonce, 7);
}

#[test]
fn test_read_fallthrough() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;

    let r1 = apply_block(db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    let r2 = apply_block(db, r1, 2, vec![put(acct(2), 2)]);

    let reader = db.state_reader(r2).unwrap();
    // own layer
    assert_eq!(reader.account(&acct(2)).unwrap().unwrap().nonce, 2);
    // parent diff layer
    assert_eq!(reader.account(&acct(1)).unwrap().unwrap().nonce, 1);
    // unknown key falls through to the disk layer and misses
    assert!(reader.account(&acct(9)).unwrap().is_none());
    assert!(reader
        .node(&Hash::ZERO, acct(9).as_ref(), None)
        .unwrap()
        .is_empty());

    // the intermediate layer still answers with its own state
    let mid = db.state_reader(r1).unwrap();
    assert_eq!(mid.account(&acct(1)).unwrap().unwrap().nonce, 1);
    assert!(mid.account(&acct(2)).unwrap().is_none());
}

#[test]
fn test_recover_to_genesis_restores_store() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;
    let baseline = dump_state(&harness.store);

    let r1 = apply_block(db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    let r2 = apply_block(
        db,
        r1,
        2,
        vec![Edit::Put {
            key: acct(2),
            nonce: 2,
            storage: vec![(slot(1), Some(b"v1".to_vec()))],
        }],
    );
    let r3 = apply_block(db, r2, 3, vec![put(acct(1), 11)]);
    db.commit(r3).unwrap();
    assert_eq!(db.disk_state_id(), 3);
    assert_ne!(dump_state(&harness.store), baseline);

    db.recover(*EMPTY_ROOT).unwrap();
    assert_eq!(db.disk_root(), *EMPTY_ROOT);
    assert_eq!(db.disk_state_id(), 0);
    assert_eq!(dump_state(&harness.store), baseline);
}

#[test]
fn test_recover_single_buffered_transition() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;

    let r1 = apply_block(db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    let r2 = apply_block(db, r1, 2, vec![put(acct(1), 2)]);
    // flatten one layer into the buffer without flushing it
    db.cap(r2, 1).unwrap();
    assert_eq!(db.disk_root(), r1);
    assert_eq!(db.disk_state_id(), 1);
    // nothing hit the store yet
    assert_eq!(
        schema::read_persistent_state_id(harness.store.as_ref()).unwrap(),
        0
    );

    db.recover(*EMPTY_ROOT).unwrap();
    assert_eq!(db.disk_root(), *EMPTY_ROOT);
    assert_eq!(db.disk_state_id(), 0);
    let reader = db.state_reader(*EMPTY_ROOT).unwrap();
    assert!(reader.account(&acct(1)).unwrap().is_none());
}

#[test]
fn test_history_window_truncates_tail() {
    let config = Config::builder().state_history(2).build();
    let harness = open_harness(config);
    let db = &harness.db;

    let mut parent = *EMPTY_ROOT;
    let mut roots = Vec::new();
    for block in 1..=4u64 {
        let root = apply_block(db, parent, block, vec![put(acct(1), block)]);
        db.commit(root).unwrap();
        roots.push(root);
        parent = root;
    }
    // tail truncation drops the root lookups of the expired histories,
    // so only roots within the retained window stay recoverable
    assert!(db.recoverable(&roots[2]));
    assert!(!db.recoverable(&roots[1]));
    assert!(!db.recoverable(&roots[0]));
    assert!(!db.recoverable(&EMPTY_ROOT));

    db.recover(roots[2]).unwrap();
    assert_eq!(db.disk_root(), roots[2]);
    let reader = db.state_reader(roots[2]).unwrap();
    assert_eq!(reader.account(&acct(1)).unwrap().unwrap().nonce, 3);
}

#[test]
fn test_journal_roundtrip() {
    let harness = open_harness(Config::builder().build());
    let r1 = apply_block(&harness.db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    let r2 = apply_block(
        &harness.db,
        r1,
        2,
        vec![Edit::Put {
            key: acct(2),
            nonce: 2,
            storage: vec![(slot(1), Some(b"v1".to_vec()))],
        }],
    );
    harness.db.journal(r2).unwrap();

    let harness = reopen(harness, Config::builder().build());
    let db = &harness.db;
    assert_eq!(db.disk_root(), *EMPTY_ROOT);
    assert_eq!(db.layer_count(), 3);

    let reader = db.state_reader(r2).unwrap();
    assert_eq!(reader.account(&acct(1)).unwrap().unwrap().nonce, 1);
    assert_eq!(reader.account(&acct(2)).unwrap().unwrap().nonce, 2);
    assert_eq!(
        reader.storage(&acct(2), &slot(1)).unwrap().unwrap().as_ref(),
        b"v1"
    );

    // committing the journaled chain still works
    db.commit(r2).unwrap();
    assert_eq!(db.disk_root(), r2);
    assert_eq!(db.disk_state_id(), 2);
}

#[test]
fn test_unmatched_journal_discarded() {
    let harness = open_harness(Config::builder().build());
    let r1 = apply_block(&harness.db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    harness.db.commit(r1).unwrap();
    harness.db.journal(r1).unwrap();

    // the persisted trie root moves underneath the journal
    schema::write_account_trie_node(harness.store.as_ref(), &[], b"tampered").unwrap();

    let harness = reopen(harness, Config::builder().build());
    assert_eq!(harness.db.layer_count(), 1);
    assert_eq!(harness.db.disk_root(), Hash::of(b"tampered"));
}

#[test]
fn test_double_flatten_rejected() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;

    // two competing children of the same disk layer
    let r1a = apply_block(db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    let r1b = apply_block(db, *EMPTY_ROOT, 1, vec![put(acct(2), 2)]);
    assert_ne!(r1a, r1b);

    db.commit(r1a).unwrap();
    // the sibling's base is gone; flattening it must fail
    assert!(db.commit(r1b).is_err());
}

#[test]
fn test_generator_resumption() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;

    // five accounts; the middle one (in hash order) carries storage
    let mut keys: Vec<Hash> = (1..=5u8).map(acct).collect();
    keys.sort();
    let wedge = keys[2];
    let edits = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            if *key == wedge {
                Edit::Put {
                    key: *key,
                    nonce: i as u64 + 1,
                    storage: vec![(slot(1), Some(b"w".to_vec()))],
                }
            } else {
                put(*key, i as u64 + 1)
            }
        })
        .collect();
    let r1 = apply_block(db, *EMPTY_ROOT, 1, edits);
    db.commit(r1).unwrap();
    harness.db.close();
    drop(harness.db);

    // pretend generation stopped right after the second account, lose a
    // later snapshot row, and wedge the generator by breaking the
    // storage trie of the third account
    let store = harness.store.clone();
    schema::write_snapshot_progress(store.as_ref(), keys[1].as_ref()).unwrap();
    schema::delete_account_snapshot(store.as_ref(), keys[3].as_ref()).unwrap();
    schema::delete_storage_trie_node(store.as_ref(), wedge.as_ref(), &[]).unwrap();

    let db = open_db(store.clone(), harness.dir.path(), Config::builder().build());
    let reader = db.state_reader(r1).unwrap();

    // covered by the marker: served straight from the snapshot
    assert_eq!(reader.account(&keys[0]).unwrap().unwrap().nonce, 1);
    assert_eq!(reader.account(&keys[1]).unwrap().unwrap().nonce, 2);
    // beyond the marker: the snapshot defers to the trie, which still
    // holds the account whose flat row was lost
    assert_eq!(reader.account(&keys[3]).unwrap().unwrap().nonce, 4);
    assert_eq!(reader.account(&keys[4]).unwrap().unwrap().nonce, 5);
    // the wedged account resolves through the trie as well, but its
    // broken storage trie cannot
    assert_eq!(
        reader.account(&wedge).unwrap().unwrap().nonce,
        keys.iter().position(|k| *k == wedge).unwrap() as u64 + 1
    );
    assert!(reader.storage(&wedge, &slot(1)).is_err());

    db.close();
}

#[test]
fn test_pruner_conservation_and_resume() {
    let store = Arc::new(MemDb::new());
    let datadir = tempfile::tempdir().unwrap();
    let loader = MemTrieLoader;

    // live state, hash-addressed: one plain account, one contract
    let mut live: Vec<Hash> = Vec::new();
    let mut storage_stack = loader.stack_trie(Box::new(|hash, blob| {
        store.put(hash.as_ref(), blob).unwrap();
    }));
    storage_stack
        .update(slot(1).as_ref(), b"v1")
        .unwrap();
    let storage_root = storage_stack.finish();
    drop(storage_stack);

    let code = b"contract code";
    let code_hash = Hash::of(code);
    schema::write_code(store.as_ref(), code_hash.as_ref(), code).unwrap();

    let plain = Account {
        nonce: 1,
        ..Default::default()
    };
    let contract = Account {
        nonce: 2,
        root: storage_root,
        code_hash,
        ..Default::default()
    };
    let mut accounts: Vec<(Hash, Account)> = vec![(acct(1), plain), (acct(2), contract.clone())];
    accounts.sort_by_key(|(key, _)| *key);

    let mut account_stack = loader.stack_trie(Box::new(|hash, blob| {
        store.put(hash.as_ref(), blob).unwrap();
        live.push(*hash);
    }));
    for (key, account) in &accounts {
        account_stack.update(key.as_ref(), &account.encode_full()).unwrap();
        schema::write_account_snapshot(store.as_ref(), key.as_ref(), &account.encode_slim())
            .unwrap();
    }
    let root = account_stack.finish();
    drop(account_stack);
    schema::write_storage_snapshot(
        store.as_ref(),
        acct(2).as_ref(),
        slot(1).as_ref(),
        b"v1",
    )
    .unwrap();
    schema::write_genesis_root(store.as_ref(), root.as_ref()).unwrap();

    // garbage that must be swept: stale hash-keyed nodes and dead code
    let junk1 = Hash::of(b"stale node");
    let junk_code = Hash::of(b"dead code");
    store.put(junk1.as_ref(), b"stale").unwrap();
    schema::write_code(store.as_ref(), junk_code.as_ref(), b"dead").unwrap();

    // simulate a run that crashed after committing the filter
    let mut filter = StateBloom::with_bytes(1024 * 1024);
    walk_snapshot(store.as_ref(), &loader, root, &mut filter).unwrap();
    let marker = bloom_file_path(datadir.path(), &root);
    filter.commit(&marker).unwrap();
    assert!(marker.exists());

    let pruner = Pruner::new(
        store.clone(),
        Arc::new(MemTrieLoader),
        datadir.path().to_path_buf(),
        256,
    );
    // recovery completes the sweep and drops the marker
    pruner.prune(None).unwrap();
    assert!(!marker.exists());

    assert!(!store.has(junk1.as_ref()).unwrap());
    assert!(!schema::has_code(store.as_ref(), junk_code.as_ref()).unwrap());
    for hash in &live {
        assert!(store.has(hash.as_ref()).unwrap(), "live node {hash:.8} swept");
    }
    assert!(schema::has_code(store.as_ref(), code_hash.as_ref()).unwrap());

    // a fresh prune over the already-clean store is a no-op
    pruner.prune(Some(root)).unwrap();
    for hash in &live {
        assert!(store.has(hash.as_ref()).unwrap());
    }
}

#[test]
fn test_update_rejects_unknown_parent_and_cycles() {
    let harness = open_harness(Config::builder().build());
    let db = &harness.db;

    let err = db
        .update(
            Hash::of(b"child"),
            Hash::of(b"nonexistent"),
            1,
            NodeSet::new(),
            StateSetWithOrigin::default(),
        )
        .unwrap_err();
    assert!(matches!(err, strata::Error::LayerNotFound { .. }));

    let err = db
        .update(
            *EMPTY_ROOT,
            *EMPTY_ROOT,
            1,
            NodeSet::new(),
            StateSetWithOrigin::default(),
        )
        .unwrap_err();
    assert!(matches!(err, strata::Error::LayerCycle { .. }));
}

#[test]
fn test_read_only_rejects_mutation() {
    let harness = open_harness(Config::builder().build());
    let r1 = apply_block(&harness.db, *EMPTY_ROOT, 1, vec![put(acct(1), 1)]);
    harness.db.commit(r1).unwrap();

    let harness = reopen(harness, Config::builder().read_only(true).build());
    let err = apply_block_err(&harness.db, r1);
    assert!(matches!(err, strata::Error::ReadOnly));
    assert!(matches!(
        harness.db.commit(r1).unwrap_err(),
        strata::Error::ReadOnly
    ));
}

fn apply_block_err(db: &Database, parent: Hash) -> strata::Error {
    db.update(
        Hash::of(b"whatever"),
        parent,
        9,
        NodeSet::new(),
        StateSetWithOrigin::default(),
    )
    .unwrap_err()
}
