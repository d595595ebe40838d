// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! State histories: reverse diffs recorded per committed transition.
//!
//! Each transition writes one history record holding the pre-image of
//! every account and storage slot it mutated, so the disk layer can be
//! walked back to any recorded state. Records live in five parallel
//! freezer tables (meta, two fixed-layout index streams, two packed data
//! streams) indexed by `state id - 1`, plus a `root → id` lookup in the
//! key-value store.
//!
//! Index rows are fixed-size little-endian:
//!
//! - account row (56 bytes): `hash ‖ len:u32 ‖ offset:u64 ‖
//!   slot_offset:u64 ‖ slot_count:u32`
//! - slot row (44 bytes): `hash ‖ len:u32 ‖ offset:u64`
//!
//! with addresses and slot hashes sorted ascending and both data streams
//! packed gap-free, which the decoder verifies.

use std::collections::BTreeMap;

use log::debug;
use metrics::counter;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::node::NodeSet;
use crate::trie::{NodeSource, Trie, TrieLoader};
use crate::types::{Hash, StateId, EMPTY_ROOT, HASH_LEN};
use strata_storage::{schema, Batch, Batcher, DatabaseError, Freezer, Store};

/// Version tag of the history record layout.
const HISTORY_VERSION: u8 = 0;

/// The freezer tables holding history records.
pub const HISTORY_TABLES: &[&str] = &[
    TABLE_META,
    TABLE_ACCOUNT_INDEX,
    TABLE_STORAGE_INDEX,
    TABLE_ACCOUNT_DATA,
    TABLE_STORAGE_DATA,
];

const TABLE_META: &str = "history.meta";
const TABLE_ACCOUNT_INDEX: &str = "account.index";
const TABLE_STORAGE_INDEX: &str = "storage.index";
const TABLE_ACCOUNT_DATA: &str = "account.data";
const TABLE_STORAGE_DATA: &str = "storage.data";

const ACCOUNT_INDEX_SIZE: usize = HASH_LEN + 4 + 8 + 8 + 4;
const SLOT_INDEX_SIZE: usize = HASH_LEN + 4 + 8;
const META_MIN_SIZE: usize = 1 + 2 * HASH_LEN + 8;

/// Histories are stored at `state id - 1`: the first transition has id 1
/// and occupies freezer item 0.
fn freezer_item(id: StateId) -> u64 {
    id - 1
}

#[derive(Debug, Clone, Copy)]
struct AccountIndex {
    hash: Hash,
    length: u32,
    offset: u64,
    slot_offset: u64,
    slot_count: u32,
}

impl AccountIndex {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.hash.as_ref());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.slot_offset.to_le_bytes());
        out.extend_from_slice(&self.slot_count.to_le_bytes());
    }

    fn decode(row: &[u8]) -> Self {
        AccountIndex {
            hash: Hash::try_from(&row[..HASH_LEN]).expect("fixed row"),
            length: u32::from_le_bytes(row[32..36].try_into().expect("fixed row")),
            offset: u64::from_le_bytes(row[36..44].try_into().expect("fixed row")),
            slot_offset: u64::from_le_bytes(row[44..52].try_into().expect("fixed row")),
            slot_count: u32::from_le_bytes(row[52..56].try_into().expect("fixed row")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotIndex {
    hash: Hash,
    length: u32,
    offset: u64,
}

impl SlotIndex {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.hash.as_ref());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }

    fn decode(row: &[u8]) -> Self {
        SlotIndex {
            hash: Hash::try_from(&row[..HASH_LEN]).expect("fixed row"),
            length: u32::from_le_bytes(row[32..36].try_into().expect("fixed row")),
            offset: u64::from_le_bytes(row[36..44].try_into().expect("fixed row")),
        }
    }
}

/// Identity and validity envelope of a history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMeta {
    /// The state root before the transition.
    pub parent: Hash,
    /// The state root after the transition.
    pub root: Hash,
    /// The block that produced the transition.
    pub block: u64,
    /// Accounts whose storage pre-images were elided by a bulk contract
    /// destruction; such a record can never drive a revert.
    pub incomplete: Vec<Hash>,
}

impl HistoryMeta {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_MIN_SIZE + self.incomplete.len() * HASH_LEN);
        out.push(HISTORY_VERSION);
        out.extend_from_slice(self.parent.as_ref());
        out.extend_from_slice(self.root.as_ref());
        out.extend_from_slice(&self.block.to_le_bytes());
        for hash in &self.incomplete {
            out.extend_from_slice(hash.as_ref());
        }
        out
    }

    fn decode(blob: &[u8]) -> Result<Self> {
        if blob.len() < META_MIN_SIZE || (blob.len() - META_MIN_SIZE) % HASH_LEN != 0 {
            return Err(Error::CorruptedHistory(format!(
                "invalid meta length {}",
                blob.len()
            )));
        }
        if blob[0] != HISTORY_VERSION {
            return Err(Error::CorruptedHistory(format!(
                "unknown version {}",
                blob[0]
            )));
        }
        let parent = Hash::try_from(&blob[1..33]).expect("checked length");
        let root = Hash::try_from(&blob[33..65]).expect("checked length");
        let block = u64::from_le_bytes(blob[65..73].try_into().expect("checked length"));
        let incomplete = blob[META_MIN_SIZE..]
            .chunks_exact(HASH_LEN)
            .map(|chunk| Hash::try_from(chunk).expect("exact chunk"))
            .collect();
        Ok(HistoryMeta {
            parent,
            root,
            block,
            incomplete,
        })
    }
}

/// One recorded state transition: metadata plus the pre-image of every
/// mutated account and storage slot, keyed by account and slot hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    /// Record envelope.
    pub meta: HistoryMeta,
    /// Account hash → pre-transition slim account blob (empty = did not
    /// exist).
    pub accounts: BTreeMap<Hash, Vec<u8>>,
    /// Account hash → slot hash → pre-transition value (empty = did not
    /// exist).
    pub storages: BTreeMap<Hash, BTreeMap<Hash, Vec<u8>>>,
}

impl History {
    /// Assembles the history of one transition from its pre-images.
    #[must_use]
    pub fn new(
        root: Hash,
        parent: Hash,
        block: u64,
        accounts: BTreeMap<Hash, Vec<u8>>,
        storages: BTreeMap<Hash, BTreeMap<Hash, Vec<u8>>>,
        incomplete: Vec<Hash>,
    ) -> Self {
        History {
            meta: HistoryMeta {
                parent,
                root,
                block,
                incomplete,
            },
            accounts,
            storages,
        }
    }

    /// Serializes the record into its four parallel byte streams:
    /// `(account_data, storage_data, account_indexes, storage_indexes)`.
    fn encode(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut account_data = Vec::new();
        let mut storage_data = Vec::new();
        let mut account_indexes = Vec::new();
        let mut storage_indexes = Vec::new();
        let mut slot_number: u64 = 0;

        for (hash, blob) in &self.accounts {
            let mut index = AccountIndex {
                hash: *hash,
                length: blob.len() as u32,
                offset: account_data.len() as u64,
                slot_offset: 0,
                slot_count: 0,
            };
            if let Some(slots) = self.storages.get(hash) {
                for (slot, value) in slots {
                    let slot_index = SlotIndex {
                        hash: *slot,
                        length: value.len() as u32,
                        offset: storage_data.len() as u64,
                    };
                    storage_data.extend_from_slice(value);
                    slot_index.encode(&mut storage_indexes);
                }
                index.slot_offset = slot_number;
                index.slot_count = slots.len() as u32;
                slot_number += slots.len() as u64;
            }
            account_data.extend_from_slice(blob);
            index.encode(&mut account_indexes);
        }
        (account_data, storage_data, account_indexes, storage_indexes)
    }

    /// Deserializes and validates the four parallel byte streams.
    fn decode(
        meta: HistoryMeta,
        account_data: &[u8],
        storage_data: &[u8],
        account_indexes: &[u8],
        storage_indexes: &[u8],
    ) -> Result<Self> {
        if account_indexes.is_empty() || account_indexes.len() % ACCOUNT_INDEX_SIZE != 0 {
            return Err(Error::CorruptedHistory(format!(
                "invalid account index length {}",
                account_indexes.len()
            )));
        }
        if storage_indexes.len() % SLOT_INDEX_SIZE != 0 {
            return Err(Error::CorruptedHistory(format!(
                "invalid storage index length {}",
                storage_indexes.len()
            )));
        }
        let mut accounts = BTreeMap::new();
        let mut storages: BTreeMap<Hash, BTreeMap<Hash, Vec<u8>>> = BTreeMap::new();
        let mut last_account: Option<Hash> = None;
        let mut account_read: u64 = 0;
        let mut slot_index_read: u64 = 0;
        let mut slot_data_read: u64 = 0;

        for row in account_indexes.chunks_exact(ACCOUNT_INDEX_SIZE) {
            let index = AccountIndex::decode(row);
            if let Some(last) = last_account {
                if last >= index.hash {
                    return Err(Error::CorruptedHistory("accounts not in order".to_string()));
                }
            }
            if index.offset != account_read {
                return Err(Error::CorruptedHistory(
                    "account data buffer is gapped".to_string(),
                ));
            }
            let end = index.offset + u64::from(index.length);
            if end > account_data.len() as u64 {
                return Err(Error::CorruptedHistory(
                    "account data buffer is corrupted".to_string(),
                ));
            }
            accounts.insert(
                index.hash,
                account_data[index.offset as usize..end as usize].to_vec(),
            );
            last_account = Some(index.hash);
            account_read = end;

            if index.slot_count == 0 {
                continue;
            }
            if index.slot_offset * SLOT_INDEX_SIZE as u64 != slot_index_read {
                return Err(Error::CorruptedHistory(
                    "storage index buffer is gapped".to_string(),
                ));
            }
            let mut slots = BTreeMap::new();
            let mut last_slot: Option<Hash> = None;
            for _ in 0..index.slot_count {
                let start = slot_index_read as usize;
                let end = start + SLOT_INDEX_SIZE;
                if end > storage_indexes.len() {
                    return Err(Error::CorruptedHistory(
                        "storage index buffer is corrupted".to_string(),
                    ));
                }
                let slot = SlotIndex::decode(&storage_indexes[start..end]);
                if let Some(last) = last_slot {
                    if last >= slot.hash {
                        return Err(Error::CorruptedHistory(
                            "storage slots not in order".to_string(),
                        ));
                    }
                }
                if slot.offset != slot_data_read {
                    return Err(Error::CorruptedHistory(
                        "storage data buffer is gapped".to_string(),
                    ));
                }
                let data_end = slot.offset + u64::from(slot.length);
                if data_end > storage_data.len() as u64 {
                    return Err(Error::CorruptedHistory(
                        "storage data buffer is corrupted".to_string(),
                    ));
                }
                slots.insert(
                    slot.hash,
                    storage_data[slot.offset as usize..data_end as usize].to_vec(),
                );
                last_slot = Some(slot.hash);
                slot_index_read = end as u64;
                slot_data_read = data_end;
            }
            storages.insert(index.hash, slots);
        }
        Ok(History {
            meta,
            accounts,
            storages,
        })
    }
}

/// Persists the history of the transition with the given state id.
pub fn write_history(freezer: &Freezer, id: StateId, history: &History) -> Result<()> {
    let (account_data, storage_data, account_indexes, storage_indexes) = history.encode();
    let meta = history.meta.encode();
    freezer.append(
        freezer_item(id),
        &[
            (TABLE_META, &meta),
            (TABLE_ACCOUNT_INDEX, &account_indexes),
            (TABLE_STORAGE_INDEX, &storage_indexes),
            (TABLE_ACCOUNT_DATA, &account_data),
            (TABLE_STORAGE_DATA, &storage_data),
        ],
    )?;
    counter!("strata.history.data_bytes")
        .increment((account_data.len() + storage_data.len()) as u64);
    counter!("strata.history.index_bytes")
        .increment((account_indexes.len() + storage_indexes.len()) as u64);
    debug!(
        "Stored state history, id: {id}, block: {}, accounts: {}",
        history.meta.block,
        history.accounts.len()
    );
    Ok(())
}

/// Loads and validates the history of the given state id.
pub fn read_history(freezer: &Freezer, id: StateId) -> Result<History> {
    let read = |table| -> Result<Vec<u8>> {
        freezer.read(table, freezer_item(id)).map_err(|err| match err {
            DatabaseError::OutOfBounds { .. } => Error::HistoryNotFound { id },
            other => other.into(),
        })
    };
    let meta = HistoryMeta::decode(&read(TABLE_META)?)?;
    History::decode(
        meta,
        &read(TABLE_ACCOUNT_DATA)?,
        &read(TABLE_STORAGE_DATA)?,
        &read(TABLE_ACCOUNT_INDEX)?,
        &read(TABLE_STORAGE_INDEX)?,
    )
}

/// Removes histories with id above `new_head`, deleting their `root→id`
/// lookups first. Returns the number of records removed.
pub fn truncate_head(store: &dyn Store, freezer: &Freezer, new_head: StateId) -> Result<u64> {
    let head = freezer.ancients();
    let tail = freezer.tail();
    if new_head < tail {
        return Err(DatabaseError::TruncationOutOfRange {
            tail,
            head,
            target: new_head,
        }
        .into());
    }
    if new_head >= head {
        return Ok(0);
    }
    let metas = freezer.read_range(TABLE_META, new_head, head - new_head)?;
    let mut batch = store.new_batch();
    for blob in &metas {
        let meta = HistoryMeta::decode(blob)?;
        schema::delete_state_id(&*batch, meta.root.as_ref())?;
    }
    batch.write()?;
    freezer.truncate_head(new_head)?;
    Ok(head - new_head)
}

/// Removes histories with id at or below `new_tail`, deleting their
/// `root→id` lookups first. Returns the number of records removed.
pub fn truncate_tail(store: &dyn Store, freezer: &Freezer, new_tail: StateId) -> Result<u64> {
    let head = freezer.ancients();
    let tail = freezer.tail();
    if new_tail > head {
        return Err(DatabaseError::TruncationOutOfRange {
            tail,
            head,
            target: new_tail,
        }
        .into());
    }
    if new_tail <= tail {
        return Ok(0);
    }
    let metas = freezer.read_range(TABLE_META, tail, new_tail - tail)?;
    let mut batch = store.new_batch();
    for blob in &metas {
        let meta = HistoryMeta::decode(blob)?;
        schema::delete_state_id(&*batch, meta.root.as_ref())?;
    }
    batch.write()?;
    freezer.truncate_tail(new_tail)?;
    Ok(new_tail - tail)
}

/// Replays a history onto the post-state it was recorded for, producing
/// the dirty node set that turns `history.meta.root` back into
/// `history.meta.parent`.
pub fn apply(
    loader: &dyn TrieLoader,
    source: &dyn NodeSource,
    history: &History,
) -> Result<NodeSet> {
    if !history.meta.incomplete.is_empty() {
        return Err(Error::CorruptedHistory(
            "incomplete history cannot drive a revert".to_string(),
        ));
    }
    let mut trie = loader.open(&history.meta.root, source)?;
    let mut nodes = NodeSet::new();

    for (account_hash, pre_image) in &history.accounts {
        let post_blob = trie.get(account_hash.as_ref())?;
        let post_account = post_blob
            .as_deref()
            .map(Account::decode_full)
            .transpose()?;
        let post_storage_root = post_account
            .as_ref()
            .map_or(*EMPTY_ROOT, |account| account.root);
        let slots = history.storages.get(account_hash);

        if pre_image.is_empty() {
            // the account did not exist before the transition: every
            // recorded slot pre-image must be empty too, and draining
            // the slots must leave an empty storage trie
            if let Some(slots) = slots {
                if slots.values().any(|value| !value.is_empty()) {
                    return Err(Error::CorruptedHistory(format!(
                        "created account {account_hash:.8} carries storage pre-images"
                    )));
                }
            }
            if post_storage_root != *EMPTY_ROOT || slots.is_some() {
                let mut storage =
                    loader.open_storage(account_hash, &post_storage_root, source)?;
                if let Some(slots) = slots {
                    for slot in slots.keys() {
                        storage.delete(slot.as_ref())?;
                    }
                }
                let (root, set) = storage.commit()?;
                if root != *EMPTY_ROOT {
                    return Err(Error::RevertMismatch {
                        want: *EMPTY_ROOT,
                        got: root,
                    });
                }
                nodes.merge(set);
            }
            trie.delete(account_hash.as_ref())?;
            continue;
        }

        let pre_account = Account::decode_slim(pre_image)
            .map_err(|err| Error::CorruptedHistory(format!("bad account pre-image: {err}")))?;
        let need_storage =
            slots.is_some_and(|slots| !slots.is_empty()) || pre_account.root != post_storage_root;
        if need_storage {
            let mut storage = loader.open_storage(account_hash, &post_storage_root, source)?;
            if let Some(slots) = slots {
                for (slot, value) in slots {
                    if value.is_empty() {
                        storage.delete(slot.as_ref())?;
                    } else {
                        storage.put(slot.as_ref(), value.clone())?;
                    }
                }
            }
            let (root, set) = storage.commit()?;
            if root != pre_account.root {
                return Err(Error::RevertMismatch {
                    want: pre_account.root,
                    got: root,
                });
            }
            nodes.merge(set);
        }
        trie.put(account_hash.as_ref(), pre_account.encode_full())?;
    }

    let (root, set) = trie.commit()?;
    nodes.merge(set);
    if root != history.meta.parent {
        return Err(Error::RevertMismatch {
            want: history.meta.parent,
            got: root,
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn hash(rng: &mut StdRng) -> Hash {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes[..]);
        Hash::from(bytes)
    }

    fn random_history(rng: &mut StdRng, id: u64) -> History {
        let mut accounts = BTreeMap::new();
        let mut storages = BTreeMap::new();
        for _ in 0..rng.random_range(1..20) {
            let account = hash(rng);
            let deleted = rng.random_bool(0.2);
            let blob = if deleted {
                Vec::new()
            } else {
                Account {
                    nonce: rng.random(),
                    ..Default::default()
                }
                .encode_slim()
            };
            accounts.insert(account, blob);
            if !deleted && rng.random_bool(0.5) {
                let mut slots = BTreeMap::new();
                for _ in 0..rng.random_range(1..10) {
                    slots.insert(hash(rng), vec![rng.random::<u8>(); 3]);
                }
                storages.insert(account, slots);
            }
        }
        History::new(
            Hash::from([id as u8; 32]),
            Hash::from([id as u8 - 1; 32]),
            id,
            accounts,
            storages,
            Vec::new(),
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut rng = StdRng::seed_from_u64(42);
        for id in 1..=20u64 {
            let history = random_history(&mut rng, id);
            let (account_data, storage_data, account_indexes, storage_indexes) = history.encode();
            let decoded = History::decode(
                history.meta.clone(),
                &account_data,
                &storage_data,
                &account_indexes,
                &storage_indexes,
            )
            .unwrap();
            assert_eq!(decoded, history);
        }
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut rng = StdRng::seed_from_u64(7);
        let history = random_history(&mut rng, 1);
        let (account_data, storage_data, account_indexes, storage_indexes) = history.encode();

        // truncated index stream
        assert!(matches!(
            History::decode(
                history.meta.clone(),
                &account_data,
                &storage_data,
                &account_indexes[..account_indexes.len() - 1],
                &storage_indexes,
            ),
            Err(Error::CorruptedHistory(_))
        ));

        // reordered accounts break the sortedness check
        if account_indexes.len() >= 2 * ACCOUNT_INDEX_SIZE {
            let mut swapped = account_indexes.clone();
            swapped.rotate_left(ACCOUNT_INDEX_SIZE);
            assert!(matches!(
                History::decode(
                    history.meta.clone(),
                    &account_data,
                    &storage_data,
                    &swapped,
                    &storage_indexes,
                ),
                Err(Error::CorruptedHistory(_))
            ));
        }

        // shortened data stream overflows the last index entry
        assert!(matches!(
            History::decode(
                history.meta.clone(),
                &account_data[..account_data.len().saturating_sub(1)],
                &storage_data,
                &account_indexes,
                &storage_indexes,
            ),
            Err(Error::CorruptedHistory(_))
        ));
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = HistoryMeta {
            parent: Hash::from([1u8; 32]),
            root: Hash::from([2u8; 32]),
            block: 77,
            incomplete: vec![Hash::from([3u8; 32])],
        };
        assert_eq!(HistoryMeta::decode(&meta.encode()).unwrap(), meta);
        assert!(HistoryMeta::decode(&[0u8; 10]).is_err());
        let mut bad_version = meta.encode();
        bad_version[0] = 9;
        assert!(HistoryMeta::decode(&bad_version).is_err());
    }

    #[test]
    fn test_freezer_roundtrip_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let freezer = Freezer::open(dir.path(), HISTORY_TABLES, false).unwrap();
        let store = strata_storage::MemDb::new();
        let mut rng = StdRng::seed_from_u64(3);

        let histories: Vec<History> = (1..=10u64)
            .map(|id| random_history(&mut rng, id))
            .collect();
        for (i, history) in histories.iter().enumerate() {
            let id = i as u64 + 1;
            write_history(&freezer, id, history).unwrap();
            schema::write_state_id(&store, history.meta.root.as_ref(), id).unwrap();
        }
        assert_eq!(freezer.ancients(), 10);

        for (i, history) in histories.iter().enumerate() {
            assert_eq!(&read_history(&freezer, i as u64 + 1).unwrap(), history);
        }
        assert!(matches!(
            read_history(&freezer, 11),
            Err(Error::HistoryNotFound { id: 11 })
        ));

        // drop the two newest histories from the head
        assert_eq!(truncate_head(&store, &freezer, 8).unwrap(), 2);
        assert!(read_history(&freezer, 9).is_err());
        assert!(read_history(&freezer, 8).is_ok());
        assert_eq!(
            schema::read_state_id(&store, histories[9].meta.root.as_ref()).unwrap(),
            None
        );

        // hide the three oldest from the tail
        assert_eq!(truncate_tail(&store, &freezer, 3).unwrap(), 3);
        assert!(read_history(&freezer, 3).is_err());
        assert!(read_history(&freezer, 4).is_ok());
        assert_eq!(
            schema::read_state_id(&store, histories[0].meta.root.as_ref()).unwrap(),
            None
        );
        assert_eq!(
            schema::read_state_id(&store, histories[5].meta.root.as_ref()).unwrap(),
            Some(6)
        );

        // no-ops inside the already truncated ranges
        assert_eq!(truncate_head(&store, &freezer, 9).unwrap(), 0);
        assert_eq!(truncate_tail(&store, &freezer, 2).unwrap(), 0);
    }
}
