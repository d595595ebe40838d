// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The on-disk key layout and typed accessors.
//!
//! Every record kind stored in the key-value store gets a one-letter
//! prefix and a read/write/delete accessor triple here, so the layout
//! lives in exactly one place:
//!
//! - `A ‖ path`: account-trie node
//! - `O ‖ owner ‖ path`: storage-trie node
//! - `a ‖ account_hash`: flat snapshot account row
//! - `o ‖ account_hash ‖ slot_hash`: flat snapshot storage row
//! - `c ‖ code_hash`: contract code
//! - `L ‖ root`: state-id lookup for a root
//! - raw 32-byte key: hash-addressed trie node (legacy layout, swept by
//!   the pruner)
//!
//! plus a handful of singleton metadata keys.

use crate::{KeyValueDeleter, KeyValueReader, KeyValueWriter, Result};

/// Length in bytes of a hash key.
pub const HASH_LEN: usize = 32;

/// Prefix of account-trie node keys.
pub const ACCOUNT_TRIE_PREFIX: u8 = b'A';
/// Prefix of storage-trie node keys.
pub const STORAGE_TRIE_PREFIX: u8 = b'O';
/// Prefix of flat snapshot account rows.
pub const SNAPSHOT_ACCOUNT_PREFIX: u8 = b'a';
/// Prefix of flat snapshot storage rows.
pub const SNAPSHOT_STORAGE_PREFIX: u8 = b'o';
/// Prefix of contract code keys.
pub const CODE_PREFIX: u8 = b'c';
/// Prefix of root-to-state-id lookup keys.
pub const STATE_ID_PREFIX: u8 = b'L';

/// Singleton key holding the root of the persisted flat snapshot.
pub const SNAPSHOT_ROOT_KEY: &[u8] = b"SnapshotRoot";
/// Singleton key holding the id of the persisted state.
pub const PERSISTENT_STATE_ID_KEY: &[u8] = b"PersistentStateID";
/// Singleton key holding the snapshot generator progress marker.
pub const SNAPSHOT_PROGRESS_KEY: &[u8] = b"SnapshotProgress";
/// Singleton key holding the serialized layer journal.
pub const JOURNAL_KEY: &[u8] = b"TrieJournal";
/// Singleton key holding the genesis state root.
pub const GENESIS_ROOT_KEY: &[u8] = b"GenesisRoot";

/// Builds the key of an account-trie node.
#[must_use]
pub fn account_trie_node_key(path: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + path.len());
    key.push(ACCOUNT_TRIE_PREFIX);
    key.extend_from_slice(path);
    key
}

/// Builds the key of a storage-trie node.
#[must_use]
pub fn storage_trie_node_key(owner: &[u8], path: &[u8]) -> Vec<u8> {
    debug_assert_eq!(owner.len(), HASH_LEN);
    let mut key = Vec::with_capacity(1 + HASH_LEN + path.len());
    key.push(STORAGE_TRIE_PREFIX);
    key.extend_from_slice(owner);
    key.extend_from_slice(path);
    key
}

/// Builds the key of a flat snapshot account row.
#[must_use]
pub fn account_snapshot_key(account_hash: &[u8]) -> Vec<u8> {
    debug_assert_eq!(account_hash.len(), HASH_LEN);
    let mut key = Vec::with_capacity(1 + HASH_LEN);
    key.push(SNAPSHOT_ACCOUNT_PREFIX);
    key.extend_from_slice(account_hash);
    key
}

/// Builds the key of a flat snapshot storage row.
#[must_use]
pub fn storage_snapshot_key(account_hash: &[u8], slot_hash: &[u8]) -> Vec<u8> {
    debug_assert_eq!(account_hash.len(), HASH_LEN);
    debug_assert_eq!(slot_hash.len(), HASH_LEN);
    let mut key = Vec::with_capacity(1 + 2 * HASH_LEN);
    key.push(SNAPSHOT_STORAGE_PREFIX);
    key.extend_from_slice(account_hash);
    key.extend_from_slice(slot_hash);
    key
}

/// Builds the key prefix shared by all storage rows of one account.
#[must_use]
pub fn storage_snapshots_prefix(account_hash: &[u8]) -> Vec<u8> {
    debug_assert_eq!(account_hash.len(), HASH_LEN);
    let mut key = Vec::with_capacity(1 + HASH_LEN);
    key.push(SNAPSHOT_STORAGE_PREFIX);
    key.extend_from_slice(account_hash);
    key
}

/// Builds the key of a contract code blob.
#[must_use]
pub fn code_key(code_hash: &[u8]) -> Vec<u8> {
    debug_assert_eq!(code_hash.len(), HASH_LEN);
    let mut key = Vec::with_capacity(1 + HASH_LEN);
    key.push(CODE_PREFIX);
    key.extend_from_slice(code_hash);
    key
}

/// Returns the code hash if the key is a contract code key.
#[must_use]
pub fn as_code_key(key: &[u8]) -> Option<&[u8]> {
    if key.len() == 1 + HASH_LEN && key[0] == CODE_PREFIX {
        Some(&key[1..])
    } else {
        None
    }
}

/// Builds the key of a root-to-state-id lookup.
#[must_use]
pub fn state_id_key(root: &[u8]) -> Vec<u8> {
    debug_assert_eq!(root.len(), HASH_LEN);
    let mut key = Vec::with_capacity(1 + HASH_LEN);
    key.push(STATE_ID_PREFIX);
    key.extend_from_slice(root);
    key
}

/// Reads an account-trie node blob; `None` if absent.
pub fn read_account_trie_node(db: &dyn KeyValueReader, path: &[u8]) -> Result<Option<Vec<u8>>> {
    db.get(&account_trie_node_key(path))
}

/// Writes an account-trie node blob.
pub fn write_account_trie_node(db: &dyn KeyValueWriter, path: &[u8], blob: &[u8]) -> Result<()> {
    db.put(&account_trie_node_key(path), blob)
}

/// Deletes an account-trie node.
pub fn delete_account_trie_node(db: &dyn KeyValueDeleter, path: &[u8]) -> Result<()> {
    db.delete(&account_trie_node_key(path))
}

/// Reads a storage-trie node blob; `None` if absent.
pub fn read_storage_trie_node(
    db: &dyn KeyValueReader,
    owner: &[u8],
    path: &[u8],
) -> Result<Option<Vec<u8>>> {
    db.get(&storage_trie_node_key(owner, path))
}

/// Writes a storage-trie node blob.
pub fn write_storage_trie_node(
    db: &dyn KeyValueWriter,
    owner: &[u8],
    path: &[u8],
    blob: &[u8],
) -> Result<()> {
    db.put(&storage_trie_node_key(owner, path), blob)
}

/// Deletes a storage-trie node.
pub fn delete_storage_trie_node(db: &dyn KeyValueDeleter, owner: &[u8], path: &[u8]) -> Result<()> {
    db.delete(&storage_trie_node_key(owner, path))
}

/// Reads a flat snapshot account row; `None` if absent.
pub fn read_account_snapshot(
    db: &dyn KeyValueReader,
    account_hash: &[u8],
) -> Result<Option<Vec<u8>>> {
    db.get(&account_snapshot_key(account_hash))
}

/// Writes a flat snapshot account row.
pub fn write_account_snapshot(
    db: &dyn KeyValueWriter,
    account_hash: &[u8],
    blob: &[u8],
) -> Result<()> {
    db.put(&account_snapshot_key(account_hash), blob)
}

/// Deletes a flat snapshot account row.
pub fn delete_account_snapshot(db: &dyn KeyValueDeleter, account_hash: &[u8]) -> Result<()> {
    db.delete(&account_snapshot_key(account_hash))
}

/// Reads a flat snapshot storage row; `None` if absent.
pub fn read_storage_snapshot(
    db: &dyn KeyValueReader,
    account_hash: &[u8],
    slot_hash: &[u8],
) -> Result<Option<Vec<u8>>> {
    db.get(&storage_snapshot_key(account_hash, slot_hash))
}

/// Writes a flat snapshot storage row.
pub fn write_storage_snapshot(
    db: &dyn KeyValueWriter,
    account_hash: &[u8],
    slot_hash: &[u8],
    blob: &[u8],
) -> Result<()> {
    db.put(&storage_snapshot_key(account_hash, slot_hash), blob)
}

/// Deletes a flat snapshot storage row.
pub fn delete_storage_snapshot(
    db: &dyn KeyValueDeleter,
    account_hash: &[u8],
    slot_hash: &[u8],
) -> Result<()> {
    db.delete(&storage_snapshot_key(account_hash, slot_hash))
}

/// Reads a contract code blob; `None` if absent.
pub fn read_code(db: &dyn KeyValueReader, code_hash: &[u8]) -> Result<Option<Vec<u8>>> {
    db.get(&code_key(code_hash))
}

/// Writes a contract code blob.
pub fn write_code(db: &dyn KeyValueWriter, code_hash: &[u8], code: &[u8]) -> Result<()> {
    db.put(&code_key(code_hash), code)
}

/// Returns whether a contract code blob is present.
pub fn has_code(db: &dyn KeyValueReader, code_hash: &[u8]) -> Result<bool> {
    db.has(&code_key(code_hash))
}

/// Reads the state id mapped to a root; `None` if unmapped.
pub fn read_state_id(db: &dyn KeyValueReader, root: &[u8]) -> Result<Option<u64>> {
    Ok(db.get(&state_id_key(root))?.map(|blob| decode_u64(&blob)))
}

/// Maps a root to a state id.
pub fn write_state_id(db: &dyn KeyValueWriter, root: &[u8], id: u64) -> Result<()> {
    db.put(&state_id_key(root), &id.to_be_bytes())
}

/// Removes the state-id mapping of a root.
pub fn delete_state_id(db: &dyn KeyValueDeleter, root: &[u8]) -> Result<()> {
    db.delete(&state_id_key(root))
}

/// Reads the persisted state id; zero if never written.
pub fn read_persistent_state_id(db: &dyn KeyValueReader) -> Result<u64> {
    Ok(db
        .get(PERSISTENT_STATE_ID_KEY)?
        .map_or(0, |blob| decode_u64(&blob)))
}

/// Writes the persisted state id.
pub fn write_persistent_state_id(db: &dyn KeyValueWriter, id: u64) -> Result<()> {
    db.put(PERSISTENT_STATE_ID_KEY, &id.to_be_bytes())
}

/// Reads the root of the persisted flat snapshot; `None` if absent.
pub fn read_snapshot_root(db: &dyn KeyValueReader) -> Result<Option<Vec<u8>>> {
    db.get(SNAPSHOT_ROOT_KEY)
}

/// Writes the root of the persisted flat snapshot.
pub fn write_snapshot_root(db: &dyn KeyValueWriter, root: &[u8]) -> Result<()> {
    db.put(SNAPSHOT_ROOT_KEY, root)
}

/// Deletes the snapshot root, invalidating the flat snapshot.
pub fn delete_snapshot_root(db: &dyn KeyValueDeleter) -> Result<()> {
    db.delete(SNAPSHOT_ROOT_KEY)
}

/// Reads the generator progress marker. `None` means the snapshot is
/// fully generated; an empty marker means generation has not started.
pub fn read_snapshot_progress(db: &dyn KeyValueReader) -> Result<Option<Vec<u8>>> {
    db.get(SNAPSHOT_PROGRESS_KEY)
}

/// Writes the generator progress marker.
pub fn write_snapshot_progress(db: &dyn KeyValueWriter, marker: &[u8]) -> Result<()> {
    db.put(SNAPSHOT_PROGRESS_KEY, marker)
}

/// Deletes the generator progress marker, marking the snapshot complete.
pub fn delete_snapshot_progress(db: &dyn KeyValueDeleter) -> Result<()> {
    db.delete(SNAPSHOT_PROGRESS_KEY)
}

/// Reads the serialized layer journal; `None` if absent.
pub fn read_journal(db: &dyn KeyValueReader) -> Result<Option<Vec<u8>>> {
    db.get(JOURNAL_KEY)
}

/// Writes the serialized layer journal.
pub fn write_journal(db: &dyn KeyValueWriter, journal: &[u8]) -> Result<()> {
    db.put(JOURNAL_KEY, journal)
}

/// Deletes the layer journal.
pub fn delete_journal(db: &dyn KeyValueDeleter) -> Result<()> {
    db.delete(JOURNAL_KEY)
}

/// Reads the genesis state root; `None` if the store is uninitialized.
pub fn read_genesis_root(db: &dyn KeyValueReader) -> Result<Option<Vec<u8>>> {
    db.get(GENESIS_ROOT_KEY)
}

/// Writes the genesis state root.
pub fn write_genesis_root(db: &dyn KeyValueWriter, root: &[u8]) -> Result<()> {
    db.put(GENESIS_ROOT_KEY, root)
}

fn decode_u64(blob: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = blob.len().min(8);
    buf[8 - len..].copy_from_slice(&blob[..len]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemDb;

    #[test]
    fn test_key_layout() {
        let owner = [7u8; 32];
        assert_eq!(account_trie_node_key(b"xy"), b"Axy");
        let key = storage_trie_node_key(&owner, b"z");
        assert_eq!(key[0], STORAGE_TRIE_PREFIX);
        assert_eq!(&key[1..33], &owner);
        assert_eq!(&key[33..], b"z");

        let code = code_key(&owner);
        assert_eq!(as_code_key(&code), Some(&owner[..]));
        assert_eq!(as_code_key(b"c1234"), None);
        assert_eq!(as_code_key(&owner), None);
    }

    #[test]
    fn test_state_id_roundtrip() {
        let db = MemDb::new();
        let root = [3u8; 32];

        assert_eq!(read_state_id(&db, &root).unwrap(), None);
        write_state_id(&db, &root, 42).unwrap();
        assert_eq!(read_state_id(&db, &root).unwrap(), Some(42));
        delete_state_id(&db, &root).unwrap();
        assert_eq!(read_state_id(&db, &root).unwrap(), None);

        assert_eq!(read_persistent_state_id(&db).unwrap(), 0);
        write_persistent_state_id(&db, 7).unwrap();
        assert_eq!(read_persistent_state_id(&db).unwrap(), 7);
    }

    #[test]
    fn test_snapshot_rows() {
        let db = MemDb::new();
        let acct = [1u8; 32];
        let slot = [2u8; 32];

        write_account_snapshot(&db, &acct, b"acct").unwrap();
        write_storage_snapshot(&db, &acct, &slot, b"slot").unwrap();
        assert_eq!(
            read_account_snapshot(&db, &acct).unwrap(),
            Some(b"acct".to_vec())
        );
        assert_eq!(
            read_storage_snapshot(&db, &acct, &slot).unwrap(),
            Some(b"slot".to_vec())
        );

        delete_account_snapshot(&db, &acct).unwrap();
        delete_storage_snapshot(&db, &acct, &slot).unwrap();
        assert_eq!(read_account_snapshot(&db, &acct).unwrap(), None);
    }
}
