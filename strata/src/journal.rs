// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The layer journal.
//!
//! On graceful shutdown the unflushed layer stack (the disk layer's
//! buffer plus every diff layer) is serialized into a single RLP blob in
//! the key-value store. On startup the blob is decoded back into a layer
//! chain, but only when its recorded disk root matches the persisted
//! account-trie root; any mismatch means a crash got between the journal
//! write and the trie flush, and the journal is discarded.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::RwLock;
use rlp::{Rlp, RlpStream};

use crate::buffer::NodeBuffer;
use crate::db::DbShared;
use crate::disklayer::DiskLayer;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::node::{Node, NodeSet};
use crate::stateset::{StateSet, StateSetWithOrigin};
use crate::types::{Hash, EMPTY_ROOT};
use strata_storage::schema;

const JOURNAL_VERSION: u64 = 0;

/// Reconstructs the layer stack from the persisted state, preferring the
/// journal and falling back to a bare disk layer.
pub(crate) fn load_layers(shared: &Arc<DbShared>) -> Result<Layer> {
    // the root of the persisted account trie anchors everything
    let root = match schema::read_account_trie_node(shared.store.as_ref(), &[])? {
        Some(blob) if !blob.is_empty() => Hash::of(&blob),
        _ => *EMPTY_ROOT,
    };
    match load_journal(shared, root) {
        Ok(Some(head)) => {
            debug!(
                "Loaded layer journal, disk root: {root:.8}, head: {:.8}",
                head.root()
            );
            return Ok(head);
        }
        Ok(None) => {
            // a missing journal is normal for a fresh store only
            if root != *EMPTY_ROOT {
                warn!("Journal not found on non-empty state, root: {root:.8}");
            }
        }
        Err(err) => {
            info!("Failed to load journal, discard it, err: {err}");
        }
    }
    let id = schema::read_persistent_state_id(shared.store.as_ref())?;
    let buffer = NodeBuffer::new(
        shared.config.buffer_limit,
        NodeSet::new(),
        StateSet::new(),
        0,
    );
    Ok(Layer::Disk(DiskLayer::new(
        root,
        id,
        shared.clone(),
        Arc::new(RwLock::new(buffer)),
    )))
}

/// Parses the layer journal. `Ok(None)` means no journal is stored.
fn load_journal(shared: &Arc<DbShared>, disk_root: Hash) -> Result<Option<Layer>> {
    let Some(blob) = schema::read_journal(shared.store.as_ref())? else {
        return Ok(None);
    };
    let rlp = Rlp::new(&blob);
    let version: u64 = rlp.val_at(0)?;
    if version != JOURNAL_VERSION {
        return Err(Error::InvalidJournal(format!(
            "want version {JOURNAL_VERSION}, got {version}"
        )));
    }
    let recorded: Vec<u8> = rlp.val_at(1)?;
    let recorded = Hash::try_from(recorded.as_slice())
        .map_err(|_| Error::InvalidJournal("malformed disk root".to_string()))?;
    if recorded != disk_root {
        return Err(Error::UnmatchedJournal {
            want: disk_root,
            got: recorded,
        });
    }
    let id: u64 = rlp.val_at(2)?;
    let stored = schema::read_persistent_state_id(shared.store.as_ref())?;
    if stored > id {
        return Err(Error::InvalidJournal(format!(
            "disk id {id} below persisted id {stored}"
        )));
    }
    let nodes = decode_nodes(&rlp.at(3)?)?;
    let states = decode_state_set(&rlp.at(4)?)?;
    let buffer = NodeBuffer::new(shared.config.buffer_limit, nodes, states, id - stored);
    let mut head = Layer::Disk(DiskLayer::new(
        recorded,
        id,
        shared.clone(),
        Arc::new(RwLock::new(buffer)),
    ));

    for item in rlp.at(5)?.iter() {
        let root: Vec<u8> = item.val_at(0)?;
        let root = Hash::try_from(root.as_slice())
            .map_err(|_| Error::InvalidJournal("malformed diff root".to_string()))?;
        let block: u64 = item.val_at(1)?;
        let nodes = decode_nodes(&item.at(2)?)?;
        let states = decode_state_set_with_origin(&item.at(3)?)?;
        let id = head.state_id() + 1;
        head = Layer::Diff(head.update(root, id, block, nodes, states));
    }
    Ok(Some(head))
}

/// Serializes the layer chain ending at `head` into a journal blob.
pub(crate) fn encode_journal(head: &Layer) -> Result<Vec<u8>> {
    // collect the chain top-down, then emit bottom-up
    let mut diffs = Vec::new();
    let mut cursor = head.clone();
    let disk = loop {
        match cursor {
            Layer::Diff(diff) => {
                cursor = diff.parent();
                diffs.push(diff);
            }
            Layer::Disk(disk) => break disk,
        }
    };
    if disk.is_stale() {
        return Err(Error::Stale);
    }
    let mut stream = RlpStream::new_list(6);
    stream.append(&JOURNAL_VERSION);
    stream.append(&disk.root().as_ref());
    stream.append(&disk.id());
    {
        let buffer = disk.buffer().read();
        encode_nodes(&mut stream, buffer.nodes());
        encode_state_set(&mut stream, buffer.states());
    }
    stream.begin_list(diffs.len());
    for diff in diffs.iter().rev() {
        stream.begin_list(4);
        stream.append(&diff.root().as_ref());
        stream.append(&diff.block());
        encode_nodes(&mut stream, diff.nodes());
        encode_state_set_with_origin(&mut stream, diff.states());
    }
    Ok(stream.out().to_vec())
}

fn encode_nodes(stream: &mut RlpStream, nodes: &NodeSet) {
    let sorted = nodes.sorted();
    stream.begin_list(sorted.len());
    for (owner, paths) in sorted {
        stream.begin_list(2);
        stream.append(&owner.as_ref());
        stream.begin_list(paths.len());
        for (path, node) in paths {
            stream.begin_list(2);
            stream.append(&path.as_slice());
            stream.append(&node.blob.as_ref());
        }
    }
}

fn decode_nodes(rlp: &Rlp<'_>) -> Result<NodeSet> {
    let mut nodes = NodeSet::new();
    for entry in rlp.iter() {
        let owner: Vec<u8> = entry.val_at(0)?;
        let owner = Hash::try_from(owner.as_slice())
            .map_err(|_| Error::InvalidJournal("malformed node owner".to_string()))?;
        for item in entry.at(1)?.iter() {
            let path: Vec<u8> = item.val_at(0)?;
            let blob: Vec<u8> = item.val_at(1)?;
            let node = if blob.is_empty() {
                Node::deleted()
            } else {
                Node::from_blob(Bytes::from(blob))
            };
            nodes.insert(owner, path, node);
        }
    }
    Ok(nodes)
}

fn encode_state_set(stream: &mut RlpStream, states: &StateSet) {
    let mut accounts: Vec<_> = states.accounts.iter().collect();
    accounts.sort_by_key(|(hash, _)| **hash);
    let mut storages: Vec<_> = states.storages.iter().collect();
    storages.sort_by_key(|(hash, _)| **hash);

    stream.begin_list(2);
    stream.begin_list(accounts.len());
    for (hash, blob) in accounts {
        stream.begin_list(2);
        stream.append(&hash.as_ref());
        stream.append(&blob.as_ref());
    }
    stream.begin_list(storages.len());
    for (owner, slots) in storages {
        let mut slots: Vec<_> = slots.iter().collect();
        slots.sort_by_key(|(hash, _)| **hash);
        stream.begin_list(3);
        stream.append(&owner.as_ref());
        stream.append(&states.incomplete.contains(owner));
        stream.begin_list(slots.len());
        for (slot, value) in slots {
            stream.begin_list(2);
            stream.append(&slot.as_ref());
            stream.append(&value.as_ref());
        }
    }
}

fn decode_state_set(rlp: &Rlp<'_>) -> Result<StateSet> {
    let mut states = StateSet::new();
    for item in rlp.at(0)?.iter() {
        let hash: Vec<u8> = item.val_at(0)?;
        let hash = Hash::try_from(hash.as_slice())
            .map_err(|_| Error::InvalidJournal("malformed account hash".to_string()))?;
        let blob: Vec<u8> = item.val_at(1)?;
        states.accounts.insert(hash, Bytes::from(blob));
    }
    for item in rlp.at(1)?.iter() {
        let owner: Vec<u8> = item.val_at(0)?;
        let owner = Hash::try_from(owner.as_slice())
            .map_err(|_| Error::InvalidJournal("malformed storage owner".to_string()))?;
        let incomplete: bool = item.val_at(1)?;
        if incomplete {
            states.incomplete.insert(owner);
        }
        let slots = states.storages.entry(owner).or_default();
        for slot in item.at(2)?.iter() {
            let hash: Vec<u8> = slot.val_at(0)?;
            let hash = Hash::try_from(hash.as_slice())
                .map_err(|_| Error::InvalidJournal("malformed slot hash".to_string()))?;
            let value: Vec<u8> = slot.val_at(1)?;
            slots.insert(hash, Bytes::from(value));
        }
    }
    Ok(states)
}

fn encode_state_set_with_origin(stream: &mut RlpStream, states: &StateSetWithOrigin) {
    stream.begin_list(3);
    encode_state_set(stream, &states.state);

    let mut accounts: Vec<_> = states.account_origin.iter().collect();
    accounts.sort_by_key(|(hash, _)| **hash);
    stream.begin_list(accounts.len());
    for (hash, blob) in accounts {
        stream.begin_list(2);
        stream.append(&hash.as_ref());
        stream.append(&blob.as_ref());
    }

    let mut storages: Vec<_> = states.storage_origin.iter().collect();
    storages.sort_by_key(|(hash, _)| **hash);
    stream.begin_list(storages.len());
    for (owner, slots) in storages {
        let mut slots: Vec<_> = slots.iter().collect();
        slots.sort_by_key(|(hash, _)| **hash);
        stream.begin_list(2);
        stream.append(&owner.as_ref());
        stream.begin_list(slots.len());
        for (slot, value) in slots {
            stream.begin_list(2);
            stream.append(&slot.as_ref());
            stream.append(&value.as_ref());
        }
    }
}

fn decode_state_set_with_origin(rlp: &Rlp<'_>) -> Result<StateSetWithOrigin> {
    let state = decode_state_set(&rlp.at(0)?)?;
    let mut account_origin = std::collections::HashMap::new();
    for item in rlp.at(1)?.iter() {
        let hash: Vec<u8> = item.val_at(0)?;
        let hash = Hash::try_from(hash.as_slice())
            .map_err(|_| Error::InvalidJournal("malformed origin account".to_string()))?;
        let blob: Vec<u8> = item.val_at(1)?;
        account_origin.insert(hash, Bytes::from(blob));
    }
    let mut storage_origin = std::collections::HashMap::new();
    for item in rlp.at(2)?.iter() {
        let owner: Vec<u8> = item.val_at(0)?;
        let owner = Hash::try_from(owner.as_slice())
            .map_err(|_| Error::InvalidJournal("malformed origin owner".to_string()))?;
        let mut slots = std::collections::HashMap::new();
        for slot in item.at(1)?.iter() {
            let hash: Vec<u8> = slot.val_at(0)?;
            let hash = Hash::try_from(hash.as_slice())
                .map_err(|_| Error::InvalidJournal("malformed origin slot".to_string()))?;
            let value: Vec<u8> = slot.val_at(1)?;
            slots.insert(hash, Bytes::from(value));
        }
        storage_origin.insert(owner, slots);
    }
    Ok(StateSetWithOrigin::new(state, account_origin, storage_origin))
}
