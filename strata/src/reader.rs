// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The multi-source state read façade.
//!
//! Reads consult the flat snapshot (through the layer stack) first and
//! fall back to the authenticated trie when generation has not covered
//! the requested key yet. Slim snapshot encodings are normalized to
//! complete account bodies before they leave this module.

use std::sync::Arc;

use bytes::Bytes;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::trie::{NodeSource, Trie, TrieLoader};
use crate::types::Hash;

/// A read-only view of one state, identified by its root.
pub struct StateReader {
    layer: Layer,
    loader: Arc<dyn TrieLoader>,
}

impl StateReader {
    pub(crate) fn new(layer: Layer, loader: Arc<dyn TrieLoader>) -> Self {
        StateReader { layer, loader }
    }

    /// The state root this reader is anchored to.
    pub fn root(&self) -> Hash {
        self.layer.root()
    }

    /// Reads an account body; `None` if the account does not exist.
    pub fn account(&self, account_hash: &Hash) -> Result<Option<Account>> {
        match self.layer.account(account_hash) {
            Ok(Some(blob)) => {
                if blob.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Account::decode_slim(&blob)?))
            }
            Ok(None) => Ok(None),
            Err(Error::NotCoveredYet) => self.account_from_trie(account_hash),
            Err(err) => Err(err),
        }
    }

    /// Reads a storage slot value; `None` if the slot is unset.
    pub fn storage(&self, account_hash: &Hash, slot_hash: &Hash) -> Result<Option<Bytes>> {
        match self.layer.storage(account_hash, slot_hash) {
            Ok(Some(blob)) => {
                if blob.is_empty() {
                    return Ok(None);
                }
                Ok(Some(blob))
            }
            Ok(None) => Ok(None),
            Err(Error::NotCoveredYet) => self.storage_from_trie(account_hash, slot_hash),
            Err(err) => Err(err),
        }
    }

    fn account_from_trie(&self, account_hash: &Hash) -> Result<Option<Account>> {
        let trie = self.loader.open(&self.layer.root(), &self.layer)?;
        match trie.get(account_hash.as_ref())? {
            Some(blob) => Ok(Some(Account::decode_full(&blob)?)),
            None => Ok(None),
        }
    }

    fn storage_from_trie(&self, account_hash: &Hash, slot_hash: &Hash) -> Result<Option<Bytes>> {
        let Some(account) = self.account(account_hash)? else {
            return Ok(None);
        };
        if !account.has_storage() {
            return Ok(None);
        }
        let trie = self
            .loader
            .open_storage(account_hash, &account.root, &self.layer)?;
        Ok(trie.get(slot_hash.as_ref())?.map(Bytes::from))
    }
}

impl NodeSource for StateReader {
    fn node(&self, owner: &Hash, path: &[u8], expected: Option<&Hash>) -> Result<Bytes> {
        self.layer.node(owner, path, expected)
    }
}

impl std::fmt::Debug for StateReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReader")
            .field("root", &format_args!("{:.8}", self.root()))
            .finish()
    }
}
