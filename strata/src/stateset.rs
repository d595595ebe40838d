// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Flat state mutations carried by a diff layer.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;

use crate::types::Hash;

/// The flat (post-transition) state values of one state transition.
///
/// Absence of a key means the transition did not touch that entry; an
/// empty value means the entry was deleted by the transition.
#[derive(Clone, Default)]
pub struct StateSet {
    /// Account hash → slim account blob.
    pub accounts: HashMap<Hash, Bytes>,
    /// Account hash → slot hash → slot value.
    pub storages: HashMap<Hash, HashMap<Hash, Bytes>>,
    /// Accounts whose storage mutation set is incomplete because a bulk
    /// contract destruction elided individual slots. Such transitions can
    /// only be rolled forward, never reverted.
    pub incomplete: BTreeSet<Hash>,
}

impl StateSet {
    /// Creates an empty state set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the mutated account blob. The outer `Option` is the
    /// "was it touched" indicator; an empty blob means deleted.
    #[must_use]
    pub fn account(&self, account_hash: &Hash) -> Option<&Bytes> {
        self.accounts.get(account_hash)
    }

    /// Looks up a mutated storage slot value.
    #[must_use]
    pub fn storage(&self, account_hash: &Hash, slot_hash: &Hash) -> Option<&Bytes> {
        self.storages.get(account_hash)?.get(slot_hash)
    }

    /// Checks the structural invariant: every incomplete account must
    /// appear in the storage map.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.incomplete
            .iter()
            .all(|account| self.storages.contains_key(account))
    }

    /// Approximate payload size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        let accounts: u64 = self
            .accounts
            .values()
            .map(|blob| (32 + blob.len()) as u64)
            .sum();
        let storages: u64 = self
            .storages
            .values()
            .flat_map(|slots| slots.values())
            .map(|blob| (64 + blob.len()) as u64)
            .sum();
        accounts + storages
    }

    /// Merges another state set into this one, later writes winning.
    pub fn merge(&mut self, other: &StateSet) {
        for (account, blob) in &other.accounts {
            self.accounts.insert(*account, blob.clone());
        }
        for (account, slots) in &other.storages {
            let current = self.storages.entry(*account).or_default();
            for (slot, value) in slots {
                current.insert(*slot, value.clone());
            }
        }
        self.incomplete.extend(other.incomplete.iter().copied());
    }

    /// Drops everything.
    pub fn reset(&mut self) {
        self.accounts.clear();
        self.storages.clear();
        self.incomplete.clear();
    }
}

impl std::fmt::Debug for StateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSet")
            .field("accounts", &self.accounts.len())
            .field("storages", &self.storages.len())
            .field("incomplete", &self.incomplete.len())
            .finish()
    }
}

/// A [StateSet] paired with the pre-transition images of everything it
/// mutated. The origin maps feed the state history; the flat set serves
/// reads.
#[derive(Clone, Default, Debug)]
pub struct StateSetWithOrigin {
    /// Post-transition flat values.
    pub state: StateSet,
    /// Account hash → pre-transition account blob (empty = did not
    /// exist).
    pub account_origin: HashMap<Hash, Bytes>,
    /// Account hash → slot hash → pre-transition value (empty = did not
    /// exist).
    pub storage_origin: HashMap<Hash, HashMap<Hash, Bytes>>,
}

impl StateSetWithOrigin {
    /// Pairs flat values with their pre-images.
    #[must_use]
    pub fn new(
        state: StateSet,
        account_origin: HashMap<Hash, Bytes>,
        storage_origin: HashMap<Hash, HashMap<Hash, Bytes>>,
    ) -> Self {
        Self {
            state,
            account_origin,
            storage_origin,
        }
    }

    /// Approximate payload size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        let origin_accounts: u64 = self
            .account_origin
            .values()
            .map(|blob| (32 + blob.len()) as u64)
            .sum();
        let origin_storages: u64 = self
            .storage_origin
            .values()
            .flat_map(|slots| slots.values())
            .map(|blob| (64 + blob.len()) as u64)
            .sum();
        self.state.size() + origin_accounts + origin_storages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> Hash {
        Hash::from([n; 32])
    }

    #[test]
    fn test_lookup_semantics() {
        let mut set = StateSet::new();
        set.accounts.insert(hash(1), Bytes::from_static(b"acct"));
        set.accounts.insert(hash(2), Bytes::new());
        set.storages
            .entry(hash(1))
            .or_default()
            .insert(hash(9), Bytes::from_static(b"slot"));

        assert_eq!(set.account(&hash(1)).unwrap().as_ref(), b"acct");
        // deleted account: present but empty
        assert!(set.account(&hash(2)).unwrap().is_empty());
        // untouched account: absent
        assert!(set.account(&hash(3)).is_none());
        assert_eq!(set.storage(&hash(1), &hash(9)).unwrap().as_ref(), b"slot");
        assert!(set.storage(&hash(1), &hash(8)).is_none());
    }

    #[test]
    fn test_incomplete_invariant() {
        let mut set = StateSet::new();
        set.incomplete.insert(hash(7));
        assert!(!set.is_valid());
        set.storages.insert(hash(7), HashMap::new());
        assert!(set.is_valid());
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = StateSet::new();
        base.accounts.insert(hash(1), Bytes::from_static(b"old"));

        let mut next = StateSet::new();
        next.accounts.insert(hash(1), Bytes::from_static(b"new"));
        next.storages
            .entry(hash(1))
            .or_default()
            .insert(hash(2), Bytes::from_static(b"s"));

        base.merge(&next);
        assert_eq!(base.account(&hash(1)).unwrap().as_ref(), b"new");
        assert_eq!(base.storage(&hash(1), &hash(2)).unwrap().as_ref(), b"s");
    }
}
