// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Core identity types.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::LazyLock;

use sha2::{Digest, Sha256};

/// A monotonically increasing state transition number. Zero denotes the
/// genesis-aligned persistent layer.
pub type StateId = u64;

/// A 32-byte opaque identity: state roots, node hashes, account and slot
/// hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; 32]);

/// Length in bytes of a [Hash].
pub const HASH_LEN: usize = 32;

impl Hash {
    /// The all-zero hash, used as the account-trie owner and the deleted
    /// node sentinel.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hashes arbitrary data into its 32-byte identity.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }

    /// Returns whether this is the all-zero hash.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = &'static str;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() == HASH_LEN {
            let mut hash = Hash::default();
            hash.0.copy_from_slice(value);
            Ok(hash)
        } else {
            Err("invalid hash length")
        }
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let width = f.precision().unwrap_or(64);
        write!(f, "{:.*}", width, hex::encode(self.0))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let width = f.precision().unwrap_or(64);
        write!(f, "{:.*}", width, hex::encode(self.0))
    }
}

/// The root hash of an empty trie.
pub static EMPTY_ROOT: LazyLock<Hash> = LazyLock::new(|| {
    let empty_list = rlp::RlpStream::new_list(0).out();
    Hash::of(&empty_list)
});

/// The hash of empty contract code.
pub static EMPTY_CODE_HASH: LazyLock<Hash> = LazyLock::new(|| Hash::of(&[]));

/// Advances a key to its lexicographic successor of the same length,
/// carrying into higher bytes. Returns `None` when the key space is
/// exhausted (the key was all `0xff`).
#[must_use]
pub fn increase_key(key: &[u8]) -> Option<Vec<u8>> {
    let mut next = key.to_vec();
    for byte in next.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return Some(next);
        }
    }
    None
}
