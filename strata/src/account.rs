// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Account bodies and their two on-disk encodings.
//!
//! The trie stores the full form; the flat snapshot stores the slim form
//! in which an empty storage root and an empty code hash are elided.

use primitive_types::U256;
use rlp::{DecoderError, Rlp, RlpStream};

use crate::types::{Hash, EMPTY_CODE_HASH, EMPTY_ROOT};

/// The state body of an account.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    /// Transaction counter.
    pub nonce: u64,
    /// Native token balance.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub root: Hash,
    /// Hash of the account's contract code.
    pub code_hash: Hash,
}

impl Default for Account {
    fn default() -> Self {
        Account {
            nonce: 0,
            balance: U256::zero(),
            root: *EMPTY_ROOT,
            code_hash: *EMPTY_CODE_HASH,
        }
    }
}

impl Account {
    /// Returns whether the account carries a storage trie.
    #[must_use]
    pub fn has_storage(&self) -> bool {
        self.root != *EMPTY_ROOT
    }

    /// Returns whether the account carries contract code.
    #[must_use]
    pub fn has_code(&self) -> bool {
        self.code_hash != *EMPTY_CODE_HASH
    }

    /// Encodes the full form stored in the account trie.
    #[must_use]
    pub fn encode_full(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(4);
        stream
            .append(&self.nonce)
            .append(&self.balance)
            .append(&self.root.as_ref())
            .append(&self.code_hash.as_ref());
        stream.out().to_vec()
    }

    /// Decodes the full form.
    pub fn decode_full(blob: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(blob);
        let root: Vec<u8> = rlp.val_at(2)?;
        let code_hash: Vec<u8> = rlp.val_at(3)?;
        Ok(Account {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            root: Hash::try_from(root.as_slice())
                .map_err(|_| DecoderError::Custom("bad root length"))?,
            code_hash: Hash::try_from(code_hash.as_slice())
                .map_err(|_| DecoderError::Custom("bad code hash length"))?,
        })
    }

    /// Encodes the slim form stored in the flat snapshot: the empty
    /// storage root and the empty code hash become zero-length strings.
    #[must_use]
    pub fn encode_slim(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(4);
        stream.append(&self.nonce).append(&self.balance);
        if self.has_storage() {
            stream.append(&self.root.as_ref());
        } else {
            stream.append_empty_data();
        }
        if self.has_code() {
            stream.append(&self.code_hash.as_ref());
        } else {
            stream.append_empty_data();
        }
        stream.out().to_vec()
    }

    /// Decodes the slim form, restoring the elided sentinels so the
    /// result is a complete account body.
    pub fn decode_slim(blob: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(blob);
        let root: Vec<u8> = rlp.val_at(2)?;
        let code_hash: Vec<u8> = rlp.val_at(3)?;
        let root = if root.is_empty() {
            *EMPTY_ROOT
        } else {
            Hash::try_from(root.as_slice()).map_err(|_| DecoderError::Custom("bad root length"))?
        };
        let code_hash = if code_hash.is_empty() {
            *EMPTY_CODE_HASH
        } else {
            Hash::try_from(code_hash.as_slice())
                .map_err(|_| DecoderError::Custom("bad code hash length"))?
        };
        Ok(Account {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            root,
            code_hash,
        })
    }

    /// Re-encodes a full trie blob into the slim snapshot form.
    pub fn full_to_slim(blob: &[u8]) -> Result<Vec<u8>, DecoderError> {
        Ok(Self::decode_full(blob)?.encode_slim())
    }

    /// Re-encodes a slim snapshot blob into the full trie form.
    pub fn slim_to_full(blob: &[u8]) -> Result<Vec<u8>, DecoderError> {
        Ok(Self::decode_slim(blob)?.encode_full())
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "<Account balance={} nonce={} code_hash={:.8} root={:.8}>",
            self.balance, self.nonce, self.code_hash, self.root
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_roundtrip() {
        let account = Account {
            nonce: 9,
            balance: U256::from(1_000_000u64),
            root: Hash::from([3u8; 32]),
            code_hash: Hash::from([4u8; 32]),
        };
        let blob = account.encode_full();
        assert_eq!(Account::decode_full(&blob).unwrap(), account);
    }

    #[test]
    fn test_slim_elides_sentinels() {
        let plain = Account {
            nonce: 1,
            balance: U256::from(5u64),
            ..Default::default()
        };
        let slim = plain.encode_slim();
        let full = plain.encode_full();
        assert!(slim.len() < full.len());

        // the decoder restores the sentinels
        let decoded = Account::decode_slim(&slim).unwrap();
        assert_eq!(decoded, plain);
        assert!(!decoded.has_storage());
        assert!(!decoded.has_code());
    }

    #[test]
    fn test_slim_full_conversions() {
        let contract = Account {
            nonce: 2,
            balance: U256::from(7u64),
            root: Hash::from([8u8; 32]),
            code_hash: Hash::from([9u8; 32]),
        };
        let slim = contract.encode_slim();
        assert_eq!(Account::slim_to_full(&slim).unwrap(), contract.encode_full());
        assert_eq!(Account::full_to_slim(&contract.encode_full()).unwrap(), slim);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Account::decode_full(b"junk").is_err());
        assert!(Account::decode_slim(&[0x80]).is_err());
    }
}
