// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The error taxonomy of the layered state database.

use crate::types::{Hash, StateId};
use strata_storage::DatabaseError;
use thiserror::Error;

/// Errors surfaced by the layered state database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Read or mutation on a layer that has been flattened across.
    #[error("layer is stale")]
    Stale,

    /// A stored or buffered node's hash disagrees with the demanded one.
    #[error(
        "unexpected node: want {expected:.8} got {got:.8}, owner {owner:.8}, path {}",
        hex::encode(path)
    )]
    UnexpectedNode {
        /// The hash the caller demanded.
        expected: Hash,
        /// The hash of the node actually found.
        got: Hash,
        /// The owning trie.
        owner: Hash,
        /// The node path inside the owning trie.
        path: Vec<u8>,
    },

    /// A referenced trie node is absent; fatal integrity failure.
    #[error("missing node, owner {owner:.8}, path {}", hex::encode(path))]
    MissingNode {
        /// The owning trie.
        owner: Hash,
        /// The node path inside the owning trie.
        path: Vec<u8>,
    },

    /// Referenced contract code is absent; fatal integrity failure.
    #[error("missing code {hash:.8}")]
    MissingCode {
        /// The code hash without a stored blob.
        hash: Hash,
    },

    /// A freezer history record failed its structural checks.
    #[error("corrupted state history: {0}")]
    CorruptedHistory(String),

    /// Applying a history did not yield the expected pre-state root.
    #[error("revert mismatch: want {want:.8} got {got:.8}")]
    RevertMismatch {
        /// The recorded parent root.
        want: Hash,
        /// The root the revert actually produced.
        got: Hash,
    },

    /// Flat snapshot read beyond the generator's progress marker; the
    /// caller must retry through the trie.
    #[error("state not covered by snapshot yet")]
    NotCoveredYet,

    /// The authenticated trie for a required root cannot be opened.
    #[error("missing trie {root:.8}")]
    MissingTrie {
        /// The unopenable root.
        root: Hash,
    },

    /// The snapshot generator received a stop signal. A status, not a
    /// failure.
    #[error("generation aborted")]
    Aborted,

    /// Revert requested past state id zero or with an empty history
    /// freezer.
    #[error("state {id} is unrecoverable")]
    StateUnrecoverable {
        /// The state id that cannot be reverted.
        id: StateId,
    },

    /// The buffer's layer count does not line up with the persisted
    /// state id; flushing would corrupt the store.
    #[error("state id out of sync: disk {disk}, buffered layers {layers}, target {target}")]
    StateIdMismatch {
        /// The persisted state id in the store.
        disk: StateId,
        /// The number of transitions aggregated in the buffer.
        layers: u64,
        /// The id the flush tried to persist.
        target: StateId,
    },

    /// The journal's disk root does not match the persistent trie root;
    /// the journal is discarded.
    #[error("unmatched journal: want {want:.8} got {got:.8}")]
    UnmatchedJournal {
        /// The on-disk account-trie root.
        want: Hash,
        /// The root recorded in the journal.
        got: Hash,
    },

    /// A range proof failed verification, or a proof input was
    /// malformed.
    #[error("invalid range proof: {0}")]
    InvalidProof(String),

    /// The layer journal is structurally invalid.
    #[error("invalid journal: {0}")]
    InvalidJournal(String),

    /// The supplied history does not belong to the layer being
    /// reverted.
    #[error("unexpected state history")]
    UnexpectedHistory,

    /// A layer update naming itself as its own parent.
    #[error("cannot create layer cycle at {root:.8}")]
    LayerCycle {
        /// The offending root.
        root: Hash,
    },

    /// The requested layer root is not present in the layer tree.
    #[error("layer {root:.8} not found")]
    LayerNotFound {
        /// The requested root.
        root: Hash,
    },

    /// The requested state history is not stored.
    #[error("state history {id} not found")]
    HistoryNotFound {
        /// The requested history id.
        id: u64,
    },

    /// The database was opened without a history freezer.
    #[error("state history is disabled")]
    HistoryDisabled,

    /// The database is in read-only mode.
    #[error("database is read-only")]
    ReadOnly,

    /// A decoding failure in a trusted on-disk structure.
    #[error("decode failure: {0}")]
    Decode(#[from] rlp::DecoderError),

    /// An underlying store or freezer failure.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result alias for database operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
