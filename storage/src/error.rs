// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Storage error types.

use thiserror::Error;

/// Errors that can occur during store and freezer operations.
#[derive(Debug, Error, Clone)]
pub enum DatabaseError {
    /// The store has been closed.
    #[error("database closed")]
    Closed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// The batch has already been written.
    #[error("batch already written")]
    BatchAlreadyWritten,

    /// A freezer append targeted an id other than the current head.
    #[error("appending unexpected item: want {want}, have {have}")]
    OutOfOrder {
        /// The id that must be appended next.
        want: u64,
        /// The id the caller tried to append.
        have: u64,
    },

    /// The requested freezer item is below the tail or at/above the head.
    #[error("out of bounds: item {id} not in [{tail}, {head})")]
    OutOfBounds {
        /// The requested item id.
        id: u64,
        /// The first retained item.
        tail: u64,
        /// One past the last stored item.
        head: u64,
    },

    /// A truncation target falls outside the retained item range.
    #[error("truncation out of range: tail {tail}, head {head}, target {target}")]
    TruncationOutOfRange {
        /// The first retained item.
        tail: u64,
        /// One past the last stored item.
        head: u64,
        /// The requested boundary.
        target: u64,
    },

    /// The freezer table is opened in read-only mode.
    #[error("freezer is read-only")]
    ReadOnly,

    /// On-disk corruption was detected.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for DatabaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
