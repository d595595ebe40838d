// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.
#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]
#![forbid(unsafe_code)]

//! # Storage primitives for the strata state store
//!
//! This crate provides the key-value abstraction the layered state
//! database is built on, together with the append-only [Freezer] used
//! for state histories and the shared [CleanCache] of trie nodes.
//!
//! - [MemDb]: in-memory key-value store backed by a `BTreeMap`
//! - [Freezer]: ordered multi-table append-only log indexed by a
//!   monotonic id
//! - [CleanCache]: LRU cache of clean trie nodes shared across
//!   successive disk layers
//! - [schema]: the on-disk key layout and typed accessors
//!
//! # Example
//!
//! ```
//! use strata_storage::{KeyValueReader, KeyValueWriter, MemDb};
//!
//! let db = MemDb::new();
//! db.put(b"key", b"value").unwrap();
//! assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

mod cache;
mod error;
mod filedb;
mod freezer;
mod memdb;
pub mod schema;

pub use cache::CleanCache;
pub use error::{DatabaseError, Result};
pub use filedb::FileDb;
pub use freezer::{Freezer, FreezerTable};
pub use memdb::MemDb;

/// The preferred number of payload bytes to accumulate in a batch before
/// writing it out. Batches may grow past this; it is a flush hint, not a
/// hard cap.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// A key-value reader.
pub trait KeyValueReader: Send + Sync {
    /// Returns whether the key exists in the store.
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Gets the value for the given key.
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// A key-value writer.
pub trait KeyValueWriter: Send + Sync {
    /// Sets the value for the given key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// A key-value deleter.
pub trait KeyValueDeleter: Send + Sync {
    /// Deletes the value for the given key.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Combined writer/deleter interface, the target of batch replays.
pub trait KeyValueWriterDeleter: KeyValueWriter + KeyValueDeleter {}

impl<T> KeyValueWriterDeleter for T where T: KeyValueWriter + KeyValueDeleter {}

/// Iterator creation interface.
pub trait Iteratee: Send + Sync {
    /// Creates an iterator over keys carrying the given prefix,
    /// positioned at the first key greater than or equal to
    /// `prefix ‖ start`. An empty prefix and an empty start iterate the
    /// whole store.
    fn iter(&self, prefix: &[u8], start: &[u8]) -> Box<dyn DbIterator>;
}

/// Batch creation interface.
pub trait Batcher: Send + Sync {
    /// Creates a new batch for atomic writes.
    fn new_batch(&self) -> Box<dyn Batch>;

    /// Creates a new batch with a pre-allocation hint in bytes.
    fn new_batch_with_size(&self, size: usize) -> Box<dyn Batch> {
        let _ = size;
        self.new_batch()
    }
}

/// Compaction interface.
pub trait Compacter: Send + Sync {
    /// Compacts the underlying storage for the given key range. A no-op
    /// for stores without a compaction concept.
    fn compact(&self, start: &[u8], limit: &[u8]) -> Result<()>;
}

/// The key-value store interface the state database is generic over.
pub trait Store:
    KeyValueReader + KeyValueWriter + KeyValueDeleter + Batcher + Iteratee + Compacter
{
    /// Flushes any OS-buffered writes to durable storage.
    fn sync(&self) -> Result<()>;
}

/// A batch of write operations to be applied atomically: a crash either
/// applies the whole batch or none of it.
pub trait Batch: KeyValueWriter + KeyValueDeleter + Send + Sync {
    /// Returns the number of payload bytes queued in the batch.
    fn value_size(&self) -> usize;

    /// Writes the batch to the store.
    fn write(&mut self) -> Result<()>;

    /// Resets the batch for reuse.
    fn reset(&mut self);

    /// Replays the batch operations to another writer.
    fn replay(&self, writer: &dyn KeyValueWriterDeleter) -> Result<()>;
}

/// An iterator over key-value pairs in ascending key order.
pub trait DbIterator: Send {
    /// Moves to the next key-value pair.
    /// Returns `false` when there are no more pairs.
    fn next(&mut self) -> bool;

    /// Returns any accumulated error.
    fn error(&self) -> Option<&DatabaseError>;

    /// Returns the current key.
    /// Only valid after `next()` returns `true`.
    fn key(&self) -> &[u8];

    /// Returns the current value.
    /// Only valid after `next()` returns `true`.
    fn value(&self) -> &[u8];

    /// Releases resources held by the iterator.
    fn release(&mut self);
}
