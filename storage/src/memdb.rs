// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! In-memory store implementation.
//!
//! A simple key-value store backed by a `BTreeMap`, primarily useful for
//! testing and for rehearsing pruning runs against a copied state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    Batch, Batcher, Compacter, DatabaseError, DbIterator, Iteratee, KeyValueDeleter,
    KeyValueReader, KeyValueWriter, KeyValueWriterDeleter, Result, Store,
};

type SharedMap = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// An in-memory key-value store.
///
/// Thread-safe via `RwLock`. All values are cloned on read/write.
#[derive(Debug, Default)]
pub struct MemDb {
    data: SharedMap,
    closed: Arc<AtomicBool>,
}

impl MemDb {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Marks the store closed; every subsequent operation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }
}

impl KeyValueReader for MemDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.check_closed()?;
        Ok(self.data.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_closed()?;
        Ok(self.data.read().get(key).cloned())
    }
}

impl KeyValueWriter for MemDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl KeyValueDeleter for MemDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().remove(key);
        Ok(())
    }
}

impl Batcher for MemDb {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(MemBatch::new(self.data.clone(), self.closed.clone()))
    }
}

impl Iteratee for MemDb {
    fn iter(&self, prefix: &[u8], start: &[u8]) -> Box<dyn DbIterator> {
        let data = self.data.read();
        let mut from = prefix.to_vec();
        from.extend_from_slice(start);
        let entries: Vec<(Vec<u8>, Vec<u8>)> = data
            .range(from..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(MemIterator::new(entries))
    }
}

impl Compacter for MemDb {
    fn compact(&self, _start: &[u8], _limit: &[u8]) -> Result<()> {
        self.check_closed()
    }
}

impl Store for MemDb {
    fn sync(&self) -> Result<()> {
        self.check_closed()
    }
}

/// A batch operation (put or delete).
#[derive(Debug, Clone)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A batch of operations for [MemDb].
///
/// Collects operations and applies them in one map-write when written.
#[derive(Debug)]
pub struct MemBatch {
    data: SharedMap,
    closed: Arc<AtomicBool>,
    ops: RwLock<Vec<BatchOp>>,
    size: RwLock<usize>,
    written: AtomicBool,
}

impl MemBatch {
    fn new(data: SharedMap, closed: Arc<AtomicBool>) -> Self {
        Self {
            data,
            closed,
            ops: RwLock::new(Vec::new()),
            size: RwLock::new(0),
            written: AtomicBool::new(false),
        }
    }
}

impl KeyValueWriter for MemBatch {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ops.write().push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        *self.size.write() += key.len() + value.len();
        Ok(())
    }
}

impl KeyValueDeleter for MemBatch {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.ops.write().push(BatchOp::Delete { key: key.to_vec() });
        *self.size.write() += key.len();
        Ok(())
    }
}

impl Batch for MemBatch {
    fn value_size(&self) -> usize {
        *self.size.read()
    }

    fn write(&mut self) -> Result<()> {
        if self.written.load(Ordering::Acquire) {
            return Err(DatabaseError::BatchAlreadyWritten);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        let ops = self.ops.read();
        let mut data = self.data.write();
        for op in ops.iter() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        self.written.store(true, Ordering::Release);
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.write().clear();
        *self.size.write() = 0;
        self.written.store(false, Ordering::Release);
    }

    fn replay(&self, writer: &dyn KeyValueWriterDeleter) -> Result<()> {
        for op in self.ops.read().iter() {
            match op {
                BatchOp::Put { key, value } => writer.put(key, value)?,
                BatchOp::Delete { key } => writer.delete(key)?,
            }
        }
        Ok(())
    }
}

/// An iterator over a point-in-time copy of [MemDb] entries.
pub struct MemIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    index: usize,
    started: bool,
}

impl MemIterator {
    fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            entries,
            index: 0,
            started: false,
        }
    }
}

impl std::fmt::Debug for MemIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemIterator")
            .field("len", &self.entries.len())
            .field("index", &self.index)
            .finish()
    }
}

impl DbIterator for MemIterator {
    fn next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            return !self.entries.is_empty();
        }
        self.index += 1;
        self.index < self.entries.len()
    }

    fn error(&self) -> Option<&DatabaseError> {
        None
    }

    fn key(&self) -> &[u8] {
        if self.started && self.index < self.entries.len() {
            &self.entries[self.index].0
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        if self.started && self.index < self.entries.len() {
            &self.entries[self.index].1
        } else {
            &[]
        }
    }

    fn release(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let db = MemDb::new();

        db.put(b"key1", b"value1").unwrap();
        db.put(b"key2", b"value2").unwrap();

        assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(db.get(b"key3").unwrap(), None);
        assert!(db.has(b"key2").unwrap());

        db.delete(b"key1").unwrap();
        assert!(!db.has(b"key1").unwrap());

        // deleting a missing key is fine
        db.delete(b"missing").unwrap();
    }

    #[test]
    fn test_close() {
        let db = MemDb::new();
        db.put(b"key", b"value").unwrap();
        db.close();

        assert!(matches!(db.get(b"key"), Err(DatabaseError::Closed)));
        assert!(matches!(db.put(b"key", b"v"), Err(DatabaseError::Closed)));
    }

    #[test]
    fn test_batch() {
        let db = MemDb::new();

        let mut batch = db.new_batch();
        batch.put(b"key1", b"value1").unwrap();
        batch.put(b"key2", b"value2").unwrap();
        batch.delete(b"key1").unwrap();
        assert_eq!(batch.value_size(), 10 + 10 + 4);

        // nothing applied until write
        assert!(!db.has(b"key2").unwrap());
        batch.write().unwrap();

        assert!(!db.has(b"key1").unwrap());
        assert!(db.has(b"key2").unwrap());

        // double-write is rejected, reset re-arms
        assert!(matches!(
            batch.write(),
            Err(DatabaseError::BatchAlreadyWritten)
        ));
        batch.reset();
        assert_eq!(batch.value_size(), 0);
    }

    #[test]
    fn test_batch_replay() {
        let db = MemDb::new();
        let other = MemDb::new();

        let mut batch = db.new_batch();
        batch.put(b"a", b"1").unwrap();
        batch.delete(b"b").unwrap();
        batch.write().unwrap();

        other.put(b"b", b"2").unwrap();
        batch.replay(&other).unwrap();
        assert_eq!(other.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(!other.has(b"b").unwrap());
    }

    #[test]
    fn test_iterator_prefix_and_start() {
        let db = MemDb::new();
        db.put(b"aa1", b"1").unwrap();
        db.put(b"aa2", b"2").unwrap();
        db.put(b"aa3", b"3").unwrap();
        db.put(b"bb1", b"4").unwrap();

        let mut iter = db.iter(b"aa", b"2");
        let mut keys = Vec::new();
        while iter.next() {
            keys.push(iter.key().to_vec());
        }
        iter.release();
        assert_eq!(keys, vec![b"aa2".to_vec(), b"aa3".to_vec()]);

        let mut iter = db.iter(&[], &[]);
        let mut count = 0;
        while iter.next() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn test_empty_iterator() {
        let db = MemDb::new();
        let mut iter = db.iter(&[], &[]);
        assert!(!iter.next());
        assert!(iter.key().is_empty());
        assert!(iter.value().is_empty());
    }
}
