// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! A file-backed store for tooling and tests.
//!
//! The whole key space is loaded into memory on open and rewritten as
//! one snapshot file on [Store::sync]. That is plenty for the offline
//! inspection and pruning tools; a node deployment plugs a real
//! key-value engine into the same traits.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    Batch, Batcher, Compacter, DatabaseError, DbIterator, Iteratee, KeyValueDeleter,
    KeyValueReader, KeyValueWriter, KeyValueWriterDeleter, Result, Store,
};

const FILE_MAGIC: &[u8; 4] = b"sdb1";

type SharedMap = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// A snapshot-file backed key-value store.
pub struct FileDb {
    path: PathBuf,
    data: SharedMap,
    dirty: Arc<AtomicBool>,
}

impl FileDb {
    /// Opens or creates the store at `path`, loading every record into
    /// memory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut data = BTreeMap::new();
        if path.exists() {
            let mut reader = BufReader::new(File::open(path)?);
            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != FILE_MAGIC {
                return Err(DatabaseError::Corruption(
                    "unrecognized store file".to_string(),
                ));
            }
            loop {
                let mut lens = [0u8; 8];
                match reader.read_exact(&mut lens) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(err) => return Err(err.into()),
                }
                let klen = u32::from_le_bytes(lens[..4].try_into().expect("fixed")) as usize;
                let vlen = u32::from_le_bytes(lens[4..].try_into().expect("fixed")) as usize;
                let mut key = vec![0u8; klen];
                reader.read_exact(&mut key)?;
                let mut value = vec![0u8; vlen];
                reader.read_exact(&mut value)?;
                data.insert(key, value);
            }
        }
        Ok(FileDb {
            path: path.to_path_buf(),
            data: Arc::new(RwLock::new(data)),
            dirty: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rewrites the snapshot file atomically.
    fn persist(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(FILE_MAGIC)?;
            for (key, value) in self.data.read().iter() {
                writer.write_all(&(key.len() as u32).to_le_bytes())?;
                writer.write_all(&(value.len() as u32).to_le_bytes())?;
                writer.write_all(key)?;
                writer.write_all(value)?;
            }
            writer.flush()?;
            writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        if self.dirty.load(Ordering::Acquire) {
            let _ = self.persist();
        }
    }
}

impl KeyValueReader for FileDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }
}

impl KeyValueWriter for FileDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }
}

impl KeyValueDeleter for FileDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }
}

impl Batcher for FileDb {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(FileBatch {
            data: self.data.clone(),
            dirty: self.dirty.clone(),
            ops: RwLock::new(Vec::new()),
            size: RwLock::new(0),
        })
    }
}

impl Iteratee for FileDb {
    fn iter(&self, prefix: &[u8], start: &[u8]) -> Box<dyn DbIterator> {
        let data = self.data.read();
        let mut from = prefix.to_vec();
        from.extend_from_slice(start);
        let entries: Vec<(Vec<u8>, Vec<u8>)> = data
            .range(from..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(FileIterator {
            entries,
            index: 0,
            started: false,
        })
    }
}

impl Compacter for FileDb {
    fn compact(&self, _start: &[u8], _limit: &[u8]) -> Result<()> {
        Ok(())
    }
}

impl Store for FileDb {
    fn sync(&self) -> Result<()> {
        self.persist()
    }
}

impl std::fmt::Debug for FileDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDb")
            .field("path", &self.path)
            .field("len", &self.data.read().len())
            .finish()
    }
}

enum FileOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

struct FileBatch {
    data: SharedMap,
    dirty: Arc<AtomicBool>,
    ops: RwLock<Vec<FileOp>>,
    size: RwLock<usize>,
}

impl KeyValueWriter for FileBatch {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ops.write().push(FileOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        *self.size.write() += key.len() + value.len();
        Ok(())
    }
}

impl KeyValueDeleter for FileBatch {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.ops.write().push(FileOp::Delete { key: key.to_vec() });
        *self.size.write() += key.len();
        Ok(())
    }
}

impl Batch for FileBatch {
    fn value_size(&self) -> usize {
        *self.size.read()
    }

    fn write(&mut self) -> Result<()> {
        let ops = self.ops.read();
        let mut data = self.data.write();
        for op in ops.iter() {
            match op {
                FileOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                FileOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.write().clear();
        *self.size.write() = 0;
    }

    fn replay(&self, writer: &dyn KeyValueWriterDeleter) -> Result<()> {
        for op in self.ops.read().iter() {
            match op {
                FileOp::Put { key, value } => writer.put(key, value)?,
                FileOp::Delete { key } => writer.delete(key)?,
            }
        }
        Ok(())
    }
}

struct FileIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    index: usize,
    started: bool,
}

impl DbIterator for FileIterator {
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
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = FileDb::open(&path).unwrap();
            db.put(b"alpha", b"1").unwrap();
            let mut batch = db.new_batch();
            batch.put(b"beta", b"2").unwrap();
            batch.delete(b"alpha").unwrap();
            batch.write().unwrap();
            db.sync().unwrap();
        }
        let db = FileDb::open(&path).unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), None);
        assert_eq!(db.get(b"beta").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_dirty_flush_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = FileDb::open(&path).unwrap();
            db.put(b"key", b"value").unwrap();
            // no explicit sync
        }
        let db = FileDb::open(&path).unwrap();
        assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        fs::write(&path, b"something else").unwrap();
        assert!(matches!(
            FileDb::open(&path),
            Err(DatabaseError::Corruption(_))
        ));
    }
}
