// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Freezer table metadata.
//!
//! A small RLP-encoded file next to each table. The fields are designed
//! for error resilience: a lost metadata file resets the virtual tail to
//! zero, which makes previously hidden items visible again but never
//! loses data.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use rlp::{Rlp, RlpStream};

use crate::{DatabaseError, Result};

/// Initial version of the metadata layout: `[version, tail]`.
const VERSION_V1: u16 = 1;
/// Current version, adding the index flush offset:
/// `[version, tail, offset]`.
const VERSION_V2: u16 = 2;

/// Durable per-table properties.
#[derive(Debug)]
pub(crate) struct TableMeta {
    file: File,

    /// The number of items hidden at the front of the table. Items with
    /// id below this are deleted as far as readers are concerned, even
    /// when their bytes are still present in the data file.
    pub(crate) virtual_tail: u64,

    /// The offset in the index file up to which all entries are known to
    /// be fsync'd. Entries beyond it must be validated before use.
    pub(crate) index_flush_offset: u64,
}

impl TableMeta {
    /// Loads the metadata from the file, writing a fresh v2 layout when
    /// the file is empty and upgrading a legacy v1 layout in place.
    pub(crate) fn open(mut file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        if size == 0 {
            let mut meta = TableMeta {
                file,
                virtual_tail: 0,
                index_flush_offset: 0,
            };
            meta.write(true)?;
            return Ok(meta);
        }
        file.seek(SeekFrom::Start(0))?;
        let mut blob = Vec::new();
        file.read_to_end(&mut blob)?;

        if let Some((tail, offset)) = decode_v2(&blob) {
            return Ok(TableMeta {
                file,
                virtual_tail: tail,
                index_flush_offset: offset,
            });
        }
        if let Some(tail) = decode_v1(&blob) {
            // upgrade the legacy layout to the latest version
            let mut meta = TableMeta {
                file,
                virtual_tail: tail,
                index_flush_offset: 0,
            };
            meta.write(true)?;
            return Ok(meta);
        }
        Err(DatabaseError::Corruption(
            "undecodable freezer table metadata".to_string(),
        ))
    }

    /// Sets the virtual tail and flushes the metadata.
    pub(crate) fn set_virtual_tail(&mut self, tail: u64, sync: bool) -> Result<()> {
        self.virtual_tail = tail;
        self.write(sync)
    }

    /// Sets the index flush offset and flushes the metadata.
    pub(crate) fn set_index_flush_offset(&mut self, offset: u64, sync: bool) -> Result<()> {
        self.index_flush_offset = offset;
        self.write(sync)
    }

    /// Flushes the metadata to its file, fsync'ing when required.
    pub(crate) fn write(&mut self, sync: bool) -> Result<()> {
        let mut stream = RlpStream::new_list(3);
        stream
            .append(&VERSION_V2)
            .append(&self.virtual_tail)
            .append(&self.index_flush_offset);
        let blob = stream.out();

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&blob)?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn decode_v2(blob: &[u8]) -> Option<(u64, u64)> {
    let rlp = Rlp::new(blob);
    let version: u16 = rlp.val_at(0).ok()?;
    if version != VERSION_V2 {
        return None;
    }
    Some((rlp.val_at(1).ok()?, rlp.val_at(2).ok()?))
}

fn decode_v1(blob: &[u8]) -> Option<u64> {
    let rlp = Rlp::new(blob);
    let version: u16 = rlp.val_at(0).ok()?;
    if version != VERSION_V1 {
        return None;
    }
    if rlp.item_count().ok()? != 2 {
        return None;
    }
    rlp.val_at(1).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn meta_file(dir: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("t.meta"))
            .unwrap()
    }

    #[test]
    fn test_fresh_and_reload() {
        let dir = tempfile::tempdir().unwrap();

        let mut meta = TableMeta::open(meta_file(dir.path())).unwrap();
        assert_eq!(meta.virtual_tail, 0);
        meta.set_virtual_tail(9, true).unwrap();
        meta.set_index_flush_offset(128, false).unwrap();
        drop(meta);

        let meta = TableMeta::open(meta_file(dir.path())).unwrap();
        assert_eq!(meta.virtual_tail, 9);
        assert_eq!(meta.index_flush_offset, 128);
    }

    #[test]
    fn test_v1_upgrade() {
        let dir = tempfile::tempdir().unwrap();

        let mut file = meta_file(dir.path());
        let mut stream = RlpStream::new_list(2);
        stream.append(&VERSION_V1).append(&33u64);
        file.write_all(&stream.out()).unwrap();
        drop(file);

        let meta = TableMeta::open(meta_file(dir.path())).unwrap();
        assert_eq!(meta.virtual_tail, 33);
        assert_eq!(meta.index_flush_offset, 0);
        drop(meta);

        // reopening reads the rewritten v2 layout
        let meta = TableMeta::open(meta_file(dir.path())).unwrap();
        assert_eq!(meta.virtual_tail, 33);
    }

    #[test]
    fn test_garbage_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let mut file = meta_file(dir.path());
        file.write_all(b"not rlp at all").unwrap();
        drop(file);

        assert!(matches!(
            TableMeta::open(meta_file(dir.path())),
            Err(DatabaseError::Corruption(_))
        ));
    }
}
