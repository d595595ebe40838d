// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! A single append-only freezer table.
//!
//! Each table is a data file of concatenated blobs plus an index file of
//! fixed 8-byte entries, where entry `i` holds the little-endian end
//! offset of item `i` in the data file. Head truncation physically trims
//! both files; tail truncation only advances the virtual tail recorded
//! in the metadata.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::warn;

use super::meta::TableMeta;
use crate::{DatabaseError, Result};

const INDEX_ENTRY_SIZE: u64 = 8;

/// One append-only table of a [`Freezer`](super::Freezer).
#[derive(Debug)]
pub struct FreezerTable {
    data: File,
    index: File,
    meta: TableMeta,

    /// Number of physically stored items, the append cursor.
    items: u64,
    /// Whether metadata writes are fsync'd immediately.
    sync: bool,
}

impl FreezerTable {
    /// Opens or creates the table `name` inside `dir`, repairing any
    /// partially written entries left behind by a crash.
    pub(crate) fn open(dir: &Path, name: &str, sync: bool) -> Result<Self> {
        let open = |suffix: &str| -> Result<File> {
            Ok(OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.join(format!("{name}.{suffix}")))?)
        };
        let data = open("dat")?;
        let index = open("idx")?;
        let meta = TableMeta::open(open("meta")?)?;

        let mut table = FreezerTable {
            data,
            index,
            meta,
            items: 0,
            sync,
        };
        table.repair(name)?;
        Ok(table)
    }

    /// Drops torn index entries and dangling data bytes. Entries beyond
    /// the recorded flush offset are only trusted when they stay within
    /// the data file.
    fn repair(&mut self, name: &str) -> Result<()> {
        let mut index_size = self.index.metadata()?.len();
        if index_size % INDEX_ENTRY_SIZE != 0 {
            warn!(
                "Truncating torn freezer index entry, table: {name}, size: {index_size}"
            );
            index_size -= index_size % INDEX_ENTRY_SIZE;
            self.index.set_len(index_size)?;
        }
        let data_size = self.data.metadata()?.len();
        let mut items = index_size / INDEX_ENTRY_SIZE;
        while items > 0 && self.end_offset(items)? > data_size {
            items -= 1;
        }
        if items * INDEX_ENTRY_SIZE != index_size {
            warn!(
                "Truncating dangling freezer index entries, table: {name}, items: {items}"
            );
            self.index.set_len(items * INDEX_ENTRY_SIZE)?;
        }
        let tail = self.end_offset(items)?;
        if tail < data_size {
            warn!("Truncating dangling freezer data, table: {name}, bytes: {data_size}");
            self.data.set_len(tail)?;
        }
        self.items = items;
        if self.meta.virtual_tail > items {
            // tail ran ahead of a truncated head, reset it
            self.meta.set_virtual_tail(items, self.sync)?;
        }
        Ok(())
    }

    /// End offset of item `id - 1`, i.e. the start offset of item `id`.
    fn end_offset(&self, id: u64) -> Result<u64> {
        if id == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        self.index.read_exact_at(&mut buf, (id - 1) * INDEX_ENTRY_SIZE)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Number of physically stored items (one past the last id).
    pub fn items(&self) -> u64 {
        self.items
    }

    /// First visible item id.
    pub fn tail(&self) -> u64 {
        self.meta.virtual_tail
    }

    /// Appends a blob as item `id`. Only the current head may be
    /// appended.
    pub fn append(&mut self, id: u64, blob: &[u8]) -> Result<()> {
        if id != self.items {
            return Err(DatabaseError::OutOfOrder {
                want: self.items,
                have: id,
            });
        }
        let start = self.end_offset(self.items)?;
        self.data.write_all_at(blob, start)?;
        let end = start + blob.len() as u64;
        self.index
            .write_all_at(&end.to_le_bytes(), self.items * INDEX_ENTRY_SIZE)?;
        self.items += 1;
        Ok(())
    }

    /// Reads the blob of item `id`.
    pub fn read(&self, id: u64) -> Result<Vec<u8>> {
        if id < self.meta.virtual_tail || id >= self.items {
            return Err(DatabaseError::OutOfBounds {
                id,
                tail: self.meta.virtual_tail,
                head: self.items,
            });
        }
        let start = self.end_offset(id)?;
        let end = self.end_offset(id + 1)?;
        if end < start {
            return Err(DatabaseError::Corruption(format!(
                "index offsets not monotonic at item {id}"
            )));
        }
        let mut blob = vec![0u8; (end - start) as usize];
        self.data.read_exact_at(&mut blob, start)?;
        Ok(blob)
    }

    /// Reads `count` consecutive blobs starting at `start`.
    pub fn read_range(&self, start: u64, count: u64) -> Result<Vec<Vec<u8>>> {
        (start..start + count).map(|id| self.read(id)).collect()
    }

    /// Discards every item with id >= `new_head`.
    pub fn truncate_head(&mut self, new_head: u64) -> Result<()> {
        if new_head >= self.items {
            return Ok(());
        }
        if new_head < self.meta.virtual_tail {
            return Err(DatabaseError::TruncationOutOfRange {
                tail: self.meta.virtual_tail,
                head: self.items,
                target: new_head,
            });
        }
        let end = self.end_offset(new_head)?;
        self.index.set_len(new_head * INDEX_ENTRY_SIZE)?;
        self.data.set_len(end)?;
        self.items = new_head;
        if self.meta.index_flush_offset > new_head * INDEX_ENTRY_SIZE {
            self.meta
                .set_index_flush_offset(new_head * INDEX_ENTRY_SIZE, self.sync)?;
        }
        Ok(())
    }

    /// Hides every item with id < `new_tail`.
    pub fn truncate_tail(&mut self, new_tail: u64) -> Result<()> {
        if new_tail <= self.meta.virtual_tail {
            return Ok(());
        }
        if new_tail > self.items {
            return Err(DatabaseError::TruncationOutOfRange {
                tail: self.meta.virtual_tail,
                head: self.items,
                target: new_tail,
            });
        }
        self.meta.set_virtual_tail(new_tail, self.sync)
    }

    /// Fsyncs the data and index files and records the flushed index
    /// extent in the metadata.
    pub fn sync(&mut self) -> Result<()> {
        self.data.sync_all()?;
        self.index.sync_all()?;
        self.meta
            .set_index_flush_offset(self.items * INDEX_ENTRY_SIZE, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_table(dir: &Path) -> FreezerTable {
        FreezerTable::open(dir, "test", false).unwrap()
    }

    #[test]
    fn test_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = open_table(dir.path());

        table.append(0, b"alpha").unwrap();
        table.append(1, b"").unwrap();
        table.append(2, b"gamma").unwrap();

        assert_eq!(table.items(), 3);
        assert_eq!(table.read(0).unwrap(), b"alpha");
        assert_eq!(table.read(1).unwrap(), b"");
        assert_eq!(table.read(2).unwrap(), b"gamma");
        assert_eq!(
            table.read_range(0, 3).unwrap(),
            vec![b"alpha".to_vec(), b"".to_vec(), b"gamma".to_vec()]
        );

        assert!(matches!(
            table.append(5, b"skip"),
            Err(DatabaseError::OutOfOrder { want: 3, have: 5 })
        ));
        assert!(matches!(
            table.read(3),
            Err(DatabaseError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_reopen_preserves_items() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut table = open_table(dir.path());
            table.append(0, b"one").unwrap();
            table.append(1, b"two").unwrap();
            table.sync().unwrap();
        }
        let table = open_table(dir.path());
        assert_eq!(table.items(), 2);
        assert_eq!(table.read(1).unwrap(), b"two");
    }

    #[test]
    fn test_truncate_head_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = open_table(dir.path());
        for i in 0..5u64 {
            table.append(i, format!("item{i}").as_bytes()).unwrap();
        }

        table.truncate_head(3).unwrap();
        assert_eq!(table.items(), 3);
        assert!(table.read(3).is_err());
        assert_eq!(table.read(2).unwrap(), b"item2");

        // appending continues from the new head
        table.append(3, b"item3'").unwrap();
        assert_eq!(table.read(3).unwrap(), b"item3'");

        table.truncate_tail(2).unwrap();
        assert_eq!(table.tail(), 2);
        assert!(table.read(1).is_err());
        assert_eq!(table.read(2).unwrap(), b"item2");

        // shrinking the tail back is a no-op
        table.truncate_tail(1).unwrap();
        assert_eq!(table.tail(), 2);
    }

    #[test]
    fn test_repair_torn_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut table = open_table(dir.path());
            table.append(0, b"whole").unwrap();
            table.sync().unwrap();
        }
        // simulate a torn write of the next index entry
        let index_path = dir.path().join("test.idx");
        let blob = std::fs::read(&index_path).unwrap();
        let mut torn = blob.clone();
        torn.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&index_path, &torn).unwrap();

        let table = open_table(dir.path());
        assert_eq!(table.items(), 1);
        assert_eq!(table.read(0).unwrap(), b"whole");
    }

    #[test]
    fn test_repair_dangling_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut table = open_table(dir.path());
            table.append(0, b"kept").unwrap();
            table.sync().unwrap();
        }
        // index entry written but the data bytes never made it
        let index_path = dir.path().join("test.idx");
        let mut blob = std::fs::read(&index_path).unwrap();
        blob.extend_from_slice(&1000u64.to_le_bytes());
        std::fs::write(&index_path, &blob).unwrap();

        let table = open_table(dir.path());
        assert_eq!(table.items(), 1);
    }
}
