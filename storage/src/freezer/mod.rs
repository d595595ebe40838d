// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Ordered multi-table append-only log.
//!
//! A [Freezer] groups several [FreezerTable]s under one directory and
//! keeps them aligned: every logical item occupies one row in every
//! table, all indexed by the same monotonically increasing id. Items can
//! only be appended at the head and removed from either end.

mod meta;
mod table;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::Mutex;

pub use table::FreezerTable;

use crate::{DatabaseError, Result};

/// An append-only, id-indexed multi-table store for immutable records.
#[derive(Debug)]
pub struct Freezer {
    tables: Mutex<BTreeMap<String, FreezerTable>>,
}

impl Freezer {
    /// Opens or creates a freezer in `dir` with the given table names.
    ///
    /// Tables left at diverging lengths by a crash are realigned: heads
    /// are truncated down to the shortest table, tails advanced to the
    /// farthest one.
    pub fn open(dir: &Path, table_names: &[&str], sync: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut tables = BTreeMap::new();
        for name in table_names {
            tables.insert((*name).to_string(), FreezerTable::open(dir, name, sync)?);
        }

        let head = tables.values().map(FreezerTable::items).min().unwrap_or(0);
        let tail = tables.values().map(FreezerTable::tail).max().unwrap_or(0);
        for table in tables.values_mut() {
            table.truncate_head(head)?;
            if tail <= head {
                table.truncate_tail(tail)?;
            }
        }
        Ok(Freezer {
            tables: Mutex::new(tables),
        })
    }

    /// Appends one row to every table as item `id`. The row set must
    /// cover each table exactly once and `id` must equal [`Self::ancients`].
    pub fn append(&self, id: u64, rows: &[(&str, &[u8])]) -> Result<()> {
        let mut tables = self.tables.lock();
        if rows.len() != tables.len() {
            return Err(DatabaseError::Corruption(format!(
                "freezer append covers {} of {} tables",
                rows.len(),
                tables.len()
            )));
        }
        for (name, blob) in rows {
            let table = tables.get_mut(*name).ok_or_else(|| {
                DatabaseError::Corruption(format!("unknown freezer table {name}"))
            })?;
            table.append(id, blob)?;
        }
        Ok(())
    }

    /// Reads the blob of item `id` from the named table.
    pub fn read(&self, table: &str, id: u64) -> Result<Vec<u8>> {
        let tables = self.tables.lock();
        let table = tables
            .get(table)
            .ok_or_else(|| DatabaseError::Corruption(format!("unknown freezer table {table}")))?;
        table.read(id)
    }

    /// Reads `count` consecutive blobs from the named table.
    pub fn read_range(&self, table: &str, start: u64, count: u64) -> Result<Vec<Vec<u8>>> {
        let tables = self.tables.lock();
        let table = tables
            .get(table)
            .ok_or_else(|| DatabaseError::Corruption(format!("unknown freezer table {table}")))?;
        table.read_range(start, count)
    }

    /// One past the id of the last stored item.
    pub fn ancients(&self) -> u64 {
        self.tables
            .lock()
            .values()
            .map(FreezerTable::items)
            .min()
            .unwrap_or(0)
    }

    /// The id of the first retained item.
    pub fn tail(&self) -> u64 {
        self.tables
            .lock()
            .values()
            .map(FreezerTable::tail)
            .max()
            .unwrap_or(0)
    }

    /// Discards every item with id >= `new_head` from all tables.
    /// Returns the number of items removed.
    pub fn truncate_head(&self, new_head: u64) -> Result<u64> {
        let mut tables = self.tables.lock();
        let old = tables.values().map(FreezerTable::items).min().unwrap_or(0);
        if new_head >= old {
            return Ok(0);
        }
        for table in tables.values_mut() {
            table.truncate_head(new_head)?;
        }
        Ok(old - new_head)
    }

    /// Hides every item with id < `new_tail` in all tables. Returns the
    /// number of items removed.
    pub fn truncate_tail(&self, new_tail: u64) -> Result<u64> {
        let mut tables = self.tables.lock();
        let old = tables.values().map(FreezerTable::tail).max().unwrap_or(0);
        if new_tail <= old {
            return Ok(0);
        }
        for table in tables.values_mut() {
            table.truncate_tail(new_tail)?;
        }
        Ok(new_tail - old)
    }

    /// Fsyncs every table.
    pub fn sync(&self) -> Result<()> {
        for table in self.tables.lock().values_mut() {
            table.sync()?;
        }
        Ok(())
    }
}
