// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The state bloom: an approximate set of live hashes.
//!
//! Every key the pruner tests is itself a 32-byte hash, so no extra
//! hashing is needed; the probe positions are carved straight out of the
//! key bytes. The filter is persisted as a gzip file whose presence in
//! the datadir doubles as the "pruning in progress" marker.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;

use crate::types::Hash;

/// Filename prefix of the persisted state bloom.
const BLOOM_FILE_PREFIX: &str = "statebloom";

/// Filename suffix of the persisted state bloom.
const BLOOM_FILE_SUFFIX: &str = "bf.gz";

/// Magic bytes of the serialized filter.
const BLOOM_MAGIC: &[u8; 4] = b"stbl";

/// Number of probes per key.
const BLOOM_PROBES: u64 = 4;

/// Smallest accepted filter size in megabytes.
const MIN_BLOOM_SIZE: u64 = 256;

/// An approximate membership filter over 32-byte hashes.
pub struct StateBloom {
    bits: Vec<u8>,
}

impl StateBloom {
    /// Creates a filter occupying `size` megabytes of memory. Sizes
    /// below the minimum are raised to it; the default minimum keeps the
    /// false-positive rate around 0.05% for state sizes in the hundreds
    /// of millions of entries.
    #[must_use]
    pub fn new(size: u64) -> Self {
        let size = if size < MIN_BLOOM_SIZE {
            warn!("Sanitizing bloomfilter size, provided(MB): {size}, updated(MB): {MIN_BLOOM_SIZE}");
            MIN_BLOOM_SIZE
        } else {
            size
        };
        Self::with_bytes((size * 1024 * 1024) as usize)
    }

    pub fn with_bytes(len: usize) -> Self {
        StateBloom {
            bits: vec![0u8; len],
        }
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        debug_assert_eq!(key.len(), 32, "state bloom keys are hashes");
        let h1 = u64::from_be_bytes(key[..8].try_into().expect("checked length"));
        let h2 = u64::from_be_bytes(key[8..16].try_into().expect("checked length"));
        let bits = self.bits.len() as u64 * 8;
        (0..BLOOM_PROBES).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    /// Marks a hash as live.
    pub fn put(&mut self, key: &[u8]) {
        let positions: Vec<u64> = self.positions(key).collect();
        for pos in positions {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    /// Tests whether a hash may be live. False positives are possible,
    /// false negatives are not.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.positions(key)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }

    /// Persists the filter to `path` and fsyncs it. The write goes
    /// through a temporary file so a crash never leaves a torn marker.
    pub fn commit(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut encoder = GzEncoder::new(file, Compression::fast());
            encoder.write_all(BLOOM_MAGIC)?;
            encoder.write_all(&(self.bits.len() as u64).to_le_bytes())?;
            encoder.write_all(&self.bits)?;
            let file = encoder.finish()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a previously committed filter.
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut decoder = GzDecoder::new(File::open(path)?);
        let mut magic = [0u8; 4];
        decoder.read_exact(&mut magic)?;
        if &magic != BLOOM_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a state bloom file",
            ));
        }
        let mut len = [0u8; 8];
        decoder.read_exact(&mut len)?;
        let mut bits = vec![0u8; u64::from_le_bytes(len) as usize];
        decoder.read_exact(&mut bits)?;
        Ok(StateBloom { bits })
    }
}

impl std::fmt::Debug for StateBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBloom")
            .field("size", &self.bits.len())
            .finish()
    }
}

/// The bloom file path encoding the pruning target.
#[must_use]
pub fn bloom_file_path(datadir: &Path, root: &Hash) -> PathBuf {
    datadir.join(format!("{BLOOM_FILE_PREFIX}.{root}.{BLOOM_FILE_SUFFIX}"))
}

/// Finds a committed bloom file in the datadir, returning its path and
/// the pruning target it encodes. Its presence means a pruning run is in
/// progress.
pub fn find_bloom_file(datadir: &Path) -> io::Result<Option<(PathBuf, Hash)>> {
    if !datadir.is_dir() {
        return Ok(None);
    }
    for entry in fs::read_dir(datadir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&format!("{BLOOM_FILE_PREFIX}.")) else {
            continue;
        };
        let Some(hex_root) = rest.strip_suffix(&format!(".{BLOOM_FILE_SUFFIX}")) else {
            continue;
        };
        let Ok(raw) = hex::decode(hex_root) else {
            continue;
        };
        if let Ok(root) = Hash::try_from(raw.as_slice()) {
            return Ok(Some((entry.path(), root)));
        }
    }
    Ok(None)
}
