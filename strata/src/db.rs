// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The layered state database.

use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{info, warn};
use typed_builder::TypedBuilder;

use crate::buffer::DEFAULT_BUFFER_LIMIT;
use crate::disklayer::DiskLayer;
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::history;
use crate::journal;
use crate::layer::Layer;
use crate::node::NodeSet;
use crate::reader::StateReader;
use crate::stateset::StateSetWithOrigin;
use crate::tree::LayerTree;
use crate::trie::TrieLoader;
use crate::types::{Hash, StateId, EMPTY_ROOT};
use strata_storage::{schema, CleanCache, Freezer, Store};

/// Database configuration.
#[derive(Clone, Debug, TypedBuilder)]
pub struct Config {
    /// Memory allowance of the disk layer's write buffer in bytes.
    #[builder(default = DEFAULT_BUFFER_LIMIT)]
    pub buffer_limit: u64,

    /// Number of recent state histories to retain; zero keeps all of
    /// them.
    #[builder(default = 0)]
    pub state_history: u64,

    /// Number of clean trie nodes cached in memory; zero disables the
    /// cache.
    #[builder(default = 1_000_000)]
    pub clean_cache_entries: usize,

    /// Whether a missing or mismatched flat snapshot is rebuilt in the
    /// background on open.
    #[builder(default = true)]
    pub regenerate_snapshot: bool,

    /// Reject every mutation, for offline inspection tooling.
    #[builder(default = false)]
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Handles shared by every layer of one database.
pub(crate) struct DbShared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) freezer: Option<Freezer>,
    pub(crate) cleans: Option<Arc<CleanCache>>,
    pub(crate) loader: Arc<dyn TrieLoader>,
    pub(crate) config: Config,
}

/// The layered state store: a stack of in-memory diff layers over one
/// persistent disk layer, with state histories for reverts and a flat
/// snapshot for fast reads.
///
/// All mutations (`update`, `commit`, `recover`, `journal`) must be
/// serialized by the caller; readers and the snapshot generator run
/// concurrently with them.
pub struct Database {
    shared: Arc<DbShared>,
    tree: LayerTree,
}

impl Database {
    /// Opens the database over a store and an optional history freezer,
    /// reconstructing any journaled layer stack and resuming an
    /// interrupted snapshot generation.
    pub fn open(
        store: Arc<dyn Store>,
        freezer: Option<Freezer>,
        loader: Arc<dyn TrieLoader>,
        config: Config,
    ) -> Result<Self> {
        let cleans = NonZeroUsize::new(config.clean_cache_entries)
            .map(|entries| Arc::new(CleanCache::new(entries)));
        let shared = Arc::new(DbShared {
            store,
            freezer,
            cleans,
            loader,
            config,
        });
        let head = journal::load_layers(&shared)?;
        let tree = LayerTree::new(head);
        let db = Database { shared, tree };
        let disk = db.tree.bottom();

        // histories beyond the disk layer are leftovers of a crash
        // between the history write and the journal write
        if let Some(freezer) = &db.shared.freezer {
            if freezer.ancients() > disk.id() {
                let pruned =
                    history::truncate_head(db.shared.store.as_ref(), freezer, disk.id())?;
                warn!("Truncated extra state histories, number: {pruned}");
            }
        }
        if !db.shared.config.read_only {
            db.resume_generation(&disk)?;
        }
        Ok(db)
    }

    /// Relaunches or restarts flat snapshot generation as the persisted
    /// markers dictate.
    fn resume_generation(&self, disk: &Arc<DiskLayer>) -> Result<()> {
        let store = self.shared.store.as_ref();
        if let Some(marker) = schema::read_snapshot_progress(store)? {
            let generator = Generator::new(self.shared.clone(), marker);
            disk.set_generator(generator.clone());
            generator.run(disk.root());
            return Ok(());
        }
        let snap_root = schema::read_snapshot_root(store)?;
        let valid = snap_root.as_deref() == Some(disk.root().as_ref());
        if !valid && disk.root() != *EMPTY_ROOT && self.shared.config.regenerate_snapshot {
            info!("Rebuilding state snapshot, root: {:.8}", disk.root());
            schema::write_snapshot_progress(store, &[])?;
            let generator = Generator::new(self.shared.clone(), Vec::new());
            disk.set_generator(generator.clone());
            generator.run(disk.root());
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Stacks the state transition of one block onto the layer
    /// identified by `parent_root`. The new layer's state id is the
    /// parent's plus one.
    pub fn update(
        &self,
        root: Hash,
        parent_root: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Result<()> {
        self.check_writable()?;
        self.tree.add(root, parent_root, block, nodes, states)
    }

    /// Flattens the whole chain below `root` into the disk layer,
    /// forcing a buffer flush.
    pub fn commit(&self, root: Hash) -> Result<()> {
        self.check_writable()?;
        self.tree.cap(root, 0)
    }

    /// Flattens diff layers below `root` until at most `retain` remain.
    pub fn cap(&self, root: Hash, retain: usize) -> Result<()> {
        self.check_writable()?;
        self.tree.cap(root, retain)
    }

    /// Whether the state identified by `root` can be reached by
    /// reverting the recorded histories.
    pub fn recoverable(&self, root: &Hash) -> bool {
        let Some(freezer) = &self.shared.freezer else {
            return false;
        };
        let Ok(Some(id)) = schema::read_state_id(self.shared.store.as_ref(), root.as_ref())
        else {
            return false;
        };
        // every history in (id, disk] must still be retained; lookups
        // left dangling by an interrupted truncation fail the bounds
        // check here and are simply ignored
        id <= self.tree.bottom().id() && id >= freezer.tail()
    }

    /// Rolls the disk layer back to the state identified by `root` by
    /// applying recorded histories in reverse. Every in-memory diff
    /// layer is discarded.
    pub fn recover(&self, root: Hash) -> Result<()> {
        self.check_writable()?;
        let freezer = self.shared.freezer.as_ref().ok_or(Error::HistoryDisabled)?;
        if !self.recoverable(&root) {
            return Err(Error::StateUnrecoverable {
                id: self.tree.bottom().id(),
            });
        }
        loop {
            let disk = self.tree.bottom();
            if disk.root() == root {
                break;
            }
            let record = history::read_history(freezer, disk.id())?;
            let reverted = disk.revert(&record)?;
            self.tree.reset(Layer::Disk(reverted));
        }
        // drop the histories above the restored state and the journal,
        // both describe a future that no longer exists
        history::truncate_head(
            self.shared.store.as_ref(),
            freezer,
            self.tree.bottom().id(),
        )?;
        schema::delete_journal(self.shared.store.as_ref())?;
        Ok(())
    }

    /// Serializes the layer stack ending at `root` for the next startup
    /// and stops background work. The database must not be mutated
    /// afterwards.
    pub fn journal(&self, root: Hash) -> Result<()> {
        self.check_writable()?;
        let disk = self.tree.bottom();
        if let Some(generator) = disk.generator() {
            generator.stop();
        }
        let head = self
            .tree
            .get(&root)
            .ok_or(Error::LayerNotFound { root })?;
        let blob = journal::encode_journal(&head)?;
        schema::write_journal(self.shared.store.as_ref(), &blob)?;
        self.shared.store.sync()?;
        info!(
            "Persisted layer journal, head: {root:.8}, bytes: {}",
            blob.len()
        );
        Ok(())
    }

    /// Opens a read façade onto the state identified by `root`.
    pub fn state_reader(&self, root: Hash) -> Result<StateReader> {
        let layer = self
            .tree
            .get(&root)
            .ok_or(Error::LayerNotFound { root })?;
        Ok(StateReader::new(layer, self.shared.loader.clone()))
    }

    /// The root of the current disk layer.
    pub fn disk_root(&self) -> Hash {
        self.tree.bottom().root()
    }

    /// The state id of the current disk layer.
    pub fn disk_state_id(&self) -> StateId {
        self.tree.bottom().id()
    }

    /// The number of live layers, the disk layer included.
    pub fn layer_count(&self) -> usize {
        self.tree.len()
    }

    /// Approximate memory held by the unflushed state: the buffered
    /// writes of the disk layer plus every live diff layer.
    pub fn size(&self) -> u64 {
        self.tree.diff_memory() + self.tree.bottom().size()
    }

    /// Adjusts the buffer allowance of the disk layer.
    pub fn set_buffer_limit(&self, limit: u64) {
        self.tree.bottom().buffer().write().set_limit(limit);
    }

    /// Stops background work without journaling, for read-only
    /// shutdown paths.
    pub fn close(&self) {
        if let Some(generator) = self.tree.bottom().generator() {
            generator.stop();
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("root", &format_args!("{:.8}", self.disk_root()))
            .field("id", &self.disk_state_id())
            .field("layers", &self.layer_count())
            .finish()
    }
}
