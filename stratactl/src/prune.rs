use anyhow::Result;
use clap::Args;

use strata::trie::mem::MemTrieLoader;
use strata::Pruner;

use crate::StoreOpts;

#[derive(Debug, Args)]
pub struct Options {
    /// Target state root to retain; defaults to the persisted snapshot
    /// root
    #[arg(value_name = "ROOT")]
    root: Option<String>,

    #[command(flatten)]
    store: StoreOpts,

    /// Memory allowance of the live-state bloom filter in megabytes
    #[arg(long, value_name = "MB", default_value_t = 1024)]
    bloom_size: u64,
}

pub fn run(opts: &Options) -> Result<()> {
    let root = opts.root.as_ref().map(|raw| crate::parse_root(raw)).transpose()?;
    let store = opts.store.open_store()?;

    let pruner = Pruner::new(
        store,
        std::sync::Arc::new(MemTrieLoader),
        opts.store.db_dir(),
        opts.bloom_size,
    );
    pruner.prune(root)?;
    println!("state pruned");
    Ok(())
}
