use anyhow::Result;
use clap::Args;

use strata::trie::mem::MemTrieLoader;

use crate::StoreOpts;

#[derive(Debug, Args)]
pub struct Options {
    /// State root to verify the snapshot against; defaults to the
    /// persisted state root
    #[arg(value_name = "ROOT")]
    root: Option<String>,

    #[command(flatten)]
    store: StoreOpts,
}

pub fn run(opts: &Options) -> Result<()> {
    let store = opts.store.open_store()?;
    let root = crate::resolve_root(store.as_ref(), opts.root.as_ref())?;

    let (accounts, slots) = strata::verify_state(store.as_ref(), &MemTrieLoader, root)?;
    println!("snapshot verified, root {root:.8}: {accounts} accounts, {slots} slots");
    Ok(())
}
