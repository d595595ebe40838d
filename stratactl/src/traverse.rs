use anyhow::{bail, Result};
use clap::Args;
use log::{info, warn};

use strata::trie::mem::MemTrieLoader;
use strata::trie::{NodeIterator, StoreNodeSource, Trie, TrieLoader};
use strata::{Account, Hash};
use strata_storage::{schema, DbIterator, Iteratee, Store};

use crate::StoreOpts;

#[derive(Debug, Args)]
pub struct StateOptions {
    /// State root to traverse; defaults to the persisted state root
    #[arg(value_name = "ROOT")]
    root: Option<String>,

    #[command(flatten)]
    store: StoreOpts,
}

/// Walks every account, storage slot and code blob reachable from the
/// root, failing on the first integrity violation.
pub fn state(opts: &StateOptions) -> Result<()> {
    let store = opts.store.open_store()?;
    let root = crate::resolve_root(store.as_ref(), opts.root.as_ref())?;
    let counts = traverse(store.as_ref(), root, false)?;
    println!(
        "state traversed, root {root:.8}: {} nodes, {} accounts, {} slots, {} codes",
        counts.nodes, counts.accounts, counts.slots, counts.codes
    );
    Ok(())
}

#[derive(Debug, Args)]
pub struct RawStateOptions {
    /// State root to traverse; defaults to the persisted state root
    #[arg(value_name = "ROOT")]
    root: Option<String>,

    #[command(flatten)]
    store: StoreOpts,
}

/// Like `traverse-state`, but additionally re-hashes every node blob
/// against its recorded hash.
pub fn rawstate(opts: &RawStateOptions) -> Result<()> {
    let store = opts.store.open_store()?;
    let root = crate::resolve_root(store.as_ref(), opts.root.as_ref())?;
    let counts = traverse(store.as_ref(), root, true)?;
    println!(
        "raw state traversed, root {root:.8}: {} nodes ({} bytes), {} accounts, {} slots",
        counts.nodes, counts.bytes, counts.accounts, counts.slots
    );
    Ok(())
}

#[derive(Default)]
struct Counts {
    nodes: u64,
    bytes: u64,
    accounts: u64,
    slots: u64,
    codes: u64,
}

fn traverse(store: &dyn Store, root: Hash, check_hashes: bool) -> Result<Counts> {
    let source = StoreNodeSource::new(store);
    let loader = MemTrieLoader;
    let trie = loader.open(&root, &source)?;

    let mut counts = Counts::default();
    let mut iter = trie.node_iterator(&[])?;
    while iter.next()? {
        visit_node(&mut counts, &*iter, check_hashes)?;
        let Some((key, value)) = iter.leaf() else {
            continue;
        };
        let (key, value) = (key.to_vec(), value.to_vec());
        let account = Account::decode_full(&value)?;
        counts.accounts += 1;

        if account.has_code() {
            if !schema::has_code(store, account.code_hash.as_ref())? {
                bail!(
                    "missing code {:.8} for account {}",
                    account.code_hash,
                    hex::encode(&key)
                );
            }
            counts.codes += 1;
        }
        if account.has_storage() {
            let owner = Hash::try_from(key.as_slice())
                .map_err(|_| anyhow::anyhow!("account key is not a hash"))?;
            let storage = loader.open_storage(&owner, &account.root, &source)?;
            let mut storage_iter = storage.node_iterator(&[])?;
            while storage_iter.next()? {
                visit_node(&mut counts, &*storage_iter, check_hashes)?;
                if storage_iter.leaf().is_some() {
                    counts.slots += 1;
                }
            }
        }
        if counts.accounts % 100_000 == 0 {
            info!("Traversing state, accounts: {}", counts.accounts);
        }
    }
    Ok(counts)
}

fn visit_node(counts: &mut Counts, iter: &dyn NodeIterator, check_hashes: bool) -> Result<()> {
    counts.nodes += 1;
    counts.bytes += iter.blob().len() as u64;
    if check_hashes {
        let computed = Hash::of(iter.blob());
        if computed != iter.hash() {
            bail!(
                "node hash mismatch at path {}: want {:.8}, got {computed:.8}",
                hex::encode(iter.path()),
                iter.hash()
            );
        }
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct TreeOptions {
    /// Root of the trie to dump
    #[arg(value_name = "ROOT", required = true)]
    root: String,

    #[command(flatten)]
    store: StoreOpts,
}

/// Prints the node graph of one trie.
pub fn tree(opts: &TreeOptions) -> Result<()> {
    let store = opts.store.open_store()?;
    let root = crate::parse_root(&opts.root)?;

    let source = StoreNodeSource::new(store.as_ref());
    let trie = MemTrieLoader.open(&root, &source)?;
    let mut nodes = 0u64;
    let mut iter = trie.node_iterator(&[])?;
    while iter.next()? {
        let kind = if iter.leaf().is_some() { "leaf" } else { "branch" };
        println!(
            "{kind} path={} hash={:.16} size={}",
            hex::encode(iter.path()),
            iter.hash(),
            iter.blob().len()
        );
        nodes += 1;
    }
    println!("{nodes} nodes total");
    Ok(())
}

#[derive(Debug, Args)]
pub struct BrokenDbOptions {
    #[command(flatten)]
    store: StoreOpts,
}

/// Scans the raw key space, tallying every record kind and reporting
/// entries that fit no known layout or fail to decode.
pub fn brokendb(opts: &BrokenDbOptions) -> Result<()> {
    let store = opts.store.open_store()?;

    let mut account_nodes = 0u64;
    let mut storage_nodes = 0u64;
    let mut snap_accounts = 0u64;
    let mut snap_storages = 0u64;
    let mut codes = 0u64;
    let mut lookups = 0u64;
    let mut hash_keyed = 0u64;
    let mut meta = 0u64;
    let mut unknown = 0u64;
    let mut broken = 0u64;

    let meta_keys: [&[u8]; 5] = [
        schema::SNAPSHOT_ROOT_KEY,
        schema::PERSISTENT_STATE_ID_KEY,
        schema::SNAPSHOT_PROGRESS_KEY,
        schema::JOURNAL_KEY,
        schema::GENESIS_ROOT_KEY,
    ];
    let mut iter = store.iter(&[], &[]);
    while iter.next() {
        let key = iter.key();
        if meta_keys.contains(&key) {
            meta += 1;
        } else if key.len() == 32 {
            hash_keyed += 1;
        } else if schema::as_code_key(key).is_some() {
            codes += 1;
        } else if key.len() == 33 && key[0] == schema::SNAPSHOT_ACCOUNT_PREFIX {
            snap_accounts += 1;
            if Account::decode_slim(iter.value()).is_err() {
                warn!("Undecodable snapshot account, key: {}", hex::encode(key));
                broken += 1;
            }
        } else if key.len() == 65 && key[0] == schema::SNAPSHOT_STORAGE_PREFIX {
            snap_storages += 1;
        } else if key.len() == 33 && key[0] == schema::STATE_ID_PREFIX {
            lookups += 1;
        } else if !key.is_empty() && key[0] == schema::ACCOUNT_TRIE_PREFIX {
            account_nodes += 1;
        } else if key.len() >= 33 && key[0] == schema::STORAGE_TRIE_PREFIX {
            storage_nodes += 1;
        } else {
            warn!("Unclassifiable entry, key: {}", hex::encode(key));
            unknown += 1;
        }
    }
    iter.release();

    println!("account trie nodes: {account_nodes}");
    println!("storage trie nodes: {storage_nodes}");
    println!("snapshot accounts:  {snap_accounts}");
    println!("snapshot storage:   {snap_storages}");
    println!("code blobs:         {codes}");
    println!("state id lookups:   {lookups}");
    println!("hash-keyed nodes:   {hash_keyed}");
    println!("metadata entries:   {meta}");
    println!("unknown entries:    {unknown}");
    println!("broken entries:     {broken}");
    Ok(())
}
