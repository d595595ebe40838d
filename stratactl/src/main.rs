use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};

use strata::Hash;
use strata_storage::{schema, FileDb, KeyValueReader};

pub mod prune;
pub mod traverse;
pub mod verify;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(
        long,
        short = 'l',
        required = false,
        help = "Log level. Respects RUST_LOG.",
        value_name = "LOG_LEVEL",
        num_args = 1,
        value_parser = ["debug", "info"],
        default_value_t = String::from("info"),
    )]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Prune all state not reachable from the target root
    PruneState(prune::Options),
    /// Verify the flat snapshot against the target state root
    VerifyState(verify::Options),
    /// Walk the state and check account, storage and code integrity
    TraverseState(traverse::StateOptions),
    /// Walk the state re-hashing every trie node blob
    TraverseRawstate(traverse::RawStateOptions),
    /// Dump the node graph of one trie
    TraverseTree(traverse::TreeOptions),
    /// Scan the store and report undecodable or unclassifiable entries
    TraverseBrokendb(traverse::BrokenDbOptions),
}

/// Store location options shared by every command.
#[derive(Debug, Args)]
pub struct StoreOpts {
    /// Data directory holding the state store
    #[arg(long, value_name = "PATH")]
    pub datadir: PathBuf,

    /// Network whose store to operate on
    #[arg(long, value_name = "NAME", default_value = "mainnet")]
    pub network: String,
}

impl StoreOpts {
    /// The per-network database directory.
    pub fn db_dir(&self) -> PathBuf {
        self.datadir.join(&self.network)
    }

    /// Opens the backing store.
    pub fn open_store(&self) -> Result<Arc<FileDb>> {
        let path = self.db_dir().join("state.db");
        let db = FileDb::open(&path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        Ok(Arc::new(db))
    }
}

/// Parses a 64-hex-digit state root.
pub fn parse_root(raw: &str) -> Result<Hash> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).context("root is not hex")?;
    Hash::try_from(bytes.as_slice()).map_err(|_| anyhow!("root must be 32 bytes"))
}

/// Resolves the target root: the explicit argument if given, otherwise
/// the root of the persisted account trie.
pub fn resolve_root(store: &dyn KeyValueReader, arg: Option<&String>) -> Result<Hash> {
    if let Some(raw) = arg {
        return parse_root(raw);
    }
    match schema::read_account_trie_node(store, &[])? {
        Some(blob) if !blob.is_empty() => Ok(Hash::of(&blob)),
        _ => Err(anyhow!("store holds no persisted state")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, cli.log_level.to_string()),
    );

    let result = match &cli.command {
        Commands::PruneState(opts) => prune::run(opts),
        Commands::VerifyState(opts) => verify::run(opts),
        Commands::TraverseState(opts) => traverse::state(opts),
        Commands::TraverseRawstate(opts) => traverse::rawstate(opts),
        Commands::TraverseTree(opts) => traverse::tree(opts),
        Commands::TraverseBrokendb(opts) => traverse::brokendb(opts),
    };
    match result {
        Err(e) => {
            eprintln!("{e}");
            process::exit(1)
        }
        Ok(()) => Ok(()),
    }
}
