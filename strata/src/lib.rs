// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! # strata
//!
//! A layered, authenticated state database for blockchain nodes.
//!
//! The store keeps the current state in a single persistent disk layer
//! and stacks one in-memory diff layer per committed block on top of
//! it, so recent transitions stay cheap to apply and cheap to undo:
//!
//! - **commits** merge diff layers into a write-aggregating node buffer
//!   that only touches disk once its allowance runs out;
//! - **state histories** record the pre-image of everything a
//!   transition mutated in an append-only freezer, driving reverts
//!   across short reorganizations;
//! - a **flat snapshot** of current state is kept alongside the trie
//!   for fast random reads, lazily (re)built by a background generator
//!   that proves each segment against the trie;
//! - the **offline pruner** reconstructs the live state into a bloom
//!   filter and sweeps everything else out of the store;
//! - a **journal** carries the unflushed layer stack across restarts.
//!
//! The authenticated trie itself is a collaborator behind the traits in
//! [trie]; [trie::mem] ships a reference implementation used by tests
//! and tooling.

mod account;
mod buffer;
mod db;
mod difflayer;
mod disklayer;
mod error;
mod generator;
mod history;
mod journal;
mod layer;
mod node;
mod pruner;
mod reader;
mod stateset;
mod tree;
pub mod trie;
mod types;

pub use account::Account;
pub use buffer::DEFAULT_BUFFER_LIMIT;
pub use db::{Config, Database};
pub use error::{Error, Result};
pub use history::{
    read_history, truncate_head, truncate_tail, History, HistoryMeta, HISTORY_TABLES,
};
pub use node::{Node, NodeSet, PathMap};
pub use pruner::{
    bloom_file_path, find_bloom_file, verify_state, walk_snapshot, Pruner, StateBloom,
};
pub use reader::StateReader;
pub use stateset::{StateSet, StateSetWithOrigin};
pub use types::{increase_key, Hash, StateId, EMPTY_CODE_HASH, EMPTY_ROOT, HASH_LEN};
