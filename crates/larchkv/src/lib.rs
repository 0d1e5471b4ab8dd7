//! # LarchKV — authenticated, versioned key-value store
//!
//! Every committed block produces a SHA-256 root hash covering all live
//! key-value pairs. Writes append immutable entries to a head-prunable log;
//! overwrites and deletes merely flip liveness bits in the Merkle tree, so
//! old entries stay on disk until compaction rewrites the survivors and the
//! dead head of the log is pruned in twig-sized units.
//!
//! ## Pieces
//!
//! - [`datatree`] — the entry log and Merkle tree (the authenticated core);
//! - [`indextree`] — volatile ordered index from key to entry offset,
//!   rebuilt at startup by scanning live entries;
//! - [`metadb`] — durable scalars committed once per block;
//! - [`Store`] (this crate) — the block write driver tying them together:
//!   key linkage through `next_key`, reaping, pruning, recovery.
//!
//! ## Usage
//!
//! ```no_run
//! use larchkv::{Store, StoreConfig};
//!
//! let mut store = Store::open("./db", StoreConfig::default()).unwrap();
//! store.begin_block(1);
//! store.set(b"alice", b"100");
//! store.set(b"bob", b"250");
//! let root = store.end_block().unwrap();
//! assert_eq!(store.get(b"alice").unwrap().as_deref(), Some(&b"100"[..]));
//! let _ = root; // commit the root into your block header
//! store.close().unwrap();
//! ```
//!
//! Keys must be strictly between the two guard keys (by default: non-empty,
//! and lexicographically below 255 bytes of `0xFF`).

mod store;

pub use store::{Store, StoreConfig};

pub use datatree::Hash32;
