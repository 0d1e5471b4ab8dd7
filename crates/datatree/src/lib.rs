//! # datatree — the authenticated entry log of LarchKV
//!
//! A hybrid of an append-only log and a perfect binary Merkle tree. Leaves
//! are serialized entries; the interior covers both entry hashes and
//! per-entry liveness bits, so overwrites and deletes change the root
//! without rewriting history. Entries are grouped into **twigs** of 2048:
//!
//! ```text
//!                          global root            level L
//!                        /            \
//!                      ...   sparse upper tree   levels 13..L
//!                      /  \
//!             twig root    twig root              level 12
//!             /       \
//!     leaf-MT root   active-bits MT               level 11
//!     2048 entry     2048 liveness bits
//!     hashes         (3 hash levels)
//! ```
//!
//! On disk the tree is two head-prunable segmented files — the framed entry
//! log (`entries/`) and the per-twig Merkle records (`twigmt/`) — plus three
//! sidecar dumps rewritten on clean shutdown. After a crash, the sidecars
//! are discarded and the whole in-memory state is replayed from the entry
//! file, reattaching to previously pruned history via edge nodes.

mod dump;
mod entry;
mod entryfile;
mod hasher;
mod recover;
mod tree;
mod twig;
mod twigmtfile;

pub use dump::{
    bytes_to_edge_nodes, edge_nodes_to_bytes, EdgeNode, MT4YT_FILE, NODES_FILE, TWIGS_FILE,
};
pub use entry::{entry_from_frame_body, entry_to_bytes, Entry, MAGIC, MAX_ENTRY_BYTES};
pub use entryfile::EntryFile;
pub use hasher::{hash, hash2, Hasher};
pub use tree::{
    max_level_for, node_pos, pos_index, pos_level, Tree, TreeConfig, ENTRIES_DIR, TWIG_MT_DIR,
};
pub use twig::{null_mt_for_twig, null_node_at_level, null_twig, Twig};
pub use twigmtfile::TwigMtFile;

use thiserror::Error;

/// A 32-byte SHA-256 digest.
pub type Hash32 = [u8; 32];

/// Low bits of a serial number that index inside a twig.
pub const TWIG_SHIFT: i64 = 11;
/// Entries per twig.
pub const LEAF_COUNT_IN_TWIG: i64 = 1 << TWIG_SHIFT;
pub const TWIG_MASK: i64 = LEAF_COUNT_IN_TWIG - 1;

/// First upper-tree level: parents of pairs of twig roots.
pub const FIRST_LEVEL_ABOVE_TWIG: u8 = 13;

/// Minimum number of twigs pruned at once.
pub const MIN_PRUNE_COUNT: i64 = 4;

/// On-disk size of one sealed twig's Merkle record.
pub const TWIG_MT_SIZE: u64 = 12 + 4095 * 36;

/// Soft cap on the in-memory deactivation list; past it the store appends a
/// dummy entry just to flush the list, bounding frame sizes.
pub const DEACT_LIST_MAX_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    HpFile(#[from] hpfile::HpFileError),
    #[error("bad magic bytes at offset {off}")]
    BadMagic { off: u64 },
    #[error("frame at offset {off} declares length {len}, past the 2^24-1 cap")]
    FrameTooLarge { off: u64, len: u32 },
    #[error("bad escape position {pos} in frame at offset {off}")]
    BadEscapePos { off: u64, pos: u32 },
    #[error("truncated or inconsistent frame at offset {off}")]
    TruncatedFrame { off: u64 },
    #[error("checksum mismatch in {context} at offset {off}")]
    ChecksumMismatch { context: &'static str, off: u64 },
    #[error("sidecar file {file} is corrupt")]
    SidecarCorrupt { file: &'static str },
    #[error("missing upper-tree node at level {level} index {index}")]
    MissingUpperNode { level: u8, index: i64 },
    #[error("hash mismatch in {context} for id {id}")]
    HashMismatch { context: &'static str, id: i64 },
    #[error("edge-node blob length {0} is not a multiple of 40")]
    BadEdgeNodeBlob(usize),
}
