//! Twig state: the 2048-entry batch unit of the tree.
//!
//! ```text
//!                ____twig_root____                 level 12
//!               /                 \
//!        leaf_mt_root        active_bits_mt_l3     level 11
//!     2048-leaf Merkle       2   active_bits_mt_l2 (sep 10)
//!     tree over entry        4   active_bits_mt_l1 (sep 9)
//!     hashes (seps 0..10)    8×32B  active_bits    (sep 8)
//! ```
//!
//! Each twig carries a 2048-bit liveness vector (one bit per entry slot) and
//! a three-level Merkle tree over it, so that deactivating an entry changes
//! the root without touching the entry log. Bit `i` of the vector lives at
//! `active_bits[i >> 3]`, LSB-first: `mask = 1 << (i & 7)`.

use std::sync::OnceLock;

use crate::entry::{entry_to_bytes, Entry};
use crate::hasher::{hash, hash2};
use crate::{Hash32, LEAF_COUNT_IN_TWIG};

/// Domain separator for the byte row of the active-bits Merkle tree.
pub const ACTIVE_BITS_MT_L1_LEVEL: u8 = 8;
pub const ACTIVE_BITS_MT_L2_LEVEL: u8 = 9;
pub const ACTIVE_BITS_MT_L3_LEVEL: u8 = 10;
/// Domain separator for the twig root, `H(11, l3, leaf_mt_root)`.
pub const TWIG_ROOT_LEVEL: u8 = 11;

#[derive(Clone)]
pub struct Twig {
    pub active_bits: [u8; 256],
    pub active_bits_mt_l1: [Hash32; 4],
    pub active_bits_mt_l2: [Hash32; 2],
    pub active_bits_mt_l3: Hash32,
    pub leaf_mt_root: Hash32,
    pub twig_root: Hash32,
    /// Byte offset in the entry file of this twig's first entry; valid once
    /// the entry at in-twig position 0 has been appended.
    pub first_entry_pos: u64,
}

impl Twig {
    pub fn set_bit(&mut self, offset: usize) {
        assert!(offset < LEAF_COUNT_IN_TWIG as usize, "bit offset out of twig");
        self.active_bits[offset >> 3] |= 1 << (offset & 7);
    }

    pub fn clear_bit(&mut self, offset: usize) {
        assert!(offset < LEAF_COUNT_IN_TWIG as usize, "bit offset out of twig");
        self.active_bits[offset >> 3] &= !(1 << (offset & 7));
    }

    pub fn get_bit(&self, offset: usize) -> bool {
        assert!(offset < LEAF_COUNT_IN_TWIG as usize, "bit offset out of twig");
        self.active_bits[offset >> 3] & (1 << (offset & 7)) != 0
    }

    /// The two 32-byte halves of 512-bit chunk `i` (`i` in `0..4`), the
    /// inputs of `active_bits_mt_l1[i]`.
    pub fn chunk_halves(&self, i: usize) -> (&[u8], &[u8]) {
        let base = 64 * i;
        (
            &self.active_bits[base..base + 32],
            &self.active_bits[base + 32..base + 64],
        )
    }
}

/// Domain separator used when filling the slot at `parent_idx` of a
/// 4096-slot twig leaf tree (root at index 1, leaves at 2048..4096).
/// The eleven rows use separators 0 (bottom pairs) through 10 (root).
pub fn leaf_mt_separator(parent_idx: usize) -> u8 {
    debug_assert!((1..2048).contains(&parent_idx));
    10 - parent_idx.ilog2() as u8
}

static NULL_MT_FOR_TWIG: OnceLock<Box<[Hash32; 4096]>> = OnceLock::new();
static NULL_TWIG: OnceLock<Twig> = OnceLock::new();
static NULL_NODES: OnceLock<[Hash32; 64]> = OnceLock::new();

/// The leaf Merkle tree of a twig populated entirely by null entries.
/// Slot 0 is unused and stays zero.
pub fn null_mt_for_twig() -> &'static [Hash32; 4096] {
    let mt = NULL_MT_FOR_TWIG.get_or_init(|| {
        let mut mt = Box::new([[0u8; 32]; 4096]);
        let leaf = hash(&entry_to_bytes(&Entry::null(), &[]));
        for slot in mt[2048..].iter_mut() {
            *slot = leaf;
        }
        for p in (1..2048).rev() {
            let (l, r) = (mt[2 * p], mt[2 * p + 1]);
            mt[p] = hash2(leaf_mt_separator(p), &l, &r);
        }
        mt
    });
    mt
}

/// The canonical twig with no live entries and all-null leaves. Freshly
/// created twigs start as copies of this; its hashes also stand in for
/// not-yet-existing right siblings during upper-tree syncs.
pub fn null_twig() -> &'static Twig {
    NULL_TWIG.get_or_init(|| {
        let zeros = [0u8; 32];
        let l1 = hash2(ACTIVE_BITS_MT_L1_LEVEL, &zeros, &zeros);
        let l2 = hash2(ACTIVE_BITS_MT_L2_LEVEL, &l1, &l1);
        let l3 = hash2(ACTIVE_BITS_MT_L3_LEVEL, &l2, &l2);
        let leaf_mt_root = null_mt_for_twig()[1];
        let twig_root = hash2(TWIG_ROOT_LEVEL, &l3, &leaf_mt_root);
        Twig {
            active_bits: [0; 256],
            active_bits_mt_l1: [l1; 4],
            active_bits_mt_l2: [l2; 2],
            active_bits_mt_l3: l3,
            leaf_mt_root,
            twig_root,
            first_entry_pos: 0,
        }
    })
}

/// Hash of the all-null subtree rooted at `level`: level 12 is the null twig
/// root, every level above hashes two copies of the level below.
pub fn null_node_at_level(level: u8) -> Hash32 {
    let nodes = NULL_NODES.get_or_init(|| {
        let mut nodes = [[0u8; 32]; 64];
        nodes[12] = null_twig().twig_root;
        for level in 13usize..64 {
            let child = nodes[level - 1];
            nodes[level] = hash2((level - 1) as u8, &child, &child);
        }
        nodes
    });
    nodes[level as usize]
}
