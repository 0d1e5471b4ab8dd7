//! # metadb — small persistent scalars for the LarchKV store
//!
//! The store needs a handful of durable scalars committed atomically at the
//! end of every block: the current height, the serial-number watermark, the
//! reap/prune cursors, file sizes, the edge-node blob from the last prune,
//! and a per-twig first-write height used to decide which twigs are old
//! enough to prune. [`MetaDb`] is the boundary trait; [`FileMetaDb`] keeps
//! everything in memory and rewrites one checksummed file (`meta.dat`) per
//! commit, through a temp file and an atomic rename.
//!
//! File layout (little-endian):
//!
//! ```text
//! [magic "LKVM"] [curr_height i64] [max_serial i64]
//! [oldest_active_twig_id i64] [last_pruned_twig i64]
//! [active_entry_count i64] [entry_file_size u64] [twig_mt_file_size u64]
//! [is_running u8]
//! [twig_height_count u32] ([twig_id i64][height i64])...
//! [edge_nodes_len u32] [edge node bytes]
//! [crc32 over everything above]
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

const META_MAGIC: [u8; 4] = *b"LKVM";

#[derive(Debug, Error)]
pub enum MetaDbError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt metadata file")]
    Corrupt,
}

/// Durable scalar metadata committed once per block.
pub trait MetaDb {
    /// Durably writes the current state; nothing is considered committed
    /// until this returns.
    fn commit(&mut self) -> Result<(), MetaDbError>;

    fn curr_height(&self) -> i64;
    fn set_curr_height(&mut self, height: i64);

    fn entry_file_size(&self) -> u64;
    fn set_entry_file_size(&mut self, size: u64);
    fn twig_mt_file_size(&self) -> u64;
    fn set_twig_mt_file_size(&mut self, size: u64);

    /// The height at which the twig's first entry was written.
    fn twig_height(&self, twig_id: i64) -> Option<i64>;
    fn delete_twig_height(&mut self, twig_id: i64);

    fn last_pruned_twig(&self) -> i64;
    fn set_last_pruned_twig(&mut self, twig_id: i64);

    fn edge_nodes(&self) -> &[u8];
    fn set_edge_nodes(&mut self, blob: Vec<u8>);

    fn max_serial(&self) -> i64;
    /// Bumps the serial watermark, recording the twig first-write height
    /// whenever the serial opens a fresh twig.
    fn incr_max_serial(&mut self);

    fn active_entry_count(&self) -> i64;
    fn incr_active_entry_count(&mut self);
    fn decr_active_entry_count(&mut self);

    fn oldest_active_twig_id(&self) -> i64;
    fn incr_oldest_active_twig_id(&mut self);

    /// True while a store instance is open; still true at startup means the
    /// previous run crashed and sidecars cannot be trusted.
    fn is_running(&self) -> bool;
    fn set_is_running(&mut self, running: bool);
}

/// Single-file implementation of [`MetaDb`].
pub struct FileMetaDb {
    path: PathBuf,
    fresh: bool,

    curr_height: i64,
    max_serial: i64,
    oldest_active_twig_id: i64,
    last_pruned_twig: i64,
    active_entry_count: i64,
    entry_file_size: u64,
    twig_mt_file_size: u64,
    is_running: bool,
    twig_heights: BTreeMap<i64, i64>,
    edge_nodes: Vec<u8>,
}

impl FileMetaDb {
    /// Opens `path`, loading the committed state if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaDbError> {
        let path = path.as_ref().to_path_buf();
        let mut db = FileMetaDb {
            path,
            fresh: true,
            curr_height: 0,
            max_serial: 0,
            oldest_active_twig_id: 0,
            last_pruned_twig: -1,
            active_entry_count: 0,
            entry_file_size: 0,
            twig_mt_file_size: 0,
            is_running: false,
            twig_heights: BTreeMap::new(),
            edge_nodes: Vec::new(),
        };
        match File::open(&db.path) {
            Ok(mut f) => {
                let mut bytes = Vec::new();
                f.read_to_end(&mut bytes)?;
                db.parse(&bytes)?;
                db.fresh = false;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(db)
    }

    /// True when no committed metadata existed at open time.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    fn parse(&mut self, bytes: &[u8]) -> Result<(), MetaDbError> {
        // magic + 5 i64 + 2 u64 + flag + two counts + crc
        if bytes.len() < 4 + 7 * 8 + 1 + 4 + 4 + 4 {
            return Err(MetaDbError::Corrupt);
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut h = crc32fast::Hasher::new();
        h.update(body);
        if h.finalize() != LittleEndian::read_u32(crc_bytes) {
            return Err(MetaDbError::Corrupt);
        }
        if body[..4] != META_MAGIC {
            return Err(MetaDbError::Corrupt);
        }
        let mut i = 4;
        let mut read_i64 = |i: &mut usize| {
            let v = LittleEndian::read_i64(&body[*i..]);
            *i += 8;
            v
        };
        self.curr_height = read_i64(&mut i);
        self.max_serial = read_i64(&mut i);
        self.oldest_active_twig_id = read_i64(&mut i);
        self.last_pruned_twig = read_i64(&mut i);
        self.active_entry_count = read_i64(&mut i);
        self.entry_file_size = LittleEndian::read_u64(&body[i..]);
        i += 8;
        self.twig_mt_file_size = LittleEndian::read_u64(&body[i..]);
        i += 8;
        self.is_running = body[i] != 0;
        i += 1;

        let count = LittleEndian::read_u32(&body[i..]) as usize;
        i += 4;
        if body.len() < i + count * 16 + 4 {
            return Err(MetaDbError::Corrupt);
        }
        self.twig_heights.clear();
        for _ in 0..count {
            let twig_id = LittleEndian::read_i64(&body[i..]);
            let height = LittleEndian::read_i64(&body[i + 8..]);
            i += 16;
            self.twig_heights.insert(twig_id, height);
        }
        let blob_len = LittleEndian::read_u32(&body[i..]) as usize;
        i += 4;
        if body.len() != i + blob_len {
            return Err(MetaDbError::Corrupt);
        }
        self.edge_nodes = body[i..].to_vec();
        Ok(())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.twig_heights.len() * 16 + self.edge_nodes.len());
        out.extend_from_slice(&META_MAGIC);
        for v in [
            self.curr_height,
            self.max_serial,
            self.oldest_active_twig_id,
            self.last_pruned_twig,
            self.active_entry_count,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.entry_file_size.to_le_bytes());
        out.extend_from_slice(&self.twig_mt_file_size.to_le_bytes());
        out.push(self.is_running as u8);
        out.extend_from_slice(&(self.twig_heights.len() as u32).to_le_bytes());
        for (&twig_id, &height) in &self.twig_heights {
            out.extend_from_slice(&twig_id.to_le_bytes());
            out.extend_from_slice(&height.to_le_bytes());
        }
        out.extend_from_slice(&(self.edge_nodes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.edge_nodes);
        let mut h = crc32fast::Hasher::new();
        h.update(&out);
        out.extend_from_slice(&h.finalize().to_le_bytes());
        out
    }
}

impl MetaDb for FileMetaDb {
    fn commit(&mut self) -> Result<(), MetaDbError> {
        let tmp = self.path.with_extension("tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(&self.serialize())?;
        f.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        self.fresh = false;
        Ok(())
    }

    fn curr_height(&self) -> i64 {
        self.curr_height
    }

    fn set_curr_height(&mut self, height: i64) {
        self.curr_height = height;
    }

    fn entry_file_size(&self) -> u64 {
        self.entry_file_size
    }

    fn set_entry_file_size(&mut self, size: u64) {
        self.entry_file_size = size;
    }

    fn twig_mt_file_size(&self) -> u64 {
        self.twig_mt_file_size
    }

    fn set_twig_mt_file_size(&mut self, size: u64) {
        self.twig_mt_file_size = size;
    }

    fn twig_height(&self, twig_id: i64) -> Option<i64> {
        self.twig_heights.get(&twig_id).copied()
    }

    fn delete_twig_height(&mut self, twig_id: i64) {
        self.twig_heights.remove(&twig_id);
    }

    fn last_pruned_twig(&self) -> i64 {
        self.last_pruned_twig
    }

    fn set_last_pruned_twig(&mut self, twig_id: i64) {
        self.last_pruned_twig = twig_id;
    }

    fn edge_nodes(&self) -> &[u8] {
        &self.edge_nodes
    }

    fn set_edge_nodes(&mut self, blob: Vec<u8>) {
        self.edge_nodes = blob;
    }

    fn max_serial(&self) -> i64 {
        self.max_serial
    }

    fn incr_max_serial(&mut self) {
        if self.max_serial % datatree::LEAF_COUNT_IN_TWIG == 0 {
            self.twig_heights
                .insert(self.max_serial >> datatree::TWIG_SHIFT, self.curr_height);
        }
        self.max_serial += 1;
    }

    fn active_entry_count(&self) -> i64 {
        self.active_entry_count
    }

    fn incr_active_entry_count(&mut self) {
        self.active_entry_count += 1;
    }

    fn decr_active_entry_count(&mut self) {
        self.active_entry_count -= 1;
    }

    fn oldest_active_twig_id(&self) -> i64 {
        self.oldest_active_twig_id
    }

    fn incr_oldest_active_twig_id(&mut self) {
        self.oldest_active_twig_id += 1;
    }

    fn is_running(&self) -> bool {
        self.is_running
    }

    fn set_is_running(&mut self, running: bool) {
        self.is_running = running;
    }
}
