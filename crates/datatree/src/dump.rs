//! Sidecar persistence for clean shutdowns, plus the edge-node blob codec.
//!
//! On a clean shutdown the tree dumps its volatile state to three files so
//! the next startup can skip the entry-file replay:
//!
//! - `twigs.dat` — every active twig, ascending id, 564-byte records;
//! - `nodes.dat` — every upper-tree node, 44-byte records;
//! - `mtree4yt.dat` — the 4096-slot youngest-twig leaf tree plus checksum.
//!
//! Each file is rewritten in full through a temp file and renamed into
//! place, so a crash mid-dump leaves the previous dump intact (a stale dump
//! is discarded anyway: the store only trusts sidecars after a clean
//! shutdown). Records carry crc32 checksums; any mismatch on load is an
//! integrity error and the caller falls back to full recovery.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use tracing::debug;

use crate::entryfile::EntryFile;
use crate::tree::{Tree, TreeConfig, ENTRIES_DIR, TWIG_MT_DIR};
use crate::twig::{null_mt_for_twig, null_twig, Twig};
use crate::twigmtfile::TwigMtFile;
use crate::{Hash32, TreeError};

pub const TWIGS_FILE: &str = "twigs.dat";
pub const NODES_FILE: &str = "nodes.dat";
pub const MT4YT_FILE: &str = "mtree4yt.dat";

/// A left-spine anchor surviving a prune: packed position plus hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeNode {
    pub pos: i64,
    pub hash: Hash32,
}

const EDGE_NODE_STRIDE: usize = 8 + 32;

pub fn edge_nodes_to_bytes(edge_nodes: &[EdgeNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(edge_nodes.len() * EDGE_NODE_STRIDE);
    for node in edge_nodes {
        let mut pos = [0u8; 8];
        LittleEndian::write_i64(&mut pos, node.pos);
        out.extend_from_slice(&pos);
        out.extend_from_slice(&node.hash);
    }
    out
}

pub fn bytes_to_edge_nodes(bz: &[u8]) -> Result<Vec<EdgeNode>, TreeError> {
    if bz.len() % EDGE_NODE_STRIDE != 0 {
        return Err(TreeError::BadEdgeNodeBlob(bz.len()));
    }
    let mut out = Vec::with_capacity(bz.len() / EDGE_NODE_STRIDE);
    for rec in bz.chunks_exact(EDGE_NODE_STRIDE) {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&rec[8..]);
        out.push(EdgeNode {
            pos: LittleEndian::read_i64(&rec[..8]),
            hash,
        });
    }
    Ok(out)
}

fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

/// Writes `content` via a temp file and atomically renames it into place.
fn atomic_write(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> std::io::Result<()>) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut w = BufWriter::new(File::create(&tmp)?);
    write(&mut w)?;
    w.flush()?;
    w.get_ref().sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn twig_record(twig_id: i64, twig: &Twig) -> [u8; 564] {
    let mut rec = [0u8; 564];
    LittleEndian::write_i64(&mut rec[0..], twig_id);
    LittleEndian::write_u64(&mut rec[8..], twig.first_entry_pos);
    rec[16..272].copy_from_slice(&twig.active_bits);
    for (i, l1) in twig.active_bits_mt_l1.iter().enumerate() {
        rec[272 + 32 * i..272 + 32 * (i + 1)].copy_from_slice(l1);
    }
    for (i, l2) in twig.active_bits_mt_l2.iter().enumerate() {
        rec[400 + 32 * i..400 + 32 * (i + 1)].copy_from_slice(l2);
    }
    rec[464..496].copy_from_slice(&twig.active_bits_mt_l3);
    rec[496..528].copy_from_slice(&twig.leaf_mt_root);
    rec[528..560].copy_from_slice(&twig.twig_root);
    let crc = crc32(&rec[..560]);
    LittleEndian::write_u32(&mut rec[560..], crc);
    rec
}

fn parse_twig_record(rec: &[u8; 564]) -> Result<(i64, Twig), TreeError> {
    if crc32(&rec[..560]) != LittleEndian::read_u32(&rec[560..]) {
        return Err(TreeError::SidecarCorrupt { file: TWIGS_FILE });
    }
    let twig_id = LittleEndian::read_i64(&rec[0..]);
    let mut twig = null_twig().clone();
    twig.first_entry_pos = LittleEndian::read_u64(&rec[8..]);
    twig.active_bits.copy_from_slice(&rec[16..272]);
    for i in 0..4 {
        twig.active_bits_mt_l1[i].copy_from_slice(&rec[272 + 32 * i..272 + 32 * (i + 1)]);
    }
    for i in 0..2 {
        twig.active_bits_mt_l2[i].copy_from_slice(&rec[400 + 32 * i..400 + 32 * (i + 1)]);
    }
    twig.active_bits_mt_l3.copy_from_slice(&rec[464..496]);
    twig.leaf_mt_root.copy_from_slice(&rec[496..528]);
    twig.twig_root.copy_from_slice(&rec[528..560]);
    Ok((twig_id, twig))
}

impl Tree {
    /// Flushes both backing files and rewrites the three sidecars.
    pub fn sync(&mut self) -> Result<(), TreeError> {
        self.entry_file.sync()?;
        self.twig_mt_file.sync()?;

        let mut twig_ids: Vec<i64> = self.active_twigs.keys().copied().collect();
        twig_ids.sort_unstable();
        atomic_write(&self.dir.join(TWIGS_FILE), |w| {
            for &id in &twig_ids {
                w.write_all(&twig_record(id, &self.active_twigs[&id]))?;
            }
            Ok(())
        })?;

        let mut positions: Vec<i64> = self.upper_nodes.keys().copied().collect();
        positions.sort_unstable();
        atomic_write(&self.dir.join(NODES_FILE), |w| {
            for &pos in &positions {
                let mut rec = [0u8; 44];
                LittleEndian::write_i64(&mut rec[0..], pos);
                rec[8..40].copy_from_slice(&self.upper_nodes[&pos]);
                let crc = crc32(&rec[..40]);
                LittleEndian::write_u32(&mut rec[40..], crc);
                w.write_all(&rec)?;
            }
            Ok(())
        })?;

        atomic_write(&self.dir.join(MT4YT_FILE), |w| {
            let mut h = crc32fast::Hasher::new();
            for slot in self.mt4yt.iter() {
                h.update(slot);
                w.write_all(slot)?;
            }
            w.write_all(&h.finalize().to_le_bytes())?;
            Ok(())
        })?;

        debug!(twigs = twig_ids.len(), "dumped sidecars");
        Ok(())
    }

    /// Rebuilds a tree from the sidecars written by [`Tree::sync`].
    pub fn load(cfg: TreeConfig, dir: impl AsRef<Path>) -> Result<Self, TreeError> {
        let dir = dir.as_ref().to_path_buf();
        let entry_file = EntryFile::open(cfg.segment_size, cfg.buffer_size, dir.join(ENTRIES_DIR))?;
        let twig_mt_file =
            TwigMtFile::open(cfg.segment_size, cfg.buffer_size, dir.join(TWIG_MT_DIR))?;

        let mut tree = Tree {
            dir: dir.clone(),
            cfg,
            entry_file,
            twig_mt_file,
            active_twigs: Default::default(),
            upper_nodes: Default::default(),
            youngest_twig_id: 0,
            mt4yt: Box::new(*null_mt_for_twig()),
            mt4yt_change_start: -1,
            mt4yt_change_end: -1,
            touched_chunks: Default::default(),
            deactivated_serials: Vec::new(),
            twigs_to_evict: Vec::new(),
            evicted_roots: Default::default(),
        };

        let mut r = BufReader::new(File::open(dir.join(TWIGS_FILE))?);
        loop {
            let mut rec = [0u8; 564];
            match r.read_exact(&mut rec) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (twig_id, twig) = parse_twig_record(&rec)?;
            tree.youngest_twig_id = tree.youngest_twig_id.max(twig_id);
            tree.active_twigs.insert(twig_id, twig);
        }

        let mut r = BufReader::new(File::open(dir.join(NODES_FILE))?);
        loop {
            let mut rec = [0u8; 44];
            match r.read_exact(&mut rec) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if crc32(&rec[..40]) != LittleEndian::read_u32(&rec[40..]) {
                return Err(TreeError::SidecarCorrupt { file: NODES_FILE });
            }
            let pos = LittleEndian::read_i64(&rec[0..]);
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&rec[8..40]);
            tree.upper_nodes.insert(pos, hash);
        }

        let mut r = BufReader::new(File::open(dir.join(MT4YT_FILE))?);
        let mut h = crc32fast::Hasher::new();
        for slot in tree.mt4yt.iter_mut() {
            r.read_exact(slot)?;
            h.update(slot);
        }
        let stored = r.read_u32::<LittleEndian>()?;
        if stored != h.finalize() {
            return Err(TreeError::SidecarCorrupt { file: MT4YT_FILE });
        }

        debug!(
            twigs = tree.active_twigs.len(),
            youngest = tree.youngest_twig_id,
            "loaded tree from sidecars"
        );
        Ok(tree)
    }
}
