//! Persisted leaf Merkle trees of sealed twigs.
//!
//! One fixed-size record per sealed twig on an [`HpFile`]:
//!
//! ```text
//! [first_entry_pos: u64][crc32 of those 8 bytes]        12 bytes
//! [node hash: 32 bytes][crc32 of the hash]   × 4095   4095 × 36 bytes
//! ```
//!
//! The 4095 hashes are the twig's leaf-tree slots 1..=4095 (root first,
//! leaves last). Records are addressed as `twig_id * TWIG_MT_SIZE`, which
//! stays valid after head pruning because the underlying file keeps logical
//! offsets stable. The checksums detect disk corruption only; a mismatch is
//! an integrity error that sends the caller into full recovery.

use byteorder::{ByteOrder, LittleEndian};
use hpfile::HpFile;

use crate::{Hash32, TreeError, TWIG_MT_SIZE};

fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

pub struct TwigMtFile {
    hpf: HpFile,
}

impl TwigMtFile {
    pub fn open(
        segment_size: u64,
        buffer_size: usize,
        dir: impl AsRef<std::path::Path>,
    ) -> Result<Self, TreeError> {
        Ok(TwigMtFile {
            hpf: HpFile::open(segment_size, buffer_size, dir)?,
        })
    }

    pub fn size(&self) -> u64 {
        self.hpf.size()
    }

    /// Appends the record of a freshly sealed twig: its first-entry offset
    /// and leaf-tree slots `mt[1..=4095]`. Called exactly once per twig, in
    /// twig-id order.
    pub fn append_twig(
        &mut self,
        mt: &[Hash32],
        first_entry_pos: u64,
    ) -> Result<(), TreeError> {
        assert_eq!(mt.len(), 4095, "a sealed twig has 4095 tree nodes");
        let mut buf = Vec::with_capacity(TWIG_MT_SIZE as usize);
        let mut head = [0u8; 8];
        LittleEndian::write_u64(&mut head, first_entry_pos);
        buf.extend_from_slice(&head);
        buf.extend_from_slice(&crc32(&head).to_le_bytes());
        for node in mt {
            buf.extend_from_slice(node);
            buf.extend_from_slice(&crc32(node).to_le_bytes());
        }
        debug_assert_eq!(buf.len() as u64, TWIG_MT_SIZE);
        self.hpf.append(&[&buf])?;
        Ok(())
    }

    /// The entry-file offset of the twig's first entry.
    pub fn first_entry_pos(&self, twig_id: i64) -> Result<u64, TreeError> {
        let off = twig_id as u64 * TWIG_MT_SIZE;
        let mut buf = [0u8; 12];
        self.hpf.read_at(&mut buf, off)?;
        if crc32(&buf[..8]) != LittleEndian::read_u32(&buf[8..]) {
            return Err(TreeError::ChecksumMismatch {
                context: "twig-mt first_entry_pos",
                off,
            });
        }
        Ok(LittleEndian::read_u64(&buf[..8]))
    }

    /// One node of a sealed twig's leaf tree; `hash_id` in `1..=4095` with
    /// the same indexing as the in-memory youngest-twig array.
    pub fn hash_node(&self, twig_id: i64, hash_id: u16) -> Result<Hash32, TreeError> {
        assert!((1..=4095).contains(&hash_id), "hash_id out of twig tree");
        let off = twig_id as u64 * TWIG_MT_SIZE + 12 + (hash_id as u64 - 1) * 36;
        let mut buf = [0u8; 36];
        self.hpf.read_at(&mut buf, off)?;
        if crc32(&buf[..32]) != LittleEndian::read_u32(&buf[32..]) {
            return Err(TreeError::ChecksumMismatch {
                context: "twig-mt node",
                off,
            });
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&buf[..32]);
        Ok(out)
    }

    pub fn sync(&mut self) -> Result<(), TreeError> {
        Ok(self.hpf.sync()?)
    }

    pub fn truncate(&mut self, size: u64) -> Result<(), TreeError> {
        Ok(self.hpf.truncate(size)?)
    }

    pub fn prune_head(&mut self, off: u64) -> Result<(), TreeError> {
        Ok(self.hpf.prune_head(off)?)
    }

    pub fn close(self) -> Result<(), TreeError> {
        Ok(self.hpf.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_mt(seed: u8) -> Vec<Hash32> {
        (0..4095u16)
            .map(|i| {
                let mut h = [seed; 32];
                h[..2].copy_from_slice(&i.to_le_bytes());
                h
            })
            .collect()
    }

    #[test]
    fn record_roundtrip() {
        let dir = tempdir().unwrap();
        let mut f = TwigMtFile::open(1 << 20, 4096, dir.path()).unwrap();
        let mt0 = fake_mt(0xA0);
        let mt1 = fake_mt(0xB1);
        f.append_twig(&mt0, 0).unwrap();
        f.append_twig(&mt1, 12_345_678).unwrap();
        assert_eq!(f.size(), 2 * TWIG_MT_SIZE);

        assert_eq!(f.first_entry_pos(0).unwrap(), 0);
        assert_eq!(f.first_entry_pos(1).unwrap(), 12_345_678);
        assert_eq!(f.hash_node(0, 1).unwrap(), mt0[0]);
        assert_eq!(f.hash_node(0, 4095).unwrap(), mt0[4094]);
        assert_eq!(f.hash_node(1, 2048).unwrap(), mt1[2047]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let mt = fake_mt(7);
        {
            let mut f = TwigMtFile::open(1 << 20, 4096, dir.path()).unwrap();
            f.append_twig(&mt, 64).unwrap();
            f.sync().unwrap();
        }
        let f = TwigMtFile::open(1 << 20, 4096, dir.path()).unwrap();
        assert_eq!(f.first_entry_pos(0).unwrap(), 64);
        assert_eq!(f.hash_node(0, 100).unwrap(), mt[99]);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempdir().unwrap();
        {
            let mut f = TwigMtFile::open(1 << 20, 4096, dir.path()).unwrap();
            f.append_twig(&fake_mt(1), 8).unwrap();
            f.sync().unwrap();
        }
        // Flip one byte of the first node hash on disk.
        let seg = dir.path().join(format!("0-{}", 1u64 << 20));
        let mut bytes = std::fs::read(&seg).unwrap();
        bytes[12] ^= 0xFF;
        std::fs::write(&seg, &bytes).unwrap();

        let f = TwigMtFile::open(1 << 20, 4096, dir.path()).unwrap();
        assert!(f.first_entry_pos(0).is_ok());
        assert!(matches!(
            f.hash_node(0, 1),
            Err(TreeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn prune_head_keeps_later_records_addressable() {
        let dir = tempdir().unwrap();
        // Segment small enough that two records span several segments.
        let mut f = TwigMtFile::open(TWIG_MT_SIZE, 4096, dir.path()).unwrap();
        for id in 0..4 {
            f.append_twig(&fake_mt(id as u8), id * 1000).unwrap();
        }
        f.sync().unwrap();
        f.prune_head(2 * TWIG_MT_SIZE).unwrap();
        assert_eq!(f.first_entry_pos(2).unwrap(), 2000);
        assert_eq!(f.first_entry_pos(3).unwrap(), 3000);
        assert!(f.first_entry_pos(0).is_err());
    }
}
