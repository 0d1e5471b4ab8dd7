//! Framed entry storage on top of [`HpFile`].
//!
//! Every frame starts at an 8-byte-aligned offset with the magic
//! `ILOVEYOU`, followed by the escaped frame body produced by
//! [`entry_to_bytes`](crate::entry::entry_to_bytes) and zero padding to the
//! next 8-byte boundary. The escaping guarantee — the magic never occurs
//! inside a valid body — is what lets a recovery scan resynchronize after
//! corruption.

use byteorder::{ByteOrder, LittleEndian};
use hpfile::HpFile;

use crate::entry::{entry_from_bytes, unescape_in_place, Entry, MAGIC, MAX_ENTRY_BYTES};
use crate::hasher::hash;
use crate::twig::Twig;
use crate::{Hash32, TreeError, LEAF_COUNT_IN_TWIG};

fn padding_for(len: usize) -> usize {
    (8 - len % 8) % 8
}

fn aligned_frame_len(total_len: u32) -> u64 {
    let len = 8 + 4 + total_len as u64;
    len + padding_for(len as usize) as u64
}

pub struct EntryFile {
    hpf: HpFile,
}

impl EntryFile {
    pub fn open(
        segment_size: u64,
        buffer_size: usize,
        dir: impl AsRef<std::path::Path>,
    ) -> Result<Self, TreeError> {
        Ok(EntryFile {
            hpf: HpFile::open(segment_size, buffer_size, dir)?,
        })
    }

    pub fn size(&self) -> u64 {
        self.hpf.size()
    }

    /// Appends one serialized frame body (the output of `entry_to_bytes`),
    /// prefixing the magic and appending alignment padding. The returned
    /// offset is always 8-byte aligned.
    pub fn append_frame(&mut self, body: &[u8]) -> Result<u64, TreeError> {
        // magic, body, zero padding up to the next 8-byte boundary
        let padding = [0u8; 8];
        let off = self
            .hpf
            .append(&[&MAGIC[..], body, &padding[..padding_for(body.len())]])?;
        assert_eq!(off % 8, 0, "entry frames must stay 8-byte aligned");
        Ok(off)
    }

    /// Reads the magic and `total_len` at `off`, validating both.
    fn read_header(&self, off: u64) -> Result<u32, TreeError> {
        let mut buf = [0u8; 12];
        self.hpf.read_at(&mut buf, off)?;
        // magic first; a mismatch means `off` is not a frame boundary
        if buf[..8] != MAGIC {
            return Err(TreeError::BadMagic { off });
        }
        // length next; the cap doubles as a corruption check
        let total_len = LittleEndian::read_u32(&buf[8..]);
        if total_len as usize >= MAX_ENTRY_BYTES {
            return Err(TreeError::FrameTooLarge {
                off,
                len: total_len,
            });
        }
        Ok(total_len)
    }

    /// Parses the frame at `off`. Returns the entry, its deactivation list,
    /// the offset of the next frame, and the 32-byte leaf hash of this frame
    /// (SHA-256 over the body as stored, without magic or padding).
    pub fn read_frame(
        &self,
        off: u64,
    ) -> Result<(Entry, Vec<i64>, u64, Hash32), TreeError> {
        let total_len = self.read_header(off)?;
        // re-read the body including the total_len field
        let mut body = vec![0u8; 4 + total_len as usize];
        self.hpf.read_at(&mut body, off + 8)?;
        // hash before unescaping: the leaf hash covers the bytes as stored
        let leaf_hash = hash(&body);
        // restore escaped magic occurrences, then parse the payload
        let payload_at = unescape_in_place(&mut body[4..], off)?;
        let (entry, deactivated) = entry_from_bytes(&body[4 + payload_at..], off)?;
        Ok((entry, deactivated, off + aligned_frame_len(total_len), leaf_hash))
    }

    /// Reads only the entry at `off`.
    pub fn read_entry(&self, off: u64) -> Result<Entry, TreeError> {
        let (entry, _, _, _) = self.read_frame(off)?;
        Ok(entry)
    }

    /// Validates the header at `off` and returns the next frame's offset
    /// without touching the payload.
    pub fn skip_frame(&self, off: u64) -> Result<u64, TreeError> {
        let total_len = self.read_header(off)?;
        Ok(off + aligned_frame_len(total_len))
    }

    /// Walks all 2048 frames of a twig starting at its first entry,
    /// returning the entries whose active bit is set and skipping the rest.
    pub fn active_entries_in_twig(&self, twig: &Twig) -> Result<Vec<Entry>, TreeError> {
        let mut entries = Vec::new();
        let mut off = twig.first_entry_pos;
        for i in 0..LEAF_COUNT_IN_TWIG as usize {
            if twig.get_bit(i) {
                let (entry, _, next, _) = self.read_frame(off)?;
                entries.push(entry);
                off = next;
            } else {
                off = self.skip_frame(off)?;
            }
        }
        Ok(entries)
    }

    /// Sequentially visits every frame in `[from, to)`, calling the handler
    /// with the frame offset, entry, deactivation list, and leaf hash.
    pub fn scan_range<F>(&self, from: u64, to: u64, mut handler: F) -> Result<(), TreeError>
    where
        F: FnMut(u64, Entry, Vec<i64>, Hash32) -> Result<(), TreeError>,
    {
        let mut off = from;
        while off < to {
            let (entry, deactivated, next, leaf_hash) = self.read_frame(off)?;
            handler(off, entry, deactivated, leaf_hash)?;
            off = next;
        }
        Ok(())
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
