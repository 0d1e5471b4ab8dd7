//! # HpFile — head-prunable segmented file
//!
//! An append-only byte log that is logically a single growing sequence of
//! bytes but physically a sorted set of fixed-size segment files inside one
//! directory. Segments are named `<id>-<segment_size>`; every segment is
//! exactly `segment_size` bytes long except the highest-id one, which grows
//! until it reaches `segment_size` and is then sealed.
//!
//! The log supports four things a plain file cannot give us at once:
//!
//! - **Random reads** at absolute offsets, including reads that straddle a
//!   segment boundary.
//! - **Buffered appends**: writes are absorbed by an in-memory buffer
//!   (default 1 MiB) and flushed to disk in large chunks.
//! - **Head pruning**: the lowest-id segments can be unlinked wholesale,
//!   reclaiming disk space without rewriting the survivors. Logical offsets
//!   of surviving bytes never change.
//! - **Tail truncation**: the log can be cut back to an earlier size, used
//!   when recovering from a crash.
//!
//! There is a single writer. Reads take `&self` and use positional I/O, so
//! they may run concurrently with each other; a read of bytes still sitting
//! in the write buffer is served from memory.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default size of the in-memory write buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HpFileError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("file name {0:?} does not match the pattern '<id>-<segment-size>'")]
    BadFileName(String),
    #[error("segment {name:?} declares size {found}, this log uses {expected}")]
    SegmentSizeMismatch {
        name: String,
        found: u64,
        expected: u64,
    },
    #[error("no segment holds offset {0}")]
    MissingSegment(u64),
    #[error("read of {want} bytes at offset {off} runs past the end of the log ({size})")]
    ReadPastEnd { off: u64, want: usize, size: u64 },
}

#[derive(Debug)]
pub struct HpFile {
    dir: PathBuf,
    segment_size: u64,
    buffer_size: usize,
    /// Open segment handles; the highest id is the active (writable) one.
    segments: BTreeMap<u64, File>,
    largest_id: u64,
    /// Bytes durably written into the active segment (excludes the buffer).
    written_in_active: u64,
    /// Appended bytes not yet written to the active segment.
    buffer: Vec<u8>,
}

impl HpFile {
    /// Opens (or creates) a segmented log in `dir`.
    ///
    /// Every existing file in the directory must parse as
    /// `<id>-<segment_size>` with a size part equal to `segment_size`.
    /// If the directory holds no segments, segment 0 is created.
    pub fn open(
        segment_size: u64,
        buffer_size: usize,
        dir: impl AsRef<Path>,
    ) -> Result<Self, HpFileError> {
        assert!(segment_size > 0, "segment size must be positive");
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut ids = Vec::new();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            if dirent.file_type()?.is_dir() {
                continue;
            }
            let name = dirent.file_name().to_string_lossy().into_owned();
            let (id_part, size_part) = name
                .split_once('-')
                .ok_or_else(|| HpFileError::BadFileName(name.clone()))?;
            let id: u64 = id_part
                .parse()
                .map_err(|_| HpFileError::BadFileName(name.clone()))?;
            let found: u64 = size_part
                .parse()
                .map_err(|_| HpFileError::BadFileName(name.clone()))?;
            if found != segment_size {
                return Err(HpFileError::SegmentSizeMismatch {
                    name,
                    found,
                    expected: segment_size,
                });
            }
            ids.push(id);
        }

        let mut hpf = HpFile {
            dir,
            segment_size,
            buffer_size,
            segments: BTreeMap::new(),
            largest_id: 0,
            written_in_active: 0,
            buffer: Vec::with_capacity(buffer_size),
        };

        if ids.is_empty() {
            let f = hpf.open_segment(0, true)?;
            hpf.segments.insert(0, f);
            return Ok(hpf);
        }

        ids.sort_unstable();
        hpf.largest_id = *ids.last().unwrap();
        for id in ids {
            let writable = id == hpf.largest_id;
            let f = hpf.open_segment(id, writable)?;
            if writable {
                hpf.written_in_active = f.metadata()?.len();
            }
            hpf.segments.insert(id, f);
        }
        Ok(hpf)
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}-{}", id, self.segment_size))
    }

    fn open_segment(&self, id: u64, writable: bool) -> Result<File, HpFileError> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if writable {
            opts.write(true).create(true);
        }
        Ok(opts.open(self.segment_path(id))?)
    }

    /// Total logical size of the log, including still-buffered bytes.
    pub fn size(&self) -> u64 {
        self.largest_id * self.segment_size + self.written_in_active + self.buffer.len() as u64
    }

    /// Logical offset below which all bytes are on disk.
    pub fn flushed_size(&self) -> u64 {
        self.largest_id * self.segment_size + self.written_in_active
    }

    /// Appends the concatenation of `chunks`, returning the absolute offset
    /// of the first appended byte. The bytes land in the write buffer; the
    /// buffer is drained to disk once it reaches the configured size,
    /// sealing and rolling segments as needed.
    pub fn append(&mut self, chunks: &[&[u8]]) -> Result<u64, HpFileError> {
        let off = self.size();
        for chunk in chunks {
            self.buffer.extend_from_slice(chunk);
        }
        if self.buffer.len() >= self.buffer_size {
            self.drain_buffer()?;
        }
        Ok(off)
    }

    /// Writes every buffered byte to the active segment, rolling over to a
    /// fresh segment whenever the active one fills. Overflow bytes carry
    /// forward as the initial content of the new segment.
    fn drain_buffer(&mut self) -> Result<(), HpFileError> {
        let buf = std::mem::take(&mut self.buffer);
        let mut data = &buf[..];
        while !data.is_empty() {
            let room = (self.segment_size - self.written_in_active) as usize;
            let n = room.min(data.len());
            let active = self
                .segments
                .get(&self.largest_id)
                .expect("active segment is always open");
            active.write_all_at(&data[..n], self.written_in_active)?;
            self.written_in_active += n as u64;
            data = &data[n..];
            if self.written_in_active == self.segment_size {
                // Seal the filled segment and start the next one.
                active.sync_all()?;
                self.largest_id += 1;
                let f = self.open_segment(self.largest_id, true)?;
                self.segments.insert(self.largest_id, f);
                self.written_in_active = 0;
            }
        }
        self.buffer = buf;
        self.buffer.clear();
        Ok(())
    }

    /// Fills `buf` with the bytes at absolute offset `off`. Reads may cross
    /// segment boundaries and may extend into the unflushed buffer tail.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<(), HpFileError> {
        if off + buf.len() as u64 > self.size() {
            return Err(HpFileError::ReadPastEnd {
                off,
                want: buf.len(),
                size: self.size(),
            });
        }
        let flushed = self.flushed_size();
        let (disk_part, mem_part) = if off >= flushed {
            (0, buf.len())
        } else {
            let d = ((flushed - off) as usize).min(buf.len());
            (d, buf.len() - d)
        };

        // Disk portion, possibly spanning several segments.
        let mut pos = off;
        let mut done = 0;
        while done < disk_part {
            let id = pos / self.segment_size;
            let in_seg = pos % self.segment_size;
            let n = ((self.segment_size - in_seg) as usize).min(disk_part - done);
            let f = self
                .segments
                .get(&id)
                .ok_or(HpFileError::MissingSegment(pos))?;
            f.read_exact_at(&mut buf[done..done + n], in_seg)?;
            pos += n as u64;
            done += n;
        }

        if mem_part > 0 {
            let start = (off + disk_part as u64 - flushed) as usize;
            buf[disk_part..].copy_from_slice(&self.buffer[start..start + mem_part]);
        }
        Ok(())
    }

    /// Drains the write buffer and fsyncs the active segment.
    pub fn sync(&mut self) -> Result<(), HpFileError> {
        self.drain_buffer()?;
        self.segments
            .get(&self.largest_id)
            .expect("active segment is always open")
            .sync_all()?;
        Ok(())
    }

    /// Cuts the log back to `size` bytes: segments wholly beyond the new
    /// size are unlinked and the new active segment is truncated in place.
    /// Any buffered bytes are discarded first.
    pub fn truncate(&mut self, size: u64) -> Result<(), HpFileError> {
        self.buffer.clear();
        let new_largest = size / self.segment_size;
        let ids: Vec<u64> = self
            .segments
            .range(new_largest + 1..)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.segments.remove(&id);
            std::fs::remove_file(self.segment_path(id))?;
        }
        // The surviving top segment may have been opened read-only.
        let f = self.open_segment(new_largest, true)?;
        f.set_len(size % self.segment_size)?;
        self.segments.insert(new_largest, f);
        self.largest_id = new_largest;
        self.written_in_active = size % self.segment_size;
        Ok(())
    }

    /// Closes and unlinks every segment that lies entirely before `off`.
    /// Bytes at or after `off` stay readable at their original offsets.
    pub fn prune_head(&mut self, off: u64) -> Result<(), HpFileError> {
        let keep_from = off / self.segment_size;
        let ids: Vec<u64> = self
            .segments
            .range(..keep_from)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.segments.remove(&id);
            std::fs::remove_file(self.segment_path(id))?;
        }
        Ok(())
    }

    /// Drains the buffer and closes all handles.
    pub fn close(mut self) -> Result<(), HpFileError> {
        self.drain_buffer()?;
        Ok(())
    }
}
