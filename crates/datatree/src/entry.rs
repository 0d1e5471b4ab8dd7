//! Entry model and the on-disk frame codec.
//!
//! An entry frame, as stored in the entry file (all integers little-endian):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ magic "ILOVEYOU" (8 bytes)                                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ total_len (u32) — excludes magic, itself, and padding        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ escape positions (u32 each), terminated by 0xFFFF_FFFF       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ key_len (u32) | key | value_len (u32) | value                │
//! │ next_key_len (u32) | next_key                                │
//! │ height (i64) | last_height (i64) | serial_num (i64)          │
//! │ deactivated serials (i64 each), terminated by all-ones       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ zero padding to the next 8-byte boundary                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The payload must never contain the magic sequence, or a recovery scan
//! could not resynchronize on frame boundaries. Serialization therefore
//! scans the payload for occurrences of the magic, zeroes the first 8 bytes
//! of each occurrence, and records the occurrence offsets in the escape
//! list (offsets are measured from the end of the `total_len` field).
//! Parsing restores the magic bytes before decoding the payload, so the
//! round trip is exact for arbitrary key/value/next-key contents.

use byteorder::{ByteOrder, LittleEndian};

use crate::TreeError;

/// The 8-byte frame magic.
pub const MAGIC: [u8; 8] = *b"ILOVEYOU";

/// Upper bound on `total_len`; frames at or above this size are corrupt.
pub const MAX_ENTRY_BYTES: usize = (1 << 24) - 1;

const U32_TERM: u32 = u32::MAX;
const U64_TERM: u64 = u64::MAX;

/// One leaf record of the data tree.
///
/// `next_key` links each entry to its successor in key order, which lets the
/// store iterate keys without committing a full index into the Merkle tree.
/// `serial_num` is assigned densely by the store; its low eleven bits locate
/// the entry inside its twig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub next_key: Vec<u8>,
    pub height: i64,
    pub last_height: i64,
    pub serial_num: i64,
}

impl Entry {
    /// The canonical null entry used to pad unpopulated tree regions.
    pub fn null() -> Self {
        Entry {
            key: Vec::new(),
            value: Vec::new(),
            next_key: Vec::new(),
            height: -1,
            last_height: -1,
            serial_num: -1,
        }
    }

    /// A throwaway entry appended only to flush a deactivation list.
    pub fn dummy(serial_num: i64) -> Self {
        Entry {
            key: b"dummy".to_vec(),
            value: b"dummy".to_vec(),
            next_key: b"dummy".to_vec(),
            height: -2,
            last_height: -2,
            serial_num,
        }
    }
}

fn payload_len(entry: &Entry, deactivated: &[i64]) -> usize {
    4 * 3 + entry.key.len() + entry.value.len() + entry.next_key.len()
        + 8 * 3
        + (deactivated.len() + 1) * 8
}

fn write_payload(buf: &mut [u8], entry: &Entry, deactivated: &[i64]) {
    let mut i = 0;
    LittleEndian::write_u32(&mut buf[i..], entry.key.len() as u32);
    i += 4;
    buf[i..i + entry.key.len()].copy_from_slice(&entry.key);
    i += entry.key.len();

    LittleEndian::write_u32(&mut buf[i..], entry.value.len() as u32);
    i += 4;
    buf[i..i + entry.value.len()].copy_from_slice(&entry.value);
    i += entry.value.len();

    LittleEndian::write_u32(&mut buf[i..], entry.next_key.len() as u32);
    i += 4;
    buf[i..i + entry.next_key.len()].copy_from_slice(&entry.next_key);
    i += entry.next_key.len();

    LittleEndian::write_i64(&mut buf[i..], entry.height);
    i += 8;
    LittleEndian::write_i64(&mut buf[i..], entry.last_height);
    i += 8;
    LittleEndian::write_i64(&mut buf[i..], entry.serial_num);
    i += 8;

    for &sn in deactivated {
        LittleEndian::write_u64(&mut buf[i..], sn as u64);
        i += 8;
    }
    LittleEndian::write_u64(&mut buf[i..], U64_TERM);
}

/// Byte positions of every occurrence of `magic` in `haystack`.
/// Overlapping occurrences resolve left-to-right, skipping past each match,
/// mirroring how the escape pass rewrites them.
fn find_magic_positions(haystack: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut start = 0;
    while start + MAGIC.len() <= haystack.len() {
        match haystack[start..]
            .windows(MAGIC.len())
            .position(|w| w == MAGIC)
        {
            Some(rel) => {
                positions.push(start + rel);
                start += rel + MAGIC.len();
            }
            None => break,
        }
    }
    positions
}

/// Serializes an entry together with its deactivation list into the frame
/// body: everything between the magic and the padding. The returned bytes
/// are exactly what the 32-byte leaf hash covers.
pub fn entry_to_bytes(entry: &Entry, deactivated: &[i64]) -> Vec<u8> {
    // total_len field + empty escape list (terminator only) + payload
    let mut length = 4 + 4 + payload_len(entry, deactivated);
    let mut b = vec![0u8; length];
    const START: usize = 8;
    write_payload(&mut b[START..], entry, deactivated);

    // scan the serialized payload for the magic sequence
    let positions = find_magic_positions(&b[START..]);
    if positions.is_empty() {
        // common case: total_len, empty escape list, done
        LittleEndian::write_u32(&mut b[..4], (length - 4) as u32);
        LittleEndian::write_u32(&mut b[4..8], U32_TERM);
        return b;
    }

    // Zero out each occurrence in place, then rebuild with the longer
    // escape list. Recorded positions are relative to the end of the
    // total_len field, i.e. to the start of the escape list itself.
    for &pos in &positions {
        b[START + pos..START + pos + 8].fill(0);
    }
    // the escape list grows the frame; re-write total_len to match
    length += 4 * positions.len();
    let mut buf = vec![0u8; length];
    LittleEndian::write_u32(&mut buf[..4], (length - 4) as u32);
    // shift each recorded position past the list itself
    let added = 4 * positions.len();
    for (i, &pos) in positions.iter().enumerate() {
        LittleEndian::write_u32(&mut buf[i * 4 + 4..], (pos + added) as u32);
    }
    let term_at = positions.len() * 4 + 4;
    LittleEndian::write_u32(&mut buf[term_at..], U32_TERM);
    // copy the (now magic-free) payload after the terminator
    buf[term_at + 4..].copy_from_slice(&b[8..]);
    buf
}

/// Restores escaped magic occurrences inside a frame body.
///
/// `body` holds the bytes after the `total_len` field (escape list followed
/// by payload), exactly `total_len` bytes long. Returns the offset where the
/// payload starts. `frame_off` only feeds error reporting.
pub fn unescape_in_place(body: &mut [u8], frame_off: u64) -> Result<usize, TreeError> {
    let mut n = 0;
    loop {
        if n + 4 > body.len() {
            return Err(TreeError::TruncatedFrame { off: frame_off });
        }
        let pos = LittleEndian::read_u32(&body[n..]);
        n += 4;
        if pos == U32_TERM {
            break; // end of escape list
        }
        if pos as usize >= MAX_ENTRY_BYTES {
            return Err(TreeError::BadEscapePos {
                off: frame_off,
                pos,
            });
        }
        // positions count from the end of total_len; body starts 4 later
        let at = pos as usize + 4;
        if at + 8 > body.len() {
            return Err(TreeError::BadEscapePos {
                off: frame_off,
                pos,
            });
        }
        // put the magic back where the writer zeroed it
        body[at..at + 8].copy_from_slice(&MAGIC);
    }
    Ok(n)
}

/// Parses an unescaped payload back into an entry and its deactivation list.
pub fn entry_from_bytes(payload: &[u8], frame_off: u64) -> Result<(Entry, Vec<i64>), TreeError> {
    let truncated = || TreeError::TruncatedFrame { off: frame_off };
    let mut i = 0;

    let mut read_bytes = |payload: &[u8], i: &mut usize| -> Result<Vec<u8>, TreeError> {
        if *i + 4 > payload.len() {
            return Err(truncated());
        }
        let len = LittleEndian::read_u32(&payload[*i..]) as usize;
        *i += 4;
        if *i + len > payload.len() {
            return Err(truncated());
        }
        let out = payload[*i..*i + len].to_vec();
        *i += len;
        Ok(out)
    };

    let key = read_bytes(payload, &mut i)?;
    let value = read_bytes(payload, &mut i)?;
    let next_key = read_bytes(payload, &mut i)?;

    if i + 24 > payload.len() {
        return Err(truncated());
    }
    let height = LittleEndian::read_i64(&payload[i..]);
    let last_height = LittleEndian::read_i64(&payload[i + 8..]);
    let serial_num = LittleEndian::read_i64(&payload[i + 16..]);
    i += 24;

    let mut deactivated = Vec::new();
    loop {
        if i + 8 > payload.len() {
            return Err(truncated());
        }
        let sn = LittleEndian::read_u64(&payload[i..]);
        i += 8;
        if sn == U64_TERM {
            break;
        }
        deactivated.push(sn as i64);
    }

    Ok((
        Entry {
            key,
            value,
            next_key,
            height,
            last_height,
            serial_num,
        },
        deactivated,
    ))
}

/// Decodes a full frame body (as returned by [`entry_to_bytes`], starting at
/// the `total_len` field) back into the entry and deactivation list.
pub fn entry_from_frame_body(body: &[u8], frame_off: u64) -> Result<(Entry, Vec<i64>), TreeError> {
    if body.len() < 8 {
        return Err(TreeError::TruncatedFrame { off: frame_off });
    }
    let total_len = LittleEndian::read_u32(&body[..4]) as usize;
    if total_len >= MAX_ENTRY_BYTES || 4 + total_len > body.len() {
        return Err(TreeError::TruncatedFrame { off: frame_off });
    }
    let mut inner = body[4..4 + total_len].to_vec();
    let payload_at = unescape_in_place(&mut inner, frame_off)?;
    entry_from_bytes(&inner[payload_at..], frame_off)
}
