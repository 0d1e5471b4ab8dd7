//! Batched SHA-256 hashing.
//!
//! Tree syncing proceeds in phases where many independent pair hashes are
//! known up front. Callers queue `(level, left, right)` jobs and call
//! [`Hasher::run`], which returns all digests in submission order — serially
//! for small batches, via rayon for large ones. `run` does not return until
//! every queued job is done, which is the phase barrier the tree relies on.

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::Hash32;

/// Below this many jobs, thread fan-out costs more than it saves.
const SERIAL_THRESHOLD: usize = 100;
/// Minimum jobs handed to any one worker.
const MIN_JOBS_PER_WORKER: usize = 20;

/// Plain SHA-256, used for entry leaf hashes.
pub fn hash(data: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Domain-separated pair hash: `SHA256(level || a || b)`.
pub fn hash2(level: u8, a: &[u8], b: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update([level]);
    h.update(a);
    h.update(b);
    h.finalize().into()
}

struct HashJob {
    level: u8,
    left: Hash32,
    right: Hash32,
}

impl HashJob {
    fn run(&self) -> Hash32 {
        hash2(self.level, &self.left, &self.right)
    }
}

/// Collects pair-hash jobs and evaluates them as one batch.
#[derive(Default)]
pub struct Hasher {
    jobs: Vec<HashJob>,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher::default()
    }

    /// Queues `SHA256(level || left || right)`. Inputs are copied; both must
    /// be 32 bytes.
    pub fn add(&mut self, level: u8, left: &[u8], right: &[u8]) {
        let mut job = HashJob {
            level,
            left: [0; 32],
            right: [0; 32],
        };
        job.left.copy_from_slice(left);
        job.right.copy_from_slice(right);
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Evaluates every queued job, returning digests in submission order.
    /// Blocks until the whole batch is finished; the hasher is left empty.
    pub fn run(&mut self) -> Vec<Hash32> {
        let jobs = std::mem::take(&mut self.jobs);
        if jobs.len() < SERIAL_THRESHOLD {
            jobs.iter().map(HashJob::run).collect()
        } else {
            jobs.par_iter()
                .with_min_len(MIN_JOBS_PER_WORKER)
                .map(HashJob::run)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash2_is_domain_separated() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(hash2(0, &a, &b), hash2(1, &a, &b));
        assert_ne!(hash2(0, &a, &b), hash2(0, &b, &a));
    }

    #[test]
    fn batch_matches_direct_computation() {
        let mut h = Hasher::new();
        let mut expected = Vec::new();
        for i in 0u8..10 {
            let left = [i; 32];
            let right = [i.wrapping_add(1); 32];
            h.add(i, &left, &right);
            expected.push(hash2(i, &left, &right));
        }
        assert_eq!(h.run(), expected);
        assert!(h.is_empty());
    }

    #[test]
    fn large_batch_keeps_submission_order() {
        let mut h = Hasher::new();
        let mut expected = Vec::new();
        for i in 0u32..5000 {
            let mut left = [0u8; 32];
            left[..4].copy_from_slice(&i.to_le_bytes());
            let right = [0xAB; 32];
            h.add((i % 12) as u8, &left, &right);
            expected.push(hash2((i % 12) as u8, &left, &right));
        }
        assert_eq!(h.run(), expected);
    }
}
