//! Single-worker nonce search
//!
//! A worker owns one slice of the nonce space: every candidate nonce starts
//! with the worker's index byte, followed by an 8-byte big-endian counter.
//! The digest covers `source ‖ nonce`, which is exactly the byte sequence a
//! receiver reconstructs from the wire frame (header, payload, nonce).

use crate::crypto::meets_difficulty;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

/// Nonce produced by this crate: worker index + 8-byte counter
pub const NONCE_LEN: usize = 9;

/// Longest nonce a receiver accepts
pub const MAX_NONCE_LEN: usize = 16;

/// Attempts between cancellation checks
const BATCH_SIZE: u64 = 4096;

/// Outcome of a successful search
#[derive(Debug, Clone)]
pub struct WorkResult {
    /// Winning nonce (worker index + counter)
    pub nonce: Vec<u8>,
    /// Number of digests computed
    pub attempts: u64,
}

/// Nonce search over one worker's slice of the nonce space
pub struct WorkProof<'a> {
    source: &'a [u8],
    worker: u8,
    difficulty: u32,
    start: u64,
}

impl<'a> WorkProof<'a> {
    /// Create a worker starting from a random counter
    pub fn new(source: &'a [u8], worker: u8, difficulty: u32) -> Self {
        Self::with_start(source, worker, difficulty, rand::random())
    }

    pub fn with_start(source: &'a [u8], worker: u8, difficulty: u32, start: u64) -> Self {
        Self {
            source,
            worker,
            difficulty,
            start,
        }
    }

    /// Search until a nonce meets the difficulty or `should_stop` returns true
    ///
    /// `should_stop` is polled once per batch, so cancellation is cooperative
    /// and takes effect within `BATCH_SIZE` attempts.
    pub fn run<F>(&self, should_stop: F) -> Option<WorkResult>
    where
        F: Fn() -> bool,
    {
        let mut prefix = Sha256::new();
        prefix.update(self.source);
        prefix.update([self.worker]);

        let mut counter = self.start;
        let mut attempts = 0u64;

        loop {
            for _ in 0..BATCH_SIZE {
                let mut hasher = prefix.clone();
                hasher.update(counter.to_be_bytes());
                let digest = hasher.finalize();
                attempts += 1;

                if meets_difficulty(&digest, self.difficulty) {
                    let mut nonce = Vec::with_capacity(NONCE_LEN);
                    nonce.push(self.worker);
                    nonce.extend_from_slice(&counter.to_be_bytes());
                    return Some(WorkResult { nonce, attempts });
                }
                counter = counter.wrapping_add(1);
            }

            if should_stop() {
                return None;
            }
        }
    }
}

/// Digest of a broadcast's proof bytes (`source ‖ nonce`)
pub fn proof_digest(source: &[u8], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Check a nonce against a difficulty
pub fn verify(source: &[u8], nonce: &[u8], difficulty: u32) -> bool {
    meets_difficulty(&proof_digest(source, nonce), difficulty)
}

/// Append the nonce trailer (`u8 length ‖ nonce`) to an unsealed broadcast
pub fn assemble(source: &[u8], nonce: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(source.len() + 1 + nonce.len());
    frame.put_slice(source);
    frame.put_u8(nonce.len() as u8);
    frame.put_slice(nonce);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_solution_meets_difficulty() {
        let source = b"header and payload";
        let result = WorkProof::new(source, 3, 8).run(|| false).unwrap();

        assert_eq!(result.nonce.len(), NONCE_LEN);
        assert_eq!(result.nonce[0], 3);
        assert!(result.attempts > 0);
        assert!(verify(source, &result.nonce, 8));
    }

    #[test]
    fn test_zero_difficulty_first_attempt() {
        let result = WorkProof::with_start(b"x", 0, 0, 42).run(|| true).unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(&result.nonce[1..], &42u64.to_be_bytes());
    }

    #[test]
    fn test_stop_is_cooperative() {
        let polls = Cell::new(0);
        let result = WorkProof::new(b"unsolvable", 0, 256).run(|| {
            polls.set(polls.get() + 1);
            polls.get() >= 2
        });

        assert!(result.is_none());
        assert_eq!(polls.get(), 2);
    }

    #[test]
    fn test_assemble_layout() {
        let frame = assemble(b"abc", &[9, 8]);
        assert_eq!(&frame[..], &[b'a', b'b', b'c', 2, 9, 8]);
    }
}
