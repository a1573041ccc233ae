//! Bloom filter for broadcast loop suppression
//!
//! Every accepted broadcast frame is recorded here. A false positive drops a
//! fresh broadcast, which only costs one re-flood; a false negative cannot
//! happen. The filter is never cleared: it is sized once and tolerates a
//! growing false-positive rate.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Default filter size (in bytes)
pub const DEFAULT_BLOOM_BYTES: usize = 1024 * 1024;

/// Default target false positive rate
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.5;

/// Maximum number of hash functions
const MAX_HASH_FUNCS: u32 = 32;

/// Thread-safe bloom filter with atomic check-and-insert
#[derive(Debug)]
pub struct BloomFilter {
    /// Filter data (bit array)
    bits: Mutex<Vec<u64>>,
    /// Number of addressable bits
    size_bits: u64,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
}

impl BloomFilter {
    /// Create a filter of `size_bytes` tuned for the given false positive rate
    ///
    /// The hash count is the optimum for a filter at its design load,
    /// `k = -log2(p)`, so a rate of 0.5 uses a single hash function.
    pub fn new(size_bytes: usize, fp_rate: f64) -> Self {
        let words = size_bytes.div_ceil(8).max(1);
        let hash_funcs = if fp_rate > 0.0 && fp_rate < 1.0 {
            (-fp_rate.log2()).round() as u32
        } else {
            1
        };

        Self {
            bits: Mutex::new(vec![0u64; words]),
            size_bits: words as u64 * 64,
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak: rand::random(),
        }
    }

    /// Number of hash functions in use
    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    /// Size of the bit array
    pub fn size_bits(&self) -> u64 {
        self.size_bits
    }

    /// Insert `data`, returning `true` if it was not already present
    ///
    /// Check and insert happen under one lock, so when several connections
    /// race to add the same frame exactly one of them sees `true`.
    pub fn add(&self, data: &[u8]) -> bool {
        let indexes = self.indexes(data);
        let mut bits = self.bits.lock();

        let mut inserted = false;
        for idx in indexes {
            let (word, mask) = ((idx / 64) as usize, 1u64 << (idx % 64));
            if bits[word] & mask == 0 {
                bits[word] |= mask;
                inserted = true;
            }
        }
        inserted
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        let indexes = self.indexes(data);
        let bits = self.bits.lock();
        indexes
            .into_iter()
            .all(|idx| bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0)
    }

    /// Bit positions for `data` via double hashing over one SHA-256 digest
    fn indexes(&self, data: &[u8]) -> Vec<u64> {
        let mut hasher = Sha256::new();
        hasher.update(self.tweak.to_le_bytes());
        hasher.update(data);
        let hash = hasher.finalize();

        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&hash[0..8]);
        h2.copy_from_slice(&hash[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2) | 1;

        (0..self.hash_funcs as u64)
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.size_bits)
            .collect()
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOOM_BYTES, DEFAULT_FALSE_POSITIVE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_add_reports_first_insert() {
        let filter = BloomFilter::new(4096, 0.01);

        assert!(!filter.contains(b"frame-1"));
        assert!(filter.add(b"frame-1"));
        assert!(filter.contains(b"frame-1"));
        assert!(!filter.add(b"frame-1"));
    }

    #[test]
    fn test_hash_count_follows_rate() {
        assert_eq!(BloomFilter::new(1024, 0.5).hash_funcs(), 1);
        assert_eq!(BloomFilter::new(1024, 0.01).hash_funcs(), 7);
        assert_eq!(BloomFilter::new(1024, 0.0).hash_funcs(), 1);
        assert_eq!(BloomFilter::new(1024, 0.5).size_bits(), 8192);
    }

    #[test]
    fn test_concurrent_add_single_winner() {
        let filter = Arc::new(BloomFilter::default());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let filter = Arc::clone(&filter);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if filter.add(b"same broadcast") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
