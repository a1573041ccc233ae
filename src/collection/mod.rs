//! Concurrent collections shared by every connection loop
//!
//! - Bloom filter for broadcast de-duplication
//! - Fixed-capacity random set for the public node list

pub mod bloom;
pub mod random_set;

pub use bloom::{BloomFilter, DEFAULT_BLOOM_BYTES, DEFAULT_FALSE_POSITIVE_RATE};
pub use random_set::LimitedRandomSet;
