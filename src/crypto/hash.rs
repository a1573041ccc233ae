//! Hashing utilities for the overlay
//!
//! Provides the SHA-256 digest used for broadcast proof-of-work, the
//! leading-zero-bit difficulty measure, and network id derivation.

use sha2::{Digest, Sha256};

/// Size of a network id in bytes
pub const NETWORK_ID_LEN: usize = 16;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Counts the leading zero bits of a digest
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut zeros = 0;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Checks if a hash meets the difficulty target
/// The hash must have at least `difficulty` leading zero bits
pub fn meets_difficulty(hash: &[u8], difficulty: u32) -> bool {
    let required_zeros = difficulty as usize / 8;
    let remaining_bits = difficulty as usize % 8;

    if required_zeros > hash.len() || (required_zeros == hash.len() && remaining_bits > 0) {
        return false;
    }

    // Check full zero bytes
    for byte in hash.iter().take(required_zeros) {
        if *byte != 0 {
            return false;
        }
    }

    // Check remaining bits
    if remaining_bits > 0 {
        let mask = 0xFFu8 << (8 - remaining_bits);
        if hash[required_zeros] & mask != 0 {
            return false;
        }
    }

    true
}

/// Derives the 16-byte network id for a network name
///
/// The id is the first half of the SHA-256 digest of the UTF-8 name.
pub fn network_id(name: &str) -> [u8; NETWORK_ID_LEN] {
    let digest = sha256(name.as_bytes());
    let mut id = [0u8; NETWORK_ID_LEN];
    id.copy_from_slice(&digest[..NETWORK_ID_LEN]);
    id
}
