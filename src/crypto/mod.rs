//! Hashing utilities
//!
//! This module provides:
//! - SHA-256 hashing
//! - Leading-zero-bit difficulty checks
//! - Network id derivation

pub mod hash;

pub use hash::{
    leading_zero_bits, meets_difficulty, network_id, sha256, sha256_hex, NETWORK_ID_LEN,
};
