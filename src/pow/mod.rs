//! Broadcast proof-of-work
//!
//! Every broadcast carries a nonce whose digest over the whole frame has a
//! configured number of leading zero bits. Producing one costs CPU; checking
//! one costs a single hash. That asymmetry is what throttles flood spam.

pub mod engine;
pub mod work_proof;

pub use engine::{PowError, ProofOfWorkEngine, SolvedCallback, DEFAULT_WORKERS};
pub use work_proof::{assemble, proof_digest, verify, WorkProof, WorkResult, MAX_NONCE_LEN, NONCE_LEN};
