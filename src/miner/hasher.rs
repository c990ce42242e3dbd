//! Proof-of-work hash functions.

use sha2::{Digest, Sha256};

/// Size of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Hashes a serialized block header.
///
/// Implementations must be pure functions of the header bytes; workers call
/// them concurrently from every thread of the pool.
pub trait PowHasher: Send + Sync {
    /// Hash the header, returning the digest in internal (little-endian) byte order.
    fn hash_header(&self, header: &[u8; HEADER_SIZE]) -> [u8; 32];
}

/// Double SHA-256, the header hash used by the node.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256d;

impl PowHasher for Sha256d {
    fn hash_header(&self, header: &[u8; HEADER_SIZE]) -> [u8; 32] {
        sha256d(header)
    }
}

/// SHA-256 applied twice.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Check whether a hash (internal byte order) is at or below a big-endian target.
pub fn hash_meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for (h, t) in hash.iter().rev().zip(target.iter()) {
        if h != t {
            return h < t;
        }
    }
    true
}
