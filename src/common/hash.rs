//! Hashing utilities for meshkeeper
//!
//! - BLAKE3 content hashes for catalog and deployment payloads
//! - Short hex prefixes for log lines

use blake3::Hasher;

/// Length of the hash prefix printed in log lines
pub const SHORT_HASH_LEN: usize = 10;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// First characters of a hex hash, for logging
pub fn short_hash(hash: &str) -> &str {
    let end = hash
        .char_indices()
        .nth(SHORT_HASH_LEN)
        .map(|(i, _)| i)
        .unwrap_or(hash.len());
    &hash[..end]
}

/// Compute BLAKE3 hash incrementally over several fields.
///
/// Each field is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// hash differently.
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        hex::encode(self.hasher.finalize().as_bytes())
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a payload against the hash its sender advertised
pub fn verify_hash(data: &[u8], expected: &str) -> crate::Result<()> {
    let actual = blake3_hash(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(crate::Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
