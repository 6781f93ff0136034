//! Hashing Helpers
//!
//! SHA-256 with domain separation, used for:
//! - Seed commitments published before a round starts
//! - Crash point derivation from a revealed seed

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type HashOutput = [u8; 32];

/// Domain-separated SHA-256 hasher.
///
/// Order of updates is part of the hash definition.
pub struct DomainHasher {
    hasher: Sha256,
}

impl DomainHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> HashOutput {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> HashOutput {
    let mut hasher = DomainHasher::new(domain);
    hasher.update_bytes(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let hash1 = hash_with_domain(b"CRASH_TEST", &[1, 2, 3]);
        let hash2 = hash_with_domain(b"CRASH_TEST", &[1, 2, 3]);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];

        let hash1 = hash_with_domain(b"DOMAIN_A", &data);
        let hash2 = hash_with_domain(b"DOMAIN_B", &data);

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_hasher_order_matters() {
        let hash1 = {
            let mut h = DomainHasher::new(b"test");
            h.update_bytes(&[1]);
            h.update_bytes(&[2]);
            h.finalize()
        };

        let hash2 = {
            let mut h = DomainHasher::new(b"test");
            h.update_bytes(&[2]);
            h.update_bytes(&[1]);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }
}
