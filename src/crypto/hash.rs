//! Hashing primitives for the ledger
//!
//! SHA-256 backs transaction ids, block hashes and merkle nodes; HASH160
//! (SHA-256 followed by RIPEMD-160) backs addresses and script key hashes.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// RIPEMD-160 of SHA-256, the 20-byte public key hash
pub fn hash160(data: &[u8]) -> Vec<u8> {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha256(data));
    ripemd.finalize().to_vec()
}

/// Checks a hex-encoded hash against the difficulty target.
///
/// The target is expressed as the number of leading `'0'` hex digits.
pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    let required = difficulty as usize;
    hash_hex.len() >= required && hash_hex.bytes().take(required).all(|c| c == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(
            sha256_hex(data),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_double_sha256() {
        let data = b"hello world";
        assert_eq!(double_sha256(data), sha256(&sha256(data)));
        assert_eq!(double_sha256_hex(data).len(), 64);
    }

    #[test]
    fn test_hash160_length() {
        assert_eq!(hash160(b"public key bytes").len(), 20);
        assert_ne!(hash160(b"a"), hash160(b"b"));
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("000fab", 3));
        assert!(meets_difficulty("000fab", 2));
        assert!(!meets_difficulty("000fab", 4));
        assert!(meets_difficulty("abc", 0));
        assert!(!meets_difficulty("00", 3));
    }
}
