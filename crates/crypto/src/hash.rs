//! Keccak256 hashing utilities.
//!
//! Kestrel uses Keccak256 for block hashes, the part-set Merkle tree and
//! validator address derivation.

use sha3::{Digest, Keccak256};

/// Compute the Keccak256 hash of the input data.
///
/// # Example
///
/// ```rust
/// use kestrel_crypto::keccak256;
///
/// let hash = keccak256(b"hello");
/// assert_eq!(hash.len(), 32);
/// ```
#[inline]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the Keccak256 hash of multiple concatenated inputs.
///
/// Equivalent to hashing the concatenation, without allocating a
/// temporary buffer.
///
/// # Example
///
/// ```rust
/// use kestrel_crypto::keccak256_concat;
///
/// let hash = keccak256_concat(&[b"hello", b" ", b"world"]);
/// // Equivalent to: keccak256(b"hello world")
/// ```
#[inline]
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        let hash = keccak256(b"");
        // Known hash of empty input
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak256_hello() {
        let hash = keccak256(b"hello");
        assert_eq!(
            hex::encode(hash),
            "1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_keccak256_concat_equivalence() {
        let hash1 = keccak256(b"hello world");
        let hash2 = keccak256_concat(&[b"hello", b" ", b"world"]);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_keccak256_deterministic() {
        let hash1 = keccak256(b"test data");
        let hash2 = keccak256(b"test data");
        assert_eq!(hash1, hash2);
    }
}
