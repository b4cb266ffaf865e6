//! Hashing utilities
//!
//! SHA-256 for transport security tags and keccak-256 for everything that
//! has to line up with the on-chain side (addresses, signed digests, batch
//! hashes).

use sha2::{Digest, Sha256};
use sha3::Keccak256;

/// Prefix applied by Ethereum wallets before signing a 32-byte hash
const ETH_SIGNED_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

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

/// Computes keccak-256 (the pre-standard SHA-3 variant used by Ethereum)
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Keccak-256 over several parts without concatenating them first
pub fn keccak256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Digest that `eth_sign`/`personal_sign` produce for a 32-byte hash.
///
/// The transfer contract recovers signers from this form, so batch
/// signatures are always made over it.
pub fn eth_signed_digest(hash: &[u8; 32]) -> [u8; 32] {
    keccak256_parts(&[ETH_SIGNED_PREFIX, hash])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak_parts_matches_concatenation() {
        let whole = keccak256(b"federator-mesh");
        let parts = keccak256_parts(&[b"federator", b"-", b"mesh"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_eth_signed_digest_differs_from_hash() {
        let hash = keccak256(b"batch");
        assert_ne!(eth_signed_digest(&hash), hash);
    }
}
