//! Cryptographic utilities for the federator mesh
//!
//! This module provides:
//! - SHA-256 and keccak-256 hashing
//! - secp256k1 key management with recoverable signatures
//! - Ethereum-style addresses for registry lookups

pub mod hash;
pub mod keys;

pub use hash::{eth_signed_digest, keccak256, keccak256_parts, sha256, sha256_hex};
pub use keys::{
    recover_address, recover_public_key, Address, KeyError, KeyPair, SIGNATURE_LEN,
};
