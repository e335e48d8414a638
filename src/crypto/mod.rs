//! Cryptographic utilities for the wallet
//!
//! This module provides:
//! - SHA-256, double SHA-256, HASH160 and tagged hashing
//! - ECDSA and BIP340 Schnorr signing (secp256k1)
//! - Merkle root and partial merkle tree calculations

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{
    double_sha256, from_reversed_hex, hash160, sha256, tagged_hash, to_reversed_hex, Hash256,
    ZERO_HASH,
};
pub use keys::{
    parse_public_key, sign_ecdsa, sign_schnorr_taproot, taproot_output_key, verify_ecdsa,
    verify_schnorr, KeyError,
};
pub use merkle::{calculate_merkle_root, MerkleError, PartialMerkleTree};
