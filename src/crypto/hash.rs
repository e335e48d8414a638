//! Cryptographic hashing utilities
//!
//! Provides the SHA-256 based digests used across the wallet: block and
//! transaction ids (double SHA-256), key and script hashes (HASH160) and
//! BIP340 tagged hashes for taproot.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// A 32-byte digest in internal (little-endian) byte order
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as "stop hash" and null previous block
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block hashes, transaction ids and message checksums
pub fn double_sha256(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), the 20-byte hash behind P2PKH and P2SH
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha256(data));
    ripemd.finalize().into()
}

/// BIP340 tagged hash: SHA256(SHA256(tag) || SHA256(tag) || data)
pub fn tagged_hash(tag: &str, data: &[u8]) -> Hash256 {
    let tag_hash = sha256(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex string in the reversed (display) byte order used by block explorers
pub fn to_reversed_hex(hash: &Hash256) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

/// Parse a display-order hex string into an internal-order hash
pub fn from_reversed_hex(value: &str) -> Option<Hash256> {
    let bytes = hex::decode(value).ok()?;
    let mut hash: Hash256 = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(
            hex::encode(hash),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_double_sha256() {
        let hash = double_sha256(b"hello");
        assert_eq!(
            hex::encode(hash),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_hash160_length() {
        let hash = hash160(&[0x02; 33]);
        assert_eq!(hash.len(), 20);
    }

    #[test]
    fn test_reversed_hex_roundtrip() {
        let genesis = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = from_reversed_hex(genesis).unwrap();
        assert_eq!(hash[31], 0x00);
        assert_eq!(to_reversed_hex(&hash), genesis);
        assert!(from_reversed_hex("abcd").is_none());
    }
}
