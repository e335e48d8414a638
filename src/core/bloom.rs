//! Bloom filter (BIP 37)
//!
//! The filter is loaded into every peer with `filterload` so that peers only
//! relay transactions and merkle blocks touching wallet keys or outpoints.
//!
//!   Size       Field           Description
//!   ====       =====           ===========
//!   VarInt     Count           Number of bytes in the filter
//!   Variable   Filter          Filter data
//!   4 bytes    nHashFuncs      Number of hash functions
//!   4 bytes    nTweak          Random value to add to the hash seed
//!   1 byte     nFlags          Filter update flags

use serde::{Deserialize, Serialize};

use crate::core::encoding::put_var_bytes;

// =============================================================================
// Constants
// =============================================================================

/// Maximum filter size in bytes
pub const MAX_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions
pub const MAX_HASH_FUNCS: u32 = 50;

/// False positive rate used for wallet filters
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.00005;

/// Bloom filter update flags
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

// =============================================================================
// Bloom Filter
// =============================================================================

/// Immutable once built; a new set of elements means a new filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update flags
    flags: u8,
}

impl BloomFilter {
    /// Build a filter sized for `elements` at the given false positive rate
    pub fn with_elements(elements: &[Vec<u8>], fp_rate: f64, tweak: u32) -> Self {
        let n = elements.len().max(1) as f64;
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;

        // Optimal size: -1 / (ln(2)^2) * n * ln(p)
        let size_bits = (-1.0 / ln2_squared * n * fp_rate.ln()) as usize;
        let size_bytes = (size_bits.min(MAX_FILTER_SIZE * 8) / 8).max(1);

        // Optimal hash functions: (m/n) * ln(2)
        let hash_funcs = ((size_bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32;

        let mut filter = Self {
            data: vec![0u8; size_bytes],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags: BLOOM_UPDATE_NONE,
        };
        for element in elements {
            filter.insert(element);
        }
        filter
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs {
            let idx = self.bit_index(data, i);
            self.data[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let idx = self.bit_index(data, i);
            self.data[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    /// Get filter size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Serialize as the body of a `filterload` message
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 12);
        put_var_bytes(&mut out, &self.data);
        out.extend_from_slice(&self.hash_funcs.to_le_bytes());
        out.extend_from_slice(&self.tweak.to_le_bytes());
        out.push(self.flags);
        out
    }

    /// Rebuild from `filterload` fields
    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8) -> Self {
        Self {
            data,
            hash_funcs,
            tweak,
            flags,
        }
    }

    fn bit_index(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
        (murmur3_32(seed, data) as usize) % (self.data.len() * 8)
    }
}

impl std::fmt::Display for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bloom Filter of size {} with {} hash functions",
            self.data.len(),
            self.hash_funcs
        )
    }
}

/// MurmurHash3 (x86, 32-bit) as specified by BIP 37
pub fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 ^= (*byte as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_vectors() {
        // Test vectors from Bitcoin Core's hash_tests.cpp
        assert_eq!(murmur3_32(0x0000_0000, &[]), 0x0000_0000);
        assert_eq!(murmur3_32(0xFBA4_C795, &[]), 0x6a39_6f08);
        assert_eq!(murmur3_32(0xffff_ffff, &[]), 0x81f1_6f39);
        assert_eq!(murmur3_32(0x0000_0000, &[0x00]), 0x514e_28b7);
    }

    #[test]
    fn test_bloom_filter_membership() {
        let elements = vec![b"alice".to_vec(), b"bob".to_vec()];
        let filter = BloomFilter::with_elements(&elements, DEFAULT_FALSE_POSITIVE_RATE, 5);

        assert!(filter.contains(b"alice"));
        assert!(filter.contains(b"bob"));
        assert!(!filter.contains(b"charlie"));
    }

    #[test]
    fn test_bloom_filter_sizing() {
        let elements: Vec<Vec<u8>> = (0u32..1000).map(|i| i.to_le_bytes().to_vec()).collect();
        let filter = BloomFilter::with_elements(&elements, DEFAULT_FALSE_POSITIVE_RATE, 0);

        assert!(filter.size() <= MAX_FILTER_SIZE);
        assert!(filter.hash_funcs() <= MAX_HASH_FUNCS);
        assert!(elements.iter().all(|e| filter.contains(e)));
    }

    #[test]
    fn test_same_elements_same_filter() {
        let elements = vec![vec![1u8; 20], vec![2u8; 33]];
        let a = BloomFilter::with_elements(&elements, DEFAULT_FALSE_POSITIVE_RATE, 42);
        let b = BloomFilter::with_elements(&elements, DEFAULT_FALSE_POSITIVE_RATE, 42);
        assert_eq!(a, b);

        let c = BloomFilter::with_elements(&elements[..1], DEFAULT_FALSE_POSITIVE_RATE, 42);
        assert_ne!(a, c);
    }

    #[test]
    fn test_filterload_serialization() {
        let filter = BloomFilter::from_parts(vec![0xb5, 0x0f], 11, 0, BLOOM_UPDATE_ALL);
        assert_eq!(hex::encode(filter.to_bytes()), "02b50f0b0000000000000001");
    }
}
