//! Merkle tree calculations for transaction verification
//!
//! Computes Bitcoin merkle roots and walks BIP37 partial merkle trees
//! delivered inside `merkleblock` messages.

use super::hash::{double_sha256, Hash256, ZERO_HASH};
use thiserror::Error;

/// Errors raised while validating a partial merkle tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Merkle block has no transactions")]
    NoTransactions,
    #[error("Too many transactions: {0}")]
    TooManyTransactions(u32),
    #[error("More hashes than transactions")]
    TooManyHashes,
    #[error("Not enough flag bits for the hashes provided")]
    NotEnoughFlagBits,
    #[error("Ran out of hashes while traversing the tree")]
    HashesExhausted,
    #[error("Ran out of flag bits while traversing the tree")]
    FlagBitsExhausted,
    #[error("Duplicate sibling hashes (CVE-2012-2459)")]
    DuplicateSiblings,
    #[error("Not all hashes were consumed")]
    UnusedHashes,
    #[error("Not all flag bits were consumed")]
    UnusedFlagBits,
    #[error("Merkle root mismatch")]
    RootMismatch,
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    double_sha256(&data)
}

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return ZERO_HASH;
    }

    let mut current_level: Vec<Hash256> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| match chunk {
                [left, right] => hash_pair(left, right),
                // Duplicate the last hash if odd number
                [single] => hash_pair(single, single),
                _ => ZERO_HASH,
            })
            .collect();
    }

    current_level[0]
}

/// BIP37 partial merkle tree as carried by a `merkleblock` message
#[derive(Debug, Clone)]
pub struct PartialMerkleTree {
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

struct Traversal<'a> {
    tree: &'a PartialMerkleTree,
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash256>,
}

impl PartialMerkleTree {
    fn tree_width(&self, height: u32) -> u32 {
        (self.total_transactions + (1 << height) - 1) >> height
    }

    /// Walk the tree, returning the merkle root and the matched transaction hashes
    pub fn extract_matches(&self, max_transactions: u32) -> Result<(Hash256, Vec<Hash256>), MerkleError> {
        if self.total_transactions == 0 {
            return Err(MerkleError::NoTransactions);
        }
        if self.total_transactions > max_transactions {
            return Err(MerkleError::TooManyTransactions(self.total_transactions));
        }
        if self.hashes.len() > self.total_transactions as usize {
            return Err(MerkleError::TooManyHashes);
        }
        if self.flags.len() * 8 < self.hashes.len() {
            return Err(MerkleError::NotEnoughFlagBits);
        }

        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }

        let mut traversal = Traversal {
            tree: self,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };
        let root = traversal.traverse(height, 0)?;

        if (traversal.bits_used + 7) / 8 != self.flags.len() {
            return Err(MerkleError::UnusedFlagBits);
        }
        if traversal.hashes_used != self.hashes.len() {
            return Err(MerkleError::UnusedHashes);
        }

        Ok((root, traversal.matched))
    }
}

impl Traversal<'_> {
    fn next_bit(&mut self) -> Result<bool, MerkleError> {
        let byte = self
            .tree
            .flags
            .get(self.bits_used / 8)
            .ok_or(MerkleError::FlagBitsExhausted)?;
        let bit = (byte >> (self.bits_used % 8)) & 1 == 1;
        self.bits_used += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> Result<Hash256, MerkleError> {
        let hash = *self
            .tree
            .hashes
            .get(self.hashes_used)
            .ok_or(MerkleError::HashesExhausted)?;
        self.hashes_used += 1;
        Ok(hash)
    }

    fn traverse(&mut self, height: u32, position: u32) -> Result<Hash256, MerkleError> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.push(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, position * 2)?;
        let right = if position * 2 + 1 < self.tree.tree_width(height - 1) {
            let right = self.traverse(height - 1, position * 2 + 1)?;
            if right == left {
                return Err(MerkleError::DuplicateSiblings);
            }
            right
        } else {
            left
        };

        Ok(hash_pair(&left, &right))
    }
}
