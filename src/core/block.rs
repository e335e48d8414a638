//! Block headers, stored blocks and download bookkeeping
//!
//! An SPV wallet never sees full blocks. It stores 80-byte headers with a
//! height and two flags, tracks pending block hashes announced by peers, and
//! assembles merkle blocks out of `merkleblock` + `tx` messages.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::encoding::{DecodeError, Reader};
use crate::core::transaction::FullTransaction;
use crate::crypto::{double_sha256, to_reversed_hex, Hash256};

// =============================================================================
// Block Constants
// =============================================================================

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Number of blocks between difficulty adjustments
pub const RETARGET_INTERVAL: u32 = 2016;

// =============================================================================
// Block Errors
// =============================================================================

/// Header parsing errors
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid header length: {0} bytes")]
    InvalidHeaderLength(usize),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
}

// =============================================================================
// Block Header
// =============================================================================

/// Block header with its cached hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
    /// Double SHA-256 of the serialized header, computed once
    pub hash: Hash256,
}

impl BlockHeader {
    pub fn new(
        version: i32,
        previous_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        let mut header = Self {
            version,
            previous_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
            hash: [0u8; 32],
        };
        header.hash = double_sha256(&header.serialize());
        header
    }

    /// Serialize to the 80-byte wire format
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.previous_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Read a header from the front of `reader`
    pub fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32()?;
        let previous_hash = reader.read_hash()?;
        let merkle_root = reader.read_hash()?;
        let timestamp = reader.read_u32()?;
        let bits = reader.read_u32()?;
        let nonce = reader.read_u32()?;

        Ok(Self::new(version, previous_hash, merkle_root, timestamp, bits, nonce))
    }

    /// Parse a standalone 80-byte header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() != BLOCK_HEADER_SIZE {
            return Err(BlockError::InvalidHeaderLength(bytes.len()));
        }
        Ok(Self::read(&mut Reader::new(bytes))?)
    }

    pub fn hash_hex(&self) -> String {
        to_reversed_hex(&self.hash)
    }
}

// =============================================================================
// Stored Block
// =============================================================================

/// A header stored in the local chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub height: u32,
    /// Belongs to a newly downloaded branch not yet reconciled by fork handling
    pub stale: bool,
    /// At least one wallet transaction is confirmed in this block
    pub has_transactions: bool,
}

impl Block {
    pub fn new(header: BlockHeader, height: u32) -> Self {
        Self {
            header,
            height,
            stale: false,
            has_transactions: false,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash
    }

    pub fn previous_hash(&self) -> Hash256 {
        self.header.previous_hash
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }
}

/// A block announced by a peer but not yet downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    pub header_hash: Hash256,
    /// `0` when the position in the chain is not known yet
    pub height: u32,
    /// Monotonic request order
    pub sequence: u32,
}

impl BlockHash {
    pub fn new(header_hash: Hash256, height: u32, sequence: u32) -> Self {
        Self {
            header_hash,
            height,
            sequence,
        }
    }
}

// =============================================================================
// Merkle Block
// =============================================================================

/// A filtered block: header plus the matched transactions delivered after it
#[derive(Debug, Clone)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub associated_transaction_hashes: HashSet<Hash256>,
    pub associated_transactions: Vec<FullTransaction>,
    /// Known height from the block-hash request this block answers
    pub height: Option<u32>,
}

impl MerkleBlock {
    pub fn new(header: BlockHeader, matched: Vec<Hash256>) -> Self {
        Self {
            header,
            associated_transaction_hashes: matched.into_iter().collect(),
            associated_transactions: Vec::new(),
            height: None,
        }
    }

    pub fn block_hash(&self) -> Hash256 {
        self.header.hash
    }

    /// Whether the transaction was matched by the filter for this block
    pub fn expects(&self, hash: &Hash256) -> bool {
        self.associated_transaction_hashes.contains(hash)
            && !self
                .associated_transactions
                .iter()
                .any(|tx| tx.header.hash == *hash)
    }

    /// All matched transactions have arrived
    pub fn complete(&self) -> bool {
        self.associated_transactions.len() == self.associated_transaction_hashes.len()
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// A trusted starting point for header sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub block: Block,
    /// Blocks preceding `block`, needed by the difficulty validator
    pub additional_blocks: Vec<Block>,
}

impl Checkpoint {
    /// Parse checkpoint lines of `{80-byte header hex}:{height}`, newest first
    pub fn from_lines(lines: &[&str]) -> Result<Self, BlockError> {
        let mut blocks = lines
            .iter()
            .map(|line| Self::parse_line(line))
            .collect::<Result<Vec<_>, _>>()?;

        if blocks.is_empty() {
            return Err(BlockError::InvalidCheckpoint("no blocks".to_string()));
        }
        let block = blocks.remove(0);

        Ok(Self {
            block,
            additional_blocks: blocks,
        })
    }

    fn parse_line(line: &str) -> Result<Block, BlockError> {
        let (header_hex, height) = line
            .split_once(':')
            .ok_or_else(|| BlockError::InvalidCheckpoint(line.to_string()))?;
        let bytes = hex::decode(header_hex.trim())
            .map_err(|e| BlockError::InvalidCheckpoint(e.to_string()))?;
        let height = height
            .trim()
            .parse::<u32>()
            .map_err(|e| BlockError::InvalidCheckpoint(e.to_string()))?;

        Ok(Block::new(BlockHeader::from_bytes(&bytes)?, height))
    }

    pub fn hash(&self) -> Hash256 {
        self.block.hash()
    }

    pub fn height(&self) -> u32 {
        self.block.height
    }

    /// Checkpoint block followed by its additional blocks
    pub fn all_blocks(&self) -> Vec<Block> {
        let mut blocks = vec![self.block.clone()];
        blocks.extend(self.additional_blocks.iter().cloned());
        blocks
    }
}
