//! Block header validation
//!
//! An SPV wallet checks only what it needs to follow the most-work chain:
//! headers link to their parent, hashes meet the target encoded in `bits`,
//! and `bits` follows the difficulty adjustment rules.
//!
//! Validators are trait objects composed into a `BlockValidatorSet` (every
//! member runs) or a `BlockValidatorChain` (the first applicable member
//! runs). Prepending to a chain gives a validator priority.

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::core::block::Block;
use crate::crypto::Hash256;
use crate::network::params::NetworkParams;
use crate::storage::Storage;

// =============================================================================
// Errors
// =============================================================================

/// Reasons a header is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockValidatorError {
    #[error("Header does not link to its parent")]
    WrongPreviousHeader,
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Bits changed outside a difficulty transition: expected {expected:#010x}, got {actual:#010x}")]
    NotEqualBits { expected: u32, actual: u32 },
    #[error("Difficulty transition mismatch: expected {expected:#010x}, got {actual:#010x}")]
    NotDifficultyTransitionEqualBits { expected: u32, actual: u32 },
    #[error("Invalid compact target {0:#010x}")]
    InvalidTarget(u32),
}

// =============================================================================
// Targets
// =============================================================================

/// 256-bit unsigned integer, big-endian bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target([u8; 32]);

impl Target {
    /// Decode the compact `bits` representation; `None` for negative or
    /// overflowing encodings
    pub fn from_compact(bits: u32) -> Option<Self> {
        let exponent = (bits >> 24) as i32;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 && mantissa != 0 {
            return None;
        }

        let mut bytes = [0u8; 32];
        for i in 0..3 {
            let byte = ((mantissa >> (8 * i)) & 0xff) as u8;
            let position = i + exponent - 3;
            if byte == 0 || position < 0 {
                continue;
            }
            if position >= 32 {
                return None;
            }
            bytes[31 - position as usize] = byte;
        }

        Some(Self(bytes))
    }

    /// Encode as compact `bits`
    pub fn to_compact(&self) -> u32 {
        let mut size = self.0.iter().position(|b| *b != 0).map(|i| 32 - i).unwrap_or(0) as i32;

        let byte_at = |position: i32| -> u32 {
            if (0..32).contains(&position) {
                self.0[31 - position as usize] as u32
            } else {
                0
            }
        };
        let mut compact = (byte_at(size - 1) << 16) | (byte_at(size - 2) << 8) | byte_at(size - 3);

        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact | ((size as u32) << 24)
    }

    /// Interpret a block hash (internal byte order) as a number
    pub fn from_hash(hash: &Hash256) -> Self {
        let mut bytes = *hash;
        bytes.reverse();
        Self(bytes)
    }

    /// `None` on overflow
    pub fn checked_mul(&self, factor: u64) -> Option<Self> {
        let mut out = [0u8; 32];
        let mut carry: u128 = 0;
        for i in (0..32).rev() {
            let product = self.0[i] as u128 * factor as u128 + carry;
            out[i] = (product & 0xff) as u8;
            carry = product >> 8;
        }
        if carry != 0 {
            return None;
        }
        Some(Self(out))
    }

    pub fn div(&self, divisor: u64) -> Self {
        let mut out = [0u8; 32];
        let mut remainder: u128 = 0;
        for (i, byte) in self.0.iter().enumerate() {
            let current = (remainder << 8) | *byte as u128;
            out[i] = (current / divisor as u128) as u8;
            remainder = current % divisor as u128;
        }
        Self(out)
    }
}

/// Whether the header hash meets the target encoded in `bits`
pub fn check_proof_of_work(hash: &Hash256, bits: u32) -> Result<(), BlockValidatorError> {
    let target = Target::from_compact(bits).ok_or(BlockValidatorError::InvalidTarget(bits))?;

    match Target::from_hash(hash).cmp(&target) {
        Ordering::Greater => Err(BlockValidatorError::InvalidProofOfWork),
        _ => Ok(()),
    }
}

/// Bitcoin retarget: scale the last target by the clamped period timespan
pub fn next_work_required(
    last_bits: u32,
    first_timestamp: u32,
    last_timestamp: u32,
    params: &NetworkParams,
) -> Result<u32, BlockValidatorError> {
    let target_timespan = params.target_timespan as i64;
    let actual = (last_timestamp as i64 - first_timestamp as i64).clamp(target_timespan / 4, target_timespan * 4);

    let limit = Target::from_compact(params.max_target_bits)
        .ok_or(BlockValidatorError::InvalidTarget(params.max_target_bits))?;
    let last = Target::from_compact(last_bits).ok_or(BlockValidatorError::InvalidTarget(last_bits))?;

    let next = match last.checked_mul(actual as u64) {
        Some(scaled) => scaled.div(target_timespan as u64).min(limit),
        None => limit,
    };

    Ok(next.to_compact())
}

// =============================================================================
// Validator Trait
// =============================================================================

/// A header check performed against the parent block
pub trait BlockValidator: Send + Sync {
    /// Whether this validator applies to `block`
    fn is_block_validatable(&self, _block: &Block, _previous: &Block) -> bool {
        true
    }

    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidatorError>;
}

/// Runs every validator
#[derive(Default)]
pub struct BlockValidatorSet {
    validators: Vec<Box<dyn BlockValidator>>,
}

impl BlockValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, validator: Box<dyn BlockValidator>) {
        self.validators.push(validator);
    }
}

impl BlockValidator for BlockValidatorSet {
    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidatorError> {
        for validator in &self.validators {
            if validator.is_block_validatable(block, previous) {
                validator.validate(block, previous)?;
            }
        }
        Ok(())
    }
}

/// Runs the first validator that applies
#[derive(Default)]
pub struct BlockValidatorChain {
    validators: Vec<Box<dyn BlockValidator>>,
}

impl BlockValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, validator: Box<dyn BlockValidator>) {
        self.validators.push(validator);
    }

    pub fn prepend(&mut self, validator: Box<dyn BlockValidator>) {
        self.validators.insert(0, validator);
    }
}

impl BlockValidator for BlockValidatorChain {
    fn is_block_validatable(&self, block: &Block, previous: &Block) -> bool {
        self.validators.iter().any(|v| v.is_block_validatable(block, previous))
    }

    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidatorError> {
        match self.validators.iter().find(|v| v.is_block_validatable(block, previous)) {
            Some(validator) => validator.validate(block, previous),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Validators
// =============================================================================

/// Header links to the parent it was connected to
pub struct ContinuityValidator;

impl BlockValidator for ContinuityValidator {
    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidatorError> {
        if block.previous_hash() != previous.hash() || block.height != previous.height + 1 {
            return Err(BlockValidatorError::WrongPreviousHeader);
        }
        Ok(())
    }
}

pub struct ProofOfWorkValidator;

impl BlockValidator for ProofOfWorkValidator {
    fn validate(&self, block: &Block, _previous: &Block) -> Result<(), BlockValidatorError> {
        check_proof_of_work(&block.hash(), block.header.bits)
    }
}

/// Between transitions `bits` must not change
pub struct BitsValidator {
    interval: u32,
}

impl BitsValidator {
    pub fn new(interval: u32) -> Self {
        Self { interval }
    }
}

impl BlockValidator for BitsValidator {
    fn is_block_validatable(&self, block: &Block, _previous: &Block) -> bool {
        block.height % self.interval != 0
    }

    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidatorError> {
        if block.header.bits != previous.header.bits {
            return Err(BlockValidatorError::NotEqualBits {
                expected: previous.header.bits,
                actual: block.header.bits,
            });
        }
        Ok(())
    }
}

/// Difficulty transition every `retarget_interval` blocks
pub struct DifficultyAdjustmentValidator {
    storage: Arc<dyn Storage>,
    params: NetworkParams,
}

impl DifficultyAdjustmentValidator {
    pub fn new(storage: Arc<dyn Storage>, params: NetworkParams) -> Self {
        Self { storage, params }
    }
}

impl BlockValidator for DifficultyAdjustmentValidator {
    fn is_block_validatable(&self, block: &Block, _previous: &Block) -> bool {
        block.height % self.params.retarget_interval() == 0
    }

    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidatorError> {
        let interval = self.params.retarget_interval();
        let start_height = block.height.saturating_sub(interval);

        // Period start pruned or before the checkpoint: nothing to check against
        let Some(first) = self.storage.block_by_height_stale_prioritized(start_height) else {
            log::debug!("No period start block at {}, skipping retarget check", start_height);
            return Ok(());
        };

        let expected = next_work_required(previous.header.bits, first.timestamp(), previous.timestamp(), &self.params)?;
        if expected != block.header.bits {
            return Err(BlockValidatorError::NotDifficultyTransitionEqualBits {
                expected,
                actual: block.header.bits,
            });
        }
        Ok(())
    }
}

/// Validators for a network: continuity and proof of work always, then the
/// retarget rules unless the network disables them
pub fn validators_for(params: &NetworkParams, storage: Arc<dyn Storage>) -> BlockValidatorSet {
    let mut set = BlockValidatorSet::new();
    set.push(Box::new(ContinuityValidator));
    set.push(Box::new(ProofOfWorkValidator));

    if !params.no_retargeting {
        let mut chain = BlockValidatorChain::new();
        chain.push(Box::new(DifficultyAdjustmentValidator::new(storage, params.clone())));
        if !params.allow_min_difficulty_blocks {
            chain.push(Box::new(BitsValidator::new(params.retarget_interval())));
        }
        set.push(Box::new(chain));
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockHeader;
    use crate::storage::MemoryStorage;

    fn block_at(height: u32, previous: &Block, timestamp: u32, bits: u32) -> Block {
        Block::new(
            BlockHeader::new(1, previous.hash(), [0u8; 32], timestamp, bits, 0),
            height,
        )
    }

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffff, 0x1b0404cb, 0x207fffff, 0x1c7fff80] {
            assert_eq!(Target::from_compact(bits).unwrap().to_compact(), bits);
        }
        assert!(Target::from_compact(0x04923456).is_none());
    }

    #[test]
    fn test_genesis_meets_target() {
        let params = NetworkParams::mainnet();
        let genesis = params.bip44_checkpoint().unwrap().block;
        assert!(check_proof_of_work(&genesis.hash(), genesis.header.bits).is_ok());
        assert_eq!(
            check_proof_of_work(&[0xffu8; 32], 0x1d00ffff),
            Err(BlockValidatorError::InvalidProofOfWork)
        );

        let last = params.last_checkpoint().unwrap().block;
        assert!(check_proof_of_work(&last.hash(), last.header.bits).is_ok());
    }

    #[test]
    fn test_next_work_required() {
        let params = NetworkParams::mainnet();
        let span = params.target_timespan;

        // mainnet transition at height 32256
        assert_eq!(
            next_work_required(0x1d00ffff, 1261130161, 1262152739, &params).unwrap(),
            0x1d00d86a
        );
        assert_eq!(next_work_required(0x1d00ffff, 0, span / 2, &params).unwrap(), 0x1c7fff80);
        // slow period is capped at the pow limit
        assert_eq!(next_work_required(0x1d00ffff, 0, span * 10, &params).unwrap(), 0x1d00ffff);
        // fast period is clamped to a quarter
        assert_eq!(next_work_required(0x1b0404cb, 0, span / 10, &params).unwrap(), 0x1b010132);
    }

    #[test]
    fn test_difficulty_transition_checked_against_storage() {
        let params = NetworkParams::mainnet();
        let storage = Arc::new(MemoryStorage::new());

        let genesis = Block::new(BlockHeader::new(1, [0u8; 32], [0u8; 32], 0, 0x1d00ffff, 0), 0);
        let first = block_at(30240, &genesis, 1261130161, 0x1d00ffff);
        let last = block_at(32255, &first, 1262152739, 0x1d00ffff);
        storage.add_block(first);

        let validator = DifficultyAdjustmentValidator::new(storage.clone(), params);
        let good = block_at(32256, &last, 1262153464, 0x1d00d86a);
        let bad = block_at(32256, &last, 1262153464, 0x1d00ffff);

        assert!(validator.is_block_validatable(&good, &last));
        assert!(validator.validate(&good, &last).is_ok());
        assert!(matches!(
            validator.validate(&bad, &last),
            Err(BlockValidatorError::NotDifficultyTransitionEqualBits { expected: 0x1d00d86a, .. })
        ));
    }

    #[test]
    fn test_bits_and_continuity() {
        let genesis = Block::new(BlockHeader::new(1, [0u8; 32], [0u8; 32], 0, 0x1d00ffff, 0), 0);
        let next = block_at(1, &genesis, 600, 0x1d00ffff);
        let changed = block_at(1, &genesis, 600, 0x1c00ffff);
        let orphan = Block::new(BlockHeader::new(1, [9u8; 32], [0u8; 32], 600, 0x1d00ffff, 0), 1);

        let bits = BitsValidator::new(2016);
        assert!(bits.validate(&next, &genesis).is_ok());
        assert!(bits.validate(&changed, &genesis).is_err());

        assert!(ContinuityValidator.validate(&next, &genesis).is_ok());
        assert_eq!(
            ContinuityValidator.validate(&orphan, &genesis),
            Err(BlockValidatorError::WrongPreviousHeader)
        );
    }

    #[test]
    fn test_chain_picks_first_applicable() {
        let params = NetworkParams::mainnet();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let set = validators_for(&params, storage);

        let genesis = Block::new(BlockHeader::new(1, [0u8; 32], [0u8; 32], 0, 0x207fffff, 0), 0);
        // continuity runs before proof of work
        let orphan = Block::new(BlockHeader::new(1, [9u8; 32], [0u8; 32], 600, 0x207fffff, 0), 1);
        assert_eq!(set.validate(&orphan, &genesis), Err(BlockValidatorError::WrongPreviousHeader));
    }
}
