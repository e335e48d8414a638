//! Core wallet primitives
//!
//! This module contains the data model the rest of the kit is built on:
//! - Encoding (Bitcoin var-ints and little-endian readers)
//! - Scripts and addresses (classification, locking/unlocking scripts)
//! - Blocks, merkle blocks and checkpoints
//! - Transactions (serialization, sighash computation)
//! - Public keys and the BIP37 bloom filter
//! - Blockchain (header connection, fork handling) and header validators

pub mod address;
pub mod block;
pub mod blockchain;
pub mod bloom;
pub mod encoding;
pub mod public_key;
pub mod script;
pub mod transaction;
pub mod validator;

pub use address::{
    Address, AddressConverter, AddressConverterChain, AddressError, AddressType,
    Base58AddressConverter, SegwitAddressConverter,
};
pub use block::{
    Block, BlockError, BlockHash, BlockHeader, Checkpoint, MerkleBlock, BLOCK_HEADER_SIZE,
    RETARGET_INTERVAL,
};
pub use blockchain::{Blockchain, BlockchainDataListener, BlockchainError};
pub use bloom::{BloomFilter, DEFAULT_FALSE_POSITIVE_RATE, MAX_FILTER_SIZE, MAX_HASH_FUNCS};
pub use encoding::{DecodeError, Reader};
pub use public_key::PublicKey;
pub use script::{ScriptType, SigHashType};
pub use transaction::{
    FullTransaction, Transaction, TransactionError, TransactionInput, TransactionOutput,
    TransactionStatus, SEQUENCE_FINAL, SEQUENCE_NO_RBF, SEQUENCE_RBF, TX_VERSION,
};
pub use validator::{validators_for, BlockValidator, BlockValidatorError, BlockValidatorSet};
