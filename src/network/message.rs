//! Network message types for P2P communication
//!
//! Bitcoin wire payloads for the subset of the protocol an SPV client
//! speaks. Framing (magic, command, length, checksum) lives in the codec;
//! this module only turns payload bytes into `Message` values and back.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bitflags::bitflags;
use thiserror::Error;

use crate::core::block::{BlockHeader, MerkleBlock};
use crate::core::bloom::BloomFilter;
use crate::core::encoding::{put_var_bytes, put_var_int, DecodeError, Reader};
use crate::core::transaction::FullTransaction;
use crate::crypto::{to_reversed_hex, Hash256, MerkleError, PartialMerkleTree};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of addresses in a single `addr` message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum number of inventory items in a single `inv`/`getdata`
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

/// Upper bound on transactions a merkle block may claim
const MAX_BLOCK_TRANSACTIONS: u32 = 4_000_000 / 240;

pub const USER_AGENT: &str = concat!("/spv-kit:", env!("CARGO_PKG_VERSION"), "/");

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Decode error in {command}: {source}")]
    Decode {
        command: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error("Invalid merkle block {0}: {1}")]
    InvalidMerkleBlock(String, MerkleError),
    #[error("Merkle root mismatch in block {0}")]
    MerkleRootMismatch(String),
    #[error("Too many items in {0}")]
    TooManyItems(&'static str),
    #[error("Checksum mismatch for {0}")]
    BadChecksum(String),
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Invalid command name")]
    InvalidCommand,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Service Flags
// =============================================================================

bitflags! {
    /// Services advertised in `version` and `addr`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        const NETWORK = 1;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
        const COMPACT_FILTERS = 1 << 6;
        const NETWORK_LIMITED = 1 << 10;
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    Other(u32),
}

impl InvType {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            other => InvType::Other(other),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::Other(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn new(inv_type: InvType, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InvType::Tx, hash)
    }

    pub fn filtered_block(hash: Hash256) -> Self {
        Self::new(InvType::FilteredBlock, hash)
    }
}

// =============================================================================
// Addresses
// =============================================================================

/// Network address as carried in `version` and `addr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub services: ServiceFlags,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self { services, ip, port }
    }

    pub fn unspecified() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, ServiceFlags::empty())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.bits().to_le_bytes());
        let v6 = match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        out.extend_from_slice(&v6.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let services = ServiceFlags::from_bits_retain(reader.read_u64()?);
        let octets: [u8; 16] = reader
            .read_bytes(16)?
            .try_into()
            .map_err(|_| DecodeError::InvalidValue("ip address".to_string()))?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = reader.read_u16_be()?;
        Ok(Self { services, ip, port })
    }
}

/// `addr` entry: last-seen time plus address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedAddr {
    pub time: u32,
    pub addr: NetAddr,
}

// =============================================================================
// Payload Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetAddr,
    pub sender: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// BIP37: whether the peer should relay transactions before a filter is loaded
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(version: i32, receiver: NetAddr, start_height: u32) -> Self {
        Self {
            version,
            services: ServiceFlags::empty(),
            timestamp: chrono::Utc::now().timestamp(),
            receiver,
            sender: NetAddr::unspecified(),
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height: start_height as i32,
            relay: false,
        }
    }

    pub fn has_services(&self, required: ServiceFlags) -> bool {
        self.services.contains(required)
    }
}

/// `merkleblock` payload before the partial tree is checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl MerkleBlockMessage {
    /// Check the partial tree against the header and collect matched hashes
    pub fn to_merkle_block(&self) -> Result<MerkleBlock, MessageError> {
        let tree = PartialMerkleTree {
            total_transactions: self.total_transactions,
            hashes: self.hashes.clone(),
            flags: self.flags.clone(),
        };
        let (root, matched) = tree
            .extract_matches(MAX_BLOCK_TRANSACTIONS)
            .map_err(|e| MessageError::InvalidMerkleBlock(self.header.hash_hex(), e))?;

        if root != self.header.merkle_root {
            return Err(MessageError::MerkleRootMismatch(self.header.hash_hex()));
        }
        Ok(MerkleBlock::new(self.header.clone(), matched))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Usually the hash of the rejected object
    pub data: Vec<u8>,
}

// =============================================================================
// Message
// =============================================================================

/// Network message types
#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    MerkleBlock(MerkleBlockMessage),
    Tx(FullTransaction),
    FilterLoad(BloomFilter),
    Ping(u64),
    Pong(u64),
    GetBlocks {
        version: i32,
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Mempool,
    Addr(Vec<TimestampedAddr>),
    GetAddr,
    Reject(RejectMessage),
}

impl Message {
    /// Command name as written in the frame header
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::FilterLoad(_) => "filterload",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetBlocks { .. } => "getblocks",
            Message::Mempool => "mempool",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Reject(_) => "reject",
        }
    }

    /// Serialize the message body
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(v) => {
                out.extend_from_slice(&v.version.to_le_bytes());
                out.extend_from_slice(&v.services.bits().to_le_bytes());
                out.extend_from_slice(&v.timestamp.to_le_bytes());
                v.receiver.write(&mut out);
                v.sender.write(&mut out);
                out.extend_from_slice(&v.nonce.to_le_bytes());
                put_var_bytes(&mut out, v.user_agent.as_bytes());
                out.extend_from_slice(&v.start_height.to_le_bytes());
                out.push(v.relay as u8);
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                put_var_int(&mut out, items.len() as u64);
                for item in items {
                    out.extend_from_slice(&item.inv_type.as_u32().to_le_bytes());
                    out.extend_from_slice(&item.hash);
                }
            }
            Message::MerkleBlock(m) => {
                out.extend_from_slice(&m.header.serialize());
                out.extend_from_slice(&m.total_transactions.to_le_bytes());
                put_var_int(&mut out, m.hashes.len() as u64);
                for hash in &m.hashes {
                    out.extend_from_slice(hash);
                }
                put_var_bytes(&mut out, &m.flags);
            }
            Message::Tx(transaction) => out = transaction.serialize(),
            Message::FilterLoad(filter) => out = filter.to_bytes(),
            Message::Ping(nonce) | Message::Pong(nonce) => out.extend_from_slice(&nonce.to_le_bytes()),
            Message::GetBlocks { version, locator, stop } => {
                out.extend_from_slice(&version.to_le_bytes());
                put_var_int(&mut out, locator.len() as u64);
                for hash in locator {
                    out.extend_from_slice(hash);
                }
                out.extend_from_slice(stop);
            }
            Message::Addr(addrs) => {
                put_var_int(&mut out, addrs.len() as u64);
                for entry in addrs {
                    out.extend_from_slice(&entry.time.to_le_bytes());
                    entry.addr.write(&mut out);
                }
            }
            Message::Reject(r) => {
                put_var_bytes(&mut out, r.message.as_bytes());
                out.push(r.code);
                put_var_bytes(&mut out, r.reason.as_bytes());
                out.extend_from_slice(&r.data);
            }
            Message::VerAck | Message::Mempool | Message::GetAddr => {}
        }
        out
    }

    /// Parse a message body. Returns `None` for commands we do not handle.
    pub fn parse(command: &str, payload: &[u8]) -> Result<Option<Self>, MessageError> {
        let mut reader = Reader::new(payload);
        let message = match command {
            "version" => Self::parse_version(&mut reader).map_err(decode("version"))?,
            "verack" => Message::VerAck,
            "inv" => Message::Inv(Self::parse_inv(&mut reader, "inv")?),
            "getdata" => Message::GetData(Self::parse_inv(&mut reader, "getdata")?),
            "notfound" => Message::NotFound(Self::parse_inv(&mut reader, "notfound")?),
            "merkleblock" => Self::parse_merkle_block(&mut reader).map_err(decode("merkleblock"))?,
            "tx" => Message::Tx(FullTransaction::read(&mut reader).map_err(decode("tx"))?),
            "filterload" => Self::parse_filter_load(&mut reader).map_err(decode("filterload"))?,
            "ping" => Message::Ping(reader.read_u64().map_err(decode("ping"))?),
            // pre-BIP31 pongs carry no nonce
            "pong" => Message::Pong(reader.read_u64().unwrap_or(0)),
            "getblocks" => Self::parse_get_blocks(&mut reader).map_err(decode("getblocks"))?,
            "mempool" => Message::Mempool,
            "addr" => Message::Addr(Self::parse_addr(&mut reader)?),
            "getaddr" => Message::GetAddr,
            "reject" => Self::parse_reject(&mut reader).map_err(decode("reject"))?,
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    fn parse_version(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32()?;
        let services = ServiceFlags::from_bits_retain(reader.read_u64()?);
        let timestamp = reader.read_i64()?;
        let receiver = NetAddr::read(reader)?;
        let sender = NetAddr::read(reader)?;
        let nonce = reader.read_u64()?;
        let user_agent = reader.read_var_string()?;
        let start_height = reader.read_i32()?;
        // the relay flag is optional before protocol 70001
        let relay = if reader.is_empty() { true } else { reader.read_u8()? != 0 };

        Ok(Message::Version(VersionMessage {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        }))
    }

    fn parse_inv(reader: &mut Reader<'_>, command: &'static str) -> Result<Vec<InvItem>, MessageError> {
        let count = reader.read_count(36).map_err(decode(command))?;
        if count > MAX_INV_PER_MESSAGE {
            return Err(MessageError::TooManyItems(command));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let inv_type = InvType::from_u32(reader.read_u32().map_err(decode(command))?);
            let hash = reader.read_hash().map_err(decode(command))?;
            items.push(InvItem { inv_type, hash });
        }
        Ok(items)
    }

    fn parse_merkle_block(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::read(reader)?;
        let total_transactions = reader.read_u32()?;
        let hash_count = reader.read_count(32)?;
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(reader.read_hash()?);
        }
        let flags = reader.read_var_bytes()?;

        Ok(Message::MerkleBlock(MerkleBlockMessage {
            header,
            total_transactions,
            hashes,
            flags,
        }))
    }

    fn parse_filter_load(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let data = reader.read_var_bytes()?;
        let hash_funcs = reader.read_u32()?;
        let tweak = reader.read_u32()?;
        let flags = reader.read_u8()?;
        Ok(Message::FilterLoad(BloomFilter::from_parts(data, hash_funcs, tweak, flags)))
    }

    fn parse_get_blocks(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32()?;
        let count = reader.read_count(32)?;
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(reader.read_hash()?);
        }
        let stop = reader.read_hash()?;
        Ok(Message::GetBlocks { version, locator, stop })
    }

    fn parse_addr(reader: &mut Reader<'_>) -> Result<Vec<TimestampedAddr>, MessageError> {
        let count = reader.read_count(30).map_err(decode("addr"))?;
        if count > MAX_ADDR_PER_MESSAGE {
            return Err(MessageError::TooManyItems("addr"));
        }
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            let time = reader.read_u32().map_err(decode("addr"))?;
            let addr = NetAddr::read(reader).map_err(decode("addr"))?;
            addrs.push(TimestampedAddr { time, addr });
        }
        Ok(addrs)
    }

    fn parse_reject(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let message = reader.read_var_string()?;
        let code = reader.read_u8()?;
        let reason = reader.read_var_string()?;
        let data = reader.read_bytes(reader.remaining())?;
        Ok(Message::Reject(RejectMessage {
            message,
            code,
            reason,
            data,
        }))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write!(f, "{}({} items)", self.command(), items.len())
            }
            Message::MerkleBlock(m) => write!(f, "merkleblock({})", m.header.hash_hex()),
            Message::Tx(tx) => write!(f, "tx({})", tx.header.hash_hex()),
            Message::Reject(r) => write!(f, "reject({} {}: {})", r.message, r.code, r.reason),
            Message::GetBlocks { locator, .. } => match locator.first() {
                Some(hash) => write!(f, "getblocks({})", to_reversed_hex(hash)),
                None => write!(f, "getblocks"),
            },
            _ => write!(f, "{}", self.command()),
        }
    }
}

fn decode(command: &'static str) -> impl Fn(DecodeError) -> MessageError {
    move |source| MessageError::Decode { command, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{double_sha256, calculate_merkle_root};

    fn reparse(message: &Message) -> Message {
        Message::parse(message.command(), &message.payload()).unwrap().unwrap()
    }

    #[test]
    fn test_version_layout() {
        let receiver = NetAddr::new("10.0.0.1".parse().unwrap(), 8333, ServiceFlags::NETWORK);
        let mut version = VersionMessage::new(70014, receiver.clone(), 120);
        version.nonce = 7;
        version.timestamp = 1_600_000_000;

        let payload = Message::Version(version.clone()).payload();
        // 4 + 8 + 8 + 26 + 26 + 8 + (1 + agent) + 4 + 1
        assert_eq!(payload.len(), 86 + USER_AGENT.len());
        // ipv4-mapped receiver address follows the timestamp and its services
        assert_eq!(&payload[28..40], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&payload[44..46], &8333u16.to_be_bytes());

        match reparse(&Message::Version(version.clone())) {
            Message::Version(parsed) => {
                assert_eq!(parsed, version);
                assert_eq!(parsed.receiver.ip, receiver.ip);
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_version_without_relay_flag() {
        let version = VersionMessage::new(60000, NetAddr::unspecified(), 0);
        let mut payload = Message::Version(version).payload();
        payload.pop();

        match Message::parse("version", &payload).unwrap() {
            Some(Message::Version(parsed)) => assert!(parsed.relay),
            _ => panic!("expected version"),
        }
    }

    #[test]
    fn test_inv_encoding() {
        let message = Message::Inv(vec![InvItem::tx([1u8; 32]), InvItem::new(InvType::Block, [2u8; 32])]);
        let payload = message.payload();
        assert_eq!(payload.len(), 1 + 2 * 36);
        assert_eq!(&payload[1..5], &[1, 0, 0, 0]);

        match reparse(&message) {
            Message::Inv(items) => {
                assert_eq!(items[0], InvItem::tx([1u8; 32]));
                assert_eq!(items[1].inv_type, InvType::Block);
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_inv_count_exceeding_payload_rejected() {
        // claims 3 items, carries one
        let mut payload = vec![3u8];
        payload.extend_from_slice(&[1, 0, 0, 0]);
        payload.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            Message::parse("inv", &payload),
            Err(MessageError::Decode { command: "inv", .. })
        ));
    }

    #[test]
    fn test_merkle_block_checks_root() {
        let leaves: Vec<Hash256> = (1..=3u8).map(|b| double_sha256(&[b])).collect();
        let root = calculate_merkle_root(&leaves);
        let header = BlockHeader::new(1, [0u8; 32], root, 1_600_000_000, 0x207f_ffff, 0);

        // root only, nothing matched
        let message = MerkleBlockMessage {
            header: header.clone(),
            total_transactions: 3,
            hashes: vec![root],
            flags: vec![0],
        };
        let merkle_block = message.to_merkle_block().unwrap();
        assert!(merkle_block.associated_transaction_hashes.is_empty());
        assert!(merkle_block.complete());

        let bad = MerkleBlockMessage {
            hashes: vec![[9u8; 32]],
            ..message
        };
        assert!(matches!(bad.to_merkle_block(), Err(MessageError::MerkleRootMismatch(_))));
    }

    #[test]
    fn test_getblocks_layout() {
        let message = Message::GetBlocks {
            version: 70014,
            locator: vec![[1u8; 32], [2u8; 32]],
            stop: [0u8; 32],
        };
        assert_eq!(message.payload().len(), 4 + 1 + 64 + 32);
        match reparse(&message) {
            Message::GetBlocks { locator, .. } => assert_eq!(locator.len(), 2),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_addr_and_reject() {
        let addr = TimestampedAddr {
            time: 1_600_000_000,
            addr: NetAddr::new("2001:db8::1".parse().unwrap(), 18333, ServiceFlags::NETWORK | ServiceFlags::BLOOM),
        };
        match reparse(&Message::Addr(vec![addr.clone()])) {
            Message::Addr(addrs) => assert_eq!(addrs, vec![addr]),
            other => panic!("unexpected {}", other),
        }

        let reject = RejectMessage {
            message: "tx".to_string(),
            code: 0x42,
            reason: "insufficient fee".to_string(),
            data: vec![3u8; 32],
        };
        match reparse(&Message::Reject(reject.clone())) {
            Message::Reject(parsed) => assert_eq!(parsed, reject),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_unknown_command_is_skipped() {
        assert!(Message::parse("sendcmpct", &[0, 1, 2]).unwrap().is_none());
        assert!(matches!(Message::parse("verack", &[]).unwrap(), Some(Message::VerAck)));
    }

    #[test]
    fn test_service_flags() {
        let services = ServiceFlags::from_bits_retain(0x40d);
        assert!(services.contains(ServiceFlags::NETWORK | ServiceFlags::BLOOM));
        assert!(!ServiceFlags::NETWORK.contains(ServiceFlags::BLOOM));
    }
}
