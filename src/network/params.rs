//! Network parameters
//!
//! Magic bytes, ports, seeds, address prefixes, checkpoints and difficulty
//! rules for each supported network.

use serde::{Deserialize, Serialize};

use crate::core::block::{BlockError, Checkpoint};
use crate::network::message::ServiceFlags;

// =============================================================================
// Constants
// =============================================================================

/// Protocol version we speak (BIP 37 bloom filters need at least 70001)
pub const PROTOCOL_VERSION: i32 = 70014;

/// Two weeks, the Bitcoin retarget timespan
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Ten minutes per block
pub const TARGET_SPACING: u32 = 10 * 60;

const MAINNET_GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c:0";
const MAINNET_LAST: &str = "000080202a520a09f18b5186f679c33e73be29cf9f11115c50b20100000000000000000090cf85095074059f12235453186f1149843ff76bb49e6b8285c9ccd85fd909cc0d4ecd5c38ff2917d618bbac:574560";

const TESTNET_BIP44: &str = "0200000097f2b61897ba2bed756cca30058bcc1c2dfbb4ed0e962f47f749dc03000000006b80079a1eda8071424e294fa56849370e331c8ff7e95034576c9789c8db0fa6da551153ab80011c9bdaca25:199584";
const TESTNET_LAST: &str = "00000020156a21785a04c71f78994d67ff00710b8c0987e3884d4b87d60100000000000099fc0dc3a2d16df3be913fdf8e4ccbb1516a9c77076350c5c01b9e22c6b108d14d8de65c453e011a971d6193:1518048";

const REGTEST_GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000:0";

// =============================================================================
// Network
// =============================================================================

/// Supported networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

// =============================================================================
// Network Parameters
// =============================================================================

/// Everything that differs between networks
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    /// Message start bytes, in wire order
    pub magic: [u8; 4],
    pub port: u16,
    pub protocol_version: i32,
    /// Services a peer must advertise to be useful to an SPV client
    pub required_services: ServiceFlags,
    pub dns_seeds: Vec<String>,
    /// BIP44 coin type
    pub coin_type: u32,
    pub pub_key_hash_prefix: u8,
    pub script_hash_prefix: u8,
    pub bech32_hrp: String,
    /// Lines of `{header hex}:{height}` for the oldest usable checkpoint
    pub bip44_checkpoint: Vec<String>,
    /// Lines of `{header hex}:{height}` for the newest hard checkpoint
    pub last_checkpoint: Vec<String>,
    /// Compact form of the easiest allowed target
    pub max_target_bits: u32,
    pub target_timespan: u32,
    pub target_spacing: u32,
    /// Testnet-style 20 minute rule, which makes `bits` unverifiable for SPV
    pub allow_min_difficulty_blocks: bool,
    /// Retargeting disabled entirely (regtest)
    pub no_retargeting: bool,
    /// Minimum relay fee rate that defines dust (sat/vbyte)
    pub dust_relay_fee_rate: u64,
}

impl NetworkParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            port: 8333,
            protocol_version: PROTOCOL_VERSION,
            required_services: ServiceFlags::NETWORK | ServiceFlags::BLOOM,
            dns_seeds: [
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
                "seed.bitcoin.sprovoost.nl",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            coin_type: 0,
            pub_key_hash_prefix: 0x00,
            script_hash_prefix: 0x05,
            bech32_hrp: "bc".to_string(),
            bip44_checkpoint: vec![MAINNET_GENESIS.to_string()],
            last_checkpoint: vec![MAINNET_LAST.to_string()],
            max_target_bits: 0x1d00ffff,
            target_timespan: TARGET_TIMESPAN,
            target_spacing: TARGET_SPACING,
            allow_min_difficulty_blocks: false,
            no_retargeting: false,
            dust_relay_fee_rate: 3,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            magic: [0x0b, 0x11, 0x09, 0x07],
            port: 18333,
            dns_seeds: [
                "testnet-seed.bitcoin.petertodd.org",
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "testnet-seed.bluematt.me",
                "testnet-seed.bitcoin.schildbach.de",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            coin_type: 1,
            pub_key_hash_prefix: 0x6f,
            script_hash_prefix: 0xc4,
            bech32_hrp: "tb".to_string(),
            bip44_checkpoint: vec![TESTNET_BIP44.to_string()],
            last_checkpoint: vec![TESTNET_LAST.to_string()],
            allow_min_difficulty_blocks: true,
            ..Self::mainnet()
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            port: 18444,
            dns_seeds: Vec::new(),
            bech32_hrp: "bcrt".to_string(),
            bip44_checkpoint: vec![REGTEST_GENESIS.to_string()],
            last_checkpoint: vec![REGTEST_GENESIS.to_string()],
            max_target_bits: 0x207fffff,
            allow_min_difficulty_blocks: true,
            no_retargeting: true,
            ..Self::testnet()
        }
    }

    pub fn bip44_checkpoint(&self) -> Result<Checkpoint, BlockError> {
        let lines: Vec<&str> = self.bip44_checkpoint.iter().map(String::as_str).collect();
        Checkpoint::from_lines(&lines)
    }

    pub fn last_checkpoint(&self) -> Result<Checkpoint, BlockError> {
        let lines: Vec<&str> = self.last_checkpoint.iter().map(String::as_str).collect();
        Checkpoint::from_lines(&lines)
    }

    /// Blocks per difficulty period
    pub fn retarget_interval(&self) -> u32 {
        self.target_timespan / self.target_spacing
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
