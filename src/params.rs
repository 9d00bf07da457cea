//! Per-network consensus parameters.

use crate::blockchain::{Block, BlockHeader};
use crate::consensus::{COIN, ONE_MEGABYTE, SEQUENCE_FINAL};
use crate::error::{ChainError, Result};
use crate::hash::{from_hex, Sha256Hash, ZERO_HASH};
use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Network::Main => f.write_str("main"),
            Network::Regtest => f.write_str("regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" | "mainnet" => Ok(Network::Main),
            "regtest" => Ok(Network::Regtest),
            other => Err(ChainError::Config(format!("unknown network '{}'", other))),
        }
    }
}

/// Name of the relative lock-time deployment (BIP68/112/113).
pub const CSV_DEPLOYMENT: &str = "csv";

/// A versionbits soft-fork deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub bit: u8,
    /// Median-time-past at which signaling starts; [`Deployment::ALWAYS_ACTIVE`]
    /// makes the rule active from genesis.
    pub start_time: i64,
    pub timeout: i64,
    pub threshold: u32,
    pub window: u32,
    /// Once active, blocks must keep signaling the bit.
    pub mandatory_signal: bool,
}

impl Deployment {
    pub const ALWAYS_ACTIVE: i64 = -1;
    pub const NO_TIMEOUT: i64 = i64::MAX;

    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }
}

/// Block size and signature-operation ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeLimits {
    /// Block size ceiling before `size_fork_height`.
    pub legacy_block_size: u64,
    /// Block size ceiling from `size_fork_height` on.
    pub fork_block_size: u64,
    /// Signature operations allowed per started megabyte of block.
    pub sigops_per_mb: u64,
    pub max_tx_sigops: u64,
    pub max_tx_size: usize,
    /// Enforced from `canonical_ordering_height`.
    pub min_tx_size: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        SizeLimits {
            legacy_block_size: ONE_MEGABYTE,
            fork_block_size: 32 * ONE_MEGABYTE,
            sigops_per_mb: 20_000,
            max_tx_sigops: 20_000,
            max_tx_size: 1_000_000,
            min_tx_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub genesis: Block,
    pub pow_limit_bits: u32,
    pub target_timespan: u32,
    pub target_spacing: u32,
    pub allow_min_difficulty: bool,
    pub no_retargeting: bool,
    pub halving_interval: u32,
    pub initial_subsidy: i64,
    pub coinbase_maturity: u32,
    pub bip16_height: u32,
    pub bip34_height: u32,
    pub bip65_height: u32,
    pub bip66_height: u32,
    pub size_fork_height: u32,
    pub canonical_ordering_height: u32,
    pub max_future_block_time: i64,
    pub limits: SizeLimits,
    pub checkpoints: BTreeMap<u32, Sha256Hash>,
    pub deployments: Vec<Deployment>,
}

const GENESIS_MESSAGE: &[u8] = b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_OUTPUT_KEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1,
    0xa6, 0x71, 0x30, 0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09,
    0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f, 0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc,
    0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5, 0x1e, 0xc1, 0x12,
    0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

const MAINNET_CHECKPOINTS: &[(u32, &str)] = &[
    (11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    (33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    (74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    (105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    (134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    (168_000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
    (193_000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
    (210_000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
    (216_116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
    (225_430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
    (250_000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    (279_000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
    (295_000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
];

fn genesis_block(time: u32, nonce: u32, bits: u32, version: i32, reward: i64) -> Block {
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    script_sig.push(GENESIS_MESSAGE.len() as u8);
    script_sig.extend_from_slice(GENESIS_MESSAGE);

    let mut script_pubkey = vec![0x41];
    script_pubkey.extend_from_slice(&GENESIS_OUTPUT_KEY);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::NULL,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut {
            value: reward,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let mut block = Block {
        header: BlockHeader {
            version,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            time,
            bits,
            nonce,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    block
}

impl ChainParams {
    pub fn for_network(network: Network) -> Result<Self> {
        match network {
            Network::Main => Self::mainnet(),
            Network::Regtest => Ok(Self::regtest()),
        }
    }

    pub fn mainnet() -> Result<Self> {
        let checkpoints = MAINNET_CHECKPOINTS
            .iter()
            .map(|(height, hash)| Ok((*height, from_hex(hash)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(ChainParams {
            network: Network::Main,
            genesis: genesis_block(1_231_006_505, 2_083_236_893, 0x1d00_ffff, 1, 50 * COIN),
            pow_limit_bits: 0x1d00_ffff,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            allow_min_difficulty: false,
            no_retargeting: false,
            halving_interval: 210_000,
            initial_subsidy: 50 * COIN,
            coinbase_maturity: 100,
            bip16_height: 173_805,
            bip34_height: 227_931,
            bip65_height: 388_381,
            bip66_height: 363_725,
            size_fork_height: 478_559,
            canonical_ordering_height: 556_767,
            max_future_block_time: 2 * 60 * 60,
            limits: SizeLimits::default(),
            checkpoints,
            deployments: vec![Deployment {
                name: CSV_DEPLOYMENT.to_string(),
                bit: 0,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
                threshold: 1916,
                window: 2016,
                mandatory_signal: false,
            }],
        })
    }

    pub fn regtest() -> Self {
        let genesis = genesis_block(1_296_688_602, 2, 0x207f_ffff, 1, 50 * COIN);
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, genesis.hash());

        ChainParams {
            network: Network::Regtest,
            genesis,
            pow_limit_bits: 0x207f_ffff,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            allow_min_difficulty: true,
            no_retargeting: true,
            halving_interval: 150,
            initial_subsidy: 50 * COIN,
            coinbase_maturity: 100,
            bip16_height: 0,
            bip34_height: 1,
            bip65_height: 1,
            bip66_height: 1,
            size_fork_height: 0,
            canonical_ordering_height: 0,
            max_future_block_time: 2 * 60 * 60,
            limits: SizeLimits::default(),
            checkpoints,
            deployments: vec![
                Deployment {
                    name: CSV_DEPLOYMENT.to_string(),
                    bit: 0,
                    start_time: Deployment::ALWAYS_ACTIVE,
                    timeout: Deployment::NO_TIMEOUT,
                    threshold: 108,
                    window: 144,
                    mandatory_signal: false,
                },
                Deployment {
                    name: "testdummy".to_string(),
                    bit: 28,
                    start_time: 0,
                    timeout: Deployment::NO_TIMEOUT,
                    threshold: 108,
                    window: 144,
                    mandatory_signal: false,
                },
            ],
        }
    }

    pub fn genesis_block(&self) -> Block {
        self.genesis.clone()
    }

    pub fn genesis_hash(&self) -> Sha256Hash {
        self.genesis.hash()
    }

    pub fn deployment(&self, name: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.name == name)
    }

    /// Blocks between difficulty adjustments.
    pub fn retarget_interval(&self) -> u32 {
        self.target_timespan / self.target_spacing
    }

    pub fn subsidy(&self, height: u32) -> i64 {
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            return 0;
        }
        self.initial_subsidy >> halvings
    }

    pub fn max_block_size(&self, height: u32) -> u64 {
        if height >= self.size_fork_height {
            self.limits.fork_block_size
        } else {
            self.limits.legacy_block_size
        }
    }

    /// Largest block size any height may use, for context-free checks.
    pub fn max_block_size_any(&self) -> u64 {
        self.limits.legacy_block_size.max(self.limits.fork_block_size)
    }

    /// Signature operations allowed in a block of `block_size` bytes.
    pub fn max_block_sigops(&self, block_size: u64) -> u64 {
        let megabytes = 1 + block_size.saturating_sub(1) / ONE_MEGABYTE;
        megabytes * self.limits.sigops_per_mb
    }

    pub fn add_checkpoint(&mut self, height: u32, hash: Sha256Hash) {
        self.checkpoints.insert(height, hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::to_hex;

    #[test]
    fn genesis_hashes_match_published_values() {
        assert_eq!(
            to_hex(&ChainParams::mainnet().unwrap().genesis_hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            to_hex(&ChainParams::regtest().genesis_hash()),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn subsidy_halves() {
        let params = ChainParams::mainnet().unwrap();
        assert_eq!(params.subsidy(0), 50 * COIN);
        assert_eq!(params.subsidy(209_999), 50 * COIN);
        assert_eq!(params.subsidy(210_000), 25 * COIN);
        assert_eq!(params.subsidy(64 * 210_000), 0);

        let regtest = ChainParams::regtest();
        assert_eq!(regtest.subsidy(150), 25 * COIN);
    }

    #[test]
    fn size_ceiling_switches_at_fork_height() {
        let params = ChainParams::mainnet().unwrap();
        assert_eq!(params.max_block_size(478_558), 1_000_000);
        assert_eq!(params.max_block_size(478_559), 32_000_000);
        assert_eq!(params.max_block_sigops(1), 20_000);
        assert_eq!(params.max_block_sigops(1_000_001), 40_000);
    }

    #[test]
    fn mainnet_checkpoints_parse() {
        let params = ChainParams::mainnet().unwrap();
        assert_eq!(params.checkpoints.len(), MAINNET_CHECKPOINTS.len());
        assert_eq!(
            to_hex(&params.checkpoints[&295_000]),
            "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"
        );
    }

    #[test]
    fn network_names() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert!("testnet9".parse::<Network>().is_err());
    }
}
