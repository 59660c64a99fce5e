//! Consensus parameter definitions.

use crate::deployments::{Deployment, DeploymentId, DEFINED_DEPLOYMENTS};
use crate::hash::{hash256_from_hex, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet3",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "testnet3" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_version: i32,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    /// Highest allowed target, little-endian.
    pub pow_limit: Hash256,
    pub pow_limit_bits: u32,
    /// Header time from which P2SH scripts are evaluated.
    pub bip0016_time: u32,
    pub bip0034_height: i32,
    pub bip0065_height: i32,
    pub bip0066_height: i32,
    pub coinbase_maturity: i32,
    pub subsidy_reduction_interval: i32,
    pub target_timespan: i64,
    pub target_time_per_block: i64,
    pub retarget_adjustment_factor: i64,
    /// Allow a min-difficulty block once `min_diff_reduction_time` passes without one.
    pub reduce_min_difficulty: bool,
    pub min_diff_reduction_time: i64,
    pub pow_no_retargeting: bool,
    pub rule_change_activation_threshold: u32,
    pub miner_confirmation_window: u32,
    pub deployments: [Deployment; DEFINED_DEPLOYMENTS],
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn blocks_per_retarget(&self) -> i32 {
        (self.target_timespan / self.target_time_per_block) as i32
    }

    pub fn min_retarget_timespan(&self) -> i64 {
        self.target_timespan / self.retarget_adjustment_factor
    }

    pub fn max_retarget_timespan(&self) -> i64 {
        self.target_timespan * self.retarget_adjustment_factor
    }

    pub fn deployment(&self, id: DeploymentId) -> &Deployment {
        &self.deployments[id.as_usize()]
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Subdirectory of the data dir holding this network's store.
    pub data_dir_name: &'static str,
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    let data_dir_name = match network {
        Network::Mainnet => "mainnet",
        Network::Testnet => "testnet3",
        Network::Regtest => "regtest",
    };
    ChainParams {
        network,
        consensus: consensus_params(network),
        data_dir_name,
    }
}

const TARGET_TIMESPAN: i64 = 14 * 24 * 60 * 60;
const TARGET_TIME_PER_BLOCK: i64 = 10 * 60;

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("mainnet genesis hash"),
        genesis_version: 1,
        genesis_time: 1_231_006_505,
        genesis_bits: 0x1d00_ffff,
        genesis_nonce: 2_083_236_893,
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pow_limit_bits: 0x1d00_ffff,
        bip0016_time: 1_333_238_400,
        bip0034_height: 227_931,
        bip0065_height: 388_381,
        bip0066_height: 363_725,
        coinbase_maturity: 100,
        subsidy_reduction_interval: 210_000,
        target_timespan: TARGET_TIMESPAN,
        target_time_per_block: TARGET_TIME_PER_BLOCK,
        retarget_adjustment_factor: 4,
        reduce_min_difficulty: false,
        min_diff_reduction_time: 0,
        pow_no_retargeting: false,
        rule_change_activation_threshold: 1916,
        miner_confirmation_window: 2016,
        deployments: [
            Deployment {
                bit_number: 28,
                start_time: 1_199_145_601,
                expire_time: 1_230_767_999,
            },
            Deployment {
                bit_number: 0,
                start_time: 1_462_060_800,
                expire_time: 1_493_596_800,
            },
            Deployment {
                bit_number: 1,
                start_time: 1_479_168_000,
                expire_time: 1_510_704_000,
            },
        ],
        checkpoints: mainnet_checkpoints(),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash256_from_hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        )
        .expect("testnet genesis hash"),
        genesis_version: 1,
        genesis_time: 1_296_688_602,
        genesis_bits: 0x1d00_ffff,
        genesis_nonce: 414_098_458,
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pow_limit_bits: 0x1d00_ffff,
        bip0016_time: 1_329_264_000,
        bip0034_height: 21_111,
        bip0065_height: 581_885,
        bip0066_height: 330_776,
        coinbase_maturity: 100,
        subsidy_reduction_interval: 210_000,
        target_timespan: TARGET_TIMESPAN,
        target_time_per_block: TARGET_TIME_PER_BLOCK,
        retarget_adjustment_factor: 4,
        reduce_min_difficulty: true,
        min_diff_reduction_time: 20 * 60,
        pow_no_retargeting: false,
        rule_change_activation_threshold: 1512,
        miner_confirmation_window: 2016,
        deployments: [
            Deployment {
                bit_number: 28,
                start_time: 1_199_145_601,
                expire_time: 1_230_767_999,
            },
            Deployment {
                bit_number: 0,
                start_time: 1_456_790_400,
                expire_time: 1_493_596_800,
            },
            Deployment {
                bit_number: 1,
                start_time: 1_462_060_800,
                expire_time: 1_493_596_800,
            },
        ],
        checkpoints: parse_checkpoints(&[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )]),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    let always = Deployment {
        bit_number: 0,
        start_time: Deployment::ALWAYS_START,
        expire_time: Deployment::NO_TIMEOUT,
    };
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash256_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )
        .expect("regtest genesis hash"),
        genesis_version: 1,
        genesis_time: 1_296_688_602,
        genesis_bits: 0x207f_ffff,
        genesis_nonce: 2,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pow_limit_bits: 0x207f_ffff,
        bip0016_time: 0,
        bip0034_height: 100_000_000,
        bip0065_height: 1351,
        bip0066_height: 1251,
        coinbase_maturity: 100,
        subsidy_reduction_interval: 150,
        target_timespan: TARGET_TIMESPAN,
        target_time_per_block: TARGET_TIME_PER_BLOCK,
        retarget_adjustment_factor: 4,
        reduce_min_difficulty: true,
        min_diff_reduction_time: 20 * 60,
        pow_no_retargeting: true,
        rule_change_activation_threshold: 108,
        miner_confirmation_window: 144,
        deployments: [
            Deployment {
                bit_number: 28,
                ..always
            },
            Deployment {
                bit_number: 0,
                ..always
            },
            Deployment {
                bit_number: 1,
                ..always
            },
        ],
        checkpoints: Vec::new(),
    }
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hash).expect("checkpoint hash"),
        })
        .collect()
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[
        (
            11_111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ),
        (
            33_333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
        ),
        (
            74_000,
            "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
        ),
        (
            105_000,
            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
        ),
        (
            134_444,
            "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
        ),
        (
            168_000,
            "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
        ),
        (
            193_000,
            "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
        ),
        (
            210_000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
        ),
        (
            216_116,
            "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e",
        ),
        (
            225_430,
            "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932",
        ),
        (
            250_000,
            "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
        ),
        (
            267_300,
            "000000000000000a83fbd660e918f218bf37edd92b748ad940483c7c116179ac",
        ),
        (
            279_000,
            "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40",
        ),
        (
            300_255,
            "0000000000000000162804527c6e9b9f0563a280525f9d08c12041def0a0f3b2",
        ),
        (
            319_400,
            "000000000000000021c6052e9becade189495d1c539aa37c58917305fd15f13b",
        ),
        (
            343_185,
            "0000000000000000072b8bf361d01a6ba7d445dd024203fafc78768ed4368554",
        ),
        (
            352_940,
            "000000000000000010755df42dba556bb72be6a32f3ce0b6941ce4430152c9ff",
        ),
        (
            382_320,
            "00000000000000000a8dc6ed5b133d0eb2fd6af56203e4159789b092defd8ab2",
        ),
    ])
}
