//! The `btcnode` process: opens the chain state, optionally imports a bootstrap file and reports
//! the best chain.

pub mod config;
pub mod import;
pub mod store;

use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use btcnode_chainstate::{BehaviorFlags, BestState, BlockChain, ChainConfig, Interrupt};
use btcnode_consensus::{consensus_params, hash256_to_hex, Network};
use btcnode_log::{self as logging, log_info, log_warn};
use btcnode_storage::KeyValueStore;
use serde::Serialize;

use crate::config::{parse_args, usage, CliAction, Config};
use crate::import::import_blocks;
use crate::store::{lock_data_dir, open_store};

/// Best-chain snapshot printed by `--print-state`.
#[derive(Debug, Serialize)]
pub struct StateReport {
    pub network: &'static str,
    pub hash: String,
    pub height: i32,
    pub bits: String,
    pub block_size: u64,
    pub block_weight: u64,
    pub num_txns: u64,
    pub total_txns: u64,
    pub median_time: i64,
    pub is_current: bool,
    pub latest_checkpoint: Option<i32>,
}

impl StateReport {
    pub fn new<S: KeyValueStore>(network: Network, chain: &BlockChain<S>) -> Self {
        let best: Arc<BestState> = chain.best_snapshot();
        Self {
            network: network.as_str(),
            hash: hash256_to_hex(&best.hash),
            height: best.height,
            bits: format!("{:08x}", best.bits),
            block_size: best.block_size,
            block_weight: best.block_weight,
            num_txns: best.num_txns,
            total_txns: best.total_txns,
            median_time: best.median_time,
            is_current: chain.is_current(),
            latest_checkpoint: chain.latest_checkpoint().map(|checkpoint| checkpoint.height),
        }
    }
}

pub fn run_entry() -> Result<(), String> {
    let config = match parse_args()? {
        CliAction::Run(config) => config,
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("btcnode {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };
    logging::init(config.log.clone());
    run(&config)
}

pub fn run(config: &Config) -> Result<(), String> {
    if !config.unsupported_conf_keys.is_empty() {
        log_warn!(
            "Ignoring unsupported keys in {}: {}",
            config.conf_path.display(),
            config.unsupported_conf_keys.join(", ")
        );
    }

    let _lock = lock_data_dir(&config.data_dir)?;
    let store = Arc::new(open_store(config)?);

    let stop_flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop_flag))
            .map_err(|err| format!("failed to install signal handler: {err}"))?;
    }

    let mut chain_config = ChainConfig::new(Arc::clone(&store), consensus_params(config.network));
    chain_config.interrupt = Interrupt::from_flag(stop_flag);
    chain_config.checkpoints_enabled = config.checkpoints;
    chain_config.verify_workers = config.verify_workers;
    let chain = BlockChain::new(chain_config).map_err(|err| err.to_string())?;

    let best = chain.best_snapshot();
    log_info!(
        "Chain state ready on {} ({} backend): tip {} height {}",
        config.network.as_str(),
        config.backend.as_str(),
        hash256_to_hex(&best.hash),
        best.height
    );

    let mut result = Ok(());
    if let Some(path) = &config.import_path {
        log_info!("Importing blocks from {}", path.display());
        let file = File::open(path)
            .map_err(|err| format!("failed to open {}: {err}", path.display()))?;
        result = import_blocks(&chain, BufReader::new(file), BehaviorFlags::NONE)
            .map(|_| ())
            .map_err(|err| err.to_string());
    }

    // Whatever was imported before a failure stays durable.
    store.flush().map_err(|err| err.to_string())?;
    result?;

    if config.print_state {
        let report = StateReport::new(config.network, &chain);
        let json = serde_json::to_string_pretty(&report).map_err(|err| err.to_string())?;
        println!("{json}");
    }
    Ok(())
}
