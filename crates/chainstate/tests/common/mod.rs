#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use btcnode_chainstate::merkle::calc_merkle_root;
use btcnode_chainstate::validate::check_proof_of_work;
use btcnode_chainstate::{
    BehaviorFlags, BlockChain, ChainConfig, ChainError, ErrorCode, FixedTimeSource, Notification,
};
use btcnode_consensus::{block_subsidy, consensus_params, ConsensusParams, Hash256, Network};
use btcnode_primitives::block::{Block, BlockHeader};
use btcnode_primitives::outpoint::OutPoint;
use btcnode_primitives::transaction::{Transaction, TxIn, TxOut};
use btcnode_storage::KeyValueStore;
use btcnode_storage::memory::MemoryStore;

pub const OP_TRUE: u8 = 0x51;
pub const SPACING: u32 = 600;
pub const VERSION: i32 = 0x2000_0000;

/// Where the next block goes.
#[derive(Clone, Copy, Debug)]
pub struct Tip {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
}

impl Tip {
    pub fn of(block: &Block, height: i32) -> Self {
        Self {
            hash: block.hash(),
            height,
            time: block.header.time,
        }
    }
}

pub fn genesis_tip(params: &ConsensusParams) -> Tip {
    Tip {
        hash: params.hash_genesis_block,
        height: 0,
        time: params.genesis_time,
    }
}

/// Coinbase for `height` paying `value` to `script`. The tag keeps sibling
/// blocks at the same height distinct.
pub fn coinbase_to(height: i32, tag: u8, value: i64, script: Vec<u8>) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&height.to_le_bytes());
    script_sig.extend_from_slice(&[0x01, tag]);
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig, u32::MAX)],
        vout: vec![TxOut {
            value,
            script_pubkey: script,
        }],
        lock_time: 0,
    }
}

pub fn coinbase(height: i32, tag: u8) -> Transaction {
    coinbase_to(height, tag, block_subsidy(height, 150), vec![OP_TRUE])
}

/// Spends `prevout` (an OP_TRUE output) into a single OP_TRUE output.
pub fn spend(prevout: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(prevout, Vec::new(), u32::MAX)],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Grinds the nonce until the header satisfies its own target.
pub fn solve(block: &mut Block, pow_limit: &Hash256) {
    while check_proof_of_work(&block.header, pow_limit, BehaviorFlags::NONE).is_err() {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

/// Moves the nonce until the header misses its target.
pub fn unsolve(block: &mut Block, pow_limit: &Hash256) {
    while check_proof_of_work(&block.header, pow_limit, BehaviorFlags::NONE).is_ok() {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

pub fn assemble(header: BlockHeader, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header,
        transactions,
    };
    block.header.merkle_root = calc_merkle_root(&block.transactions, false);
    solve(&mut block, &consensus_params(Network::Regtest).pow_limit);
    block
}

pub fn next_block_with(tip: &Tip, version: i32, coinbase: Transaction, txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    assemble(
        BlockHeader {
            version,
            prev_block: tip.hash,
            merkle_root: [0u8; 32],
            time: tip.time + SPACING,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        transactions,
    )
}

pub fn next_block(tip: &Tip, tag: u8, txs: Vec<Transaction>) -> Block {
    next_block_with(tip, VERSION, coinbase(tip.height + 1, tag), txs)
}

/// `count` empty blocks on top of `tip`.
pub fn build_chain(tip: &Tip, count: usize, tag: u8) -> (Vec<Block>, Tip) {
    let mut blocks = Vec::with_capacity(count);
    let mut tip = *tip;
    for _ in 0..count {
        let block = next_block(&tip, tag, Vec::new());
        tip = Tip::of(&block, tip.height + 1);
        blocks.push(block);
    }
    (blocks, tip)
}

pub fn config_for<S>(store: Arc<S>, params: ConsensusParams) -> ChainConfig<S> {
    let now = i64::from(params.genesis_time) + 50_000_000;
    let mut config = ChainConfig::new(store, params);
    config.time_source = Arc::new(FixedTimeSource::new(now));
    config.verify_workers = 2;
    config
}

pub fn open_chain<S: KeyValueStore>(store: Arc<S>, params: ConsensusParams) -> BlockChain<S> {
    BlockChain::new(config_for(store, params)).expect("open chain")
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chain: BlockChain<MemoryStore>,
    pub params: ConsensusParams,
    pub events: Arc<Mutex<Vec<(&'static str, Hash256)>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_params(consensus_params(Network::Regtest))
    }

    pub fn with_params(params: ConsensusParams) -> Self {
        Self::open(Arc::new(MemoryStore::new()), params)
    }

    pub fn open(store: Arc<MemoryStore>, params: ConsensusParams) -> Self {
        let chain = open_chain(Arc::clone(&store), params.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        chain.subscribe(Box::new(move |notification: &Notification| {
            sink.lock()
                .expect("events")
                .push((notification.kind(), notification.block().hash()));
        }));
        Self {
            store,
            chain,
            params,
            events,
        }
    }

    pub fn genesis(&self) -> Tip {
        genesis_tip(&self.params)
    }

    pub fn process(&self, block: &Block) -> Result<(bool, bool), ChainError> {
        self.chain.process_block(block.clone(), BehaviorFlags::NONE)
    }

    /// Processes every block, which must all be accepted without becoming orphans.
    pub fn process_all(&self, blocks: &[Block]) {
        for block in blocks {
            let (_, is_orphan) = self.process(block).expect("process block");
            assert!(!is_orphan);
        }
    }

    pub fn take_events(&self) -> Vec<(&'static str, Hash256)> {
        std::mem::take(&mut *self.events.lock().expect("events"))
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.chain.best_snapshot().hash
    }
}

pub fn rule_code(result: Result<(bool, bool), ChainError>) -> ErrorCode {
    match result {
        Err(err) => err.rule_code().unwrap_or_else(|| panic!("not a rule error: {err}")),
        Ok(outcome) => panic!("expected a rule error, got {outcome:?}"),
    }
}
