mod common;

use std::sync::{Arc, Mutex};

use btcnode_chainstate::chainio::fetch_best_chain_state;
use btcnode_chainstate::{BehaviorFlags, BlockChain, ChainError, ErrorCode, IndexManager, SpentTxOut};
use btcnode_consensus::{consensus_params, Network};
use btcnode_pow::{block_work, U256};
use btcnode_primitives::block::Block;
use btcnode_primitives::outpoint::OutPoint;
use btcnode_storage::fjall::FjallStore;
use btcnode_storage::memory::MemoryStore;
use btcnode_storage::{Column, KeyValueStore, WriteBatch};

use common::*;

#[test]
fn memory_chain_reopens_at_its_tip() {
    let harness = Harness::new();
    let (blocks, tip) = build_chain(&harness.genesis(), 6, 1);
    harness.process_all(&blocks);
    let before = harness.chain.best_snapshot();

    let reopened = Harness::open(Arc::clone(&harness.store), harness.params.clone());
    let after = reopened.chain.best_snapshot();
    assert_eq!(*after, *before);
    assert_eq!(after.hash, tip.hash);
    assert_eq!(reopened.chain.block_hash_by_height(3).expect("hash"), blocks[2].hash());
    assert_eq!(
        reopened.chain.height_to_hash_range(1, &tip.hash, 10).expect("range"),
        blocks.iter().map(Block::hash).collect::<Vec<_>>()
    );

    let next = next_block(&tip, 1, Vec::new());
    assert_eq!(reopened.process(&next).expect("extend"), (true, false));
    assert_eq!(rule_code(reopened.process(&blocks[3])), ErrorCode::DuplicateBlock);
}

#[test]
fn stored_work_tracks_the_tip_across_reorganize() {
    let harness = Harness::new();
    let genesis = harness.genesis();
    let (main, _) = build_chain(&genesis, 3, 1);
    let (side, side_tip) = build_chain(&genesis, 4, 2);
    harness.process_all(&main);
    for block in &side {
        harness.process(block).expect("side");
    }
    assert_eq!(harness.tip_hash(), side_tip.hash);

    let saved = fetch_best_chain_state(harness.store.as_ref())
        .expect("fetch")
        .expect("saved state");
    assert_eq!(saved.hash, side_tip.hash);
    assert_eq!(saved.height, 4);
    assert_eq!(saved.total_txns, 5);
    assert_eq!(saved.work_sum, block_work(0x207f_ffff) * U256::from(5u64));
}

#[test]
fn fjall_chain_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let params = consensus_params(Network::Regtest);
    let (blocks, tip) = build_chain(&genesis_tip(&params), 4, 1);

    {
        let store = Arc::new(FjallStore::open(dir.path()).expect("open fjall"));
        let chain = open_chain(Arc::clone(&store), params.clone());
        for block in &blocks {
            chain
                .process_block(block.clone(), BehaviorFlags::NONE)
                .expect("process");
        }
        store.persist().expect("persist");
    }

    let store = Arc::new(FjallStore::open(dir.path()).expect("reopen fjall"));
    let chain = open_chain(Arc::clone(&store), params);
    let best = chain.best_snapshot();
    assert_eq!(best.hash, tip.hash);
    assert_eq!(best.height, 4);
    assert_eq!(best.total_txns, 5);
    assert_eq!(chain.block_by_height(2).expect("block").hash(), blocks[1].hash());
    assert!(chain
        .fetch_utxo_entry(&OutPoint::new(blocks[3].transactions[0].txid(), 0))
        .expect("fetch")
        .is_some());
}

/// Writes the height of the connected tip into the chain's own batch.
#[derive(Default)]
struct TipRecorder {
    events: Mutex<Vec<(bool, i32)>>,
}

const RECORDED_TIP_KEY: &[u8] = b"recorded-tip";

impl IndexManager for TipRecorder {
    fn connect_block(
        &self,
        batch: &mut WriteBatch,
        _block: &Block,
        height: i32,
        _stxos: &[SpentTxOut],
    ) -> Result<(), ChainError> {
        self.events.lock().expect("events").push((true, height));
        batch.put(Column::Meta, RECORDED_TIP_KEY, height.to_le_bytes());
        Ok(())
    }

    fn disconnect_block(
        &self,
        batch: &mut WriteBatch,
        _block: &Block,
        height: i32,
        _stxos: &[SpentTxOut],
    ) -> Result<(), ChainError> {
        self.events.lock().expect("events").push((false, height));
        batch.put(Column::Meta, RECORDED_TIP_KEY, (height - 1).to_le_bytes());
        Ok(())
    }
}

#[test]
fn index_manager_follows_connects_and_disconnects() {
    let params = consensus_params(Network::Regtest);
    let store = Arc::new(MemoryStore::new());
    let recorder = Arc::new(TipRecorder::default());
    let mut config = config_for(Arc::clone(&store), params.clone());
    config.index_manager = Some(Arc::clone(&recorder) as Arc<dyn IndexManager>);
    let chain = BlockChain::new(config).expect("open chain");

    let genesis = genesis_tip(&params);
    let (main, _) = build_chain(&genesis, 2, 1);
    let (side, _) = build_chain(&genesis, 3, 2);
    for block in main.iter().chain(side.iter()) {
        chain.process_block(block.clone(), BehaviorFlags::NONE).expect("process");
    }

    assert_eq!(
        *recorder.events.lock().expect("events"),
        vec![
            (true, 1),
            (true, 2),
            (false, 2),
            (false, 1),
            (true, 1),
            (true, 2),
            (true, 3),
        ]
    );
    let recorded = store
        .get(Column::Meta, RECORDED_TIP_KEY)
        .expect("get")
        .expect("recorded tip");
    assert_eq!(recorded, 3i32.to_le_bytes().to_vec());
}
