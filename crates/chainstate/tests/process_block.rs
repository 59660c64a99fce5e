mod common;

use btcnode_chainstate::{BehaviorFlags, ChainError, ErrorCode};
use btcnode_consensus::block_subsidy;
use btcnode_primitives::block::BlockHeader;
use btcnode_primitives::outpoint::OutPoint;

use common::*;

#[test]
fn connected_block_notifies_connect_then_accept() {
    let harness = Harness::new();
    let block = next_block(&harness.genesis(), 1, Vec::new());

    let (is_main, is_orphan) = harness.process(&block).expect("process");
    assert!(is_main);
    assert!(!is_orphan);
    assert_eq!(harness.tip_hash(), block.hash());
    assert_eq!(
        harness.take_events(),
        vec![("BlockConnected", block.hash()), ("BlockAccepted", block.hash())]
    );

    let best = harness.chain.best_snapshot();
    assert_eq!(best.height, 1);
    assert_eq!(best.num_txns, 1);
    assert_eq!(best.total_txns, 2);
    assert_eq!(best.bits, 0x207f_ffff);
}

#[test]
fn duplicates_are_rejected() {
    let harness = Harness::new();
    let (blocks, _) = build_chain(&harness.genesis(), 3, 1);

    harness.process(&blocks[0]).expect("first");
    assert_eq!(rule_code(harness.process(&blocks[0])), ErrorCode::DuplicateBlock);

    // blocks[2] has no parent yet, so it is held as an orphan.
    let (_, is_orphan) = harness.process(&blocks[2]).expect("orphan");
    assert!(is_orphan);
    assert_eq!(rule_code(harness.process(&blocks[2])), ErrorCode::DuplicateBlock);

    let genesis = harness.chain.block_by_height(0).expect("genesis");
    assert_eq!(rule_code(harness.process(&genesis)), ErrorCode::DuplicateBlock);
}

#[test]
fn orphans_connect_once_their_parent_arrives() {
    let harness = Harness::new();
    let (blocks, tip) = build_chain(&harness.genesis(), 4, 1);

    for block in blocks[1..].iter().rev() {
        let (is_main, is_orphan) = harness.process(block).expect("orphan");
        assert!(!is_main);
        assert!(is_orphan);
    }
    assert!(harness.chain.is_known_orphan(&blocks[3].hash()));
    assert!(harness.chain.have_block(&blocks[3].hash()));
    assert_eq!(harness.chain.get_orphan_root(&blocks[3].hash()), blocks[1].hash());
    assert_eq!(harness.tip_hash(), harness.params.hash_genesis_block);
    assert!(harness.take_events().is_empty());

    let (is_main, is_orphan) = harness.process(&blocks[0]).expect("parent");
    assert!(is_main);
    assert!(!is_orphan);
    assert_eq!(harness.tip_hash(), tip.hash);
    assert_eq!(harness.chain.best_snapshot().height, 4);
    assert!(!harness.chain.is_known_orphan(&blocks[3].hash()));

    let connected: Vec<_> = harness
        .take_events()
        .into_iter()
        .filter(|(kind, _)| *kind == "BlockConnected")
        .map(|(_, hash)| hash)
        .collect();
    assert_eq!(connected, blocks.iter().map(|block| block.hash()).collect::<Vec<_>>());
}

#[test]
fn invalid_orphan_does_not_strand_its_siblings() {
    let harness = Harness::new();
    let genesis = harness.genesis();
    let a = next_block(&genesis, 1, Vec::new());
    let a_tip = Tip::of(&a, 1);

    // Same parent as `good`, but stamped no later than the median past time.
    let stale = assemble(
        BlockHeader {
            version: VERSION,
            prev_block: a.hash(),
            merkle_root: [0u8; 32],
            time: genesis.time,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        vec![coinbase(2, 1)],
    );
    let good = next_block(&a_tip, 2, Vec::new());

    for orphan in [&stale, &good] {
        let (_, is_orphan) = harness.process(orphan).expect("orphan");
        assert!(is_orphan);
    }

    let (is_main, is_orphan) = harness.process(&a).expect("parent");
    assert!(is_main);
    assert!(!is_orphan);
    assert_eq!(harness.tip_hash(), good.hash());
    assert_eq!(harness.chain.best_snapshot().height, 2);
    assert!(!harness.chain.is_known_orphan(&good.hash()));
    assert!(!harness.chain.have_block(&stale.hash()));

    assert_eq!(rule_code(harness.process(&stale)), ErrorCode::TimeTooOld);
    assert_eq!(harness.tip_hash(), good.hash());
}

#[test]
fn coinbase_spends_wait_for_maturity() {
    let harness = Harness::new();
    let (blocks, tip) = build_chain(&harness.genesis(), 99, 1);
    harness.process_all(&blocks);
    assert_eq!(tip.height, 99);

    let coinbase_out = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let value = block_subsidy(1, 150) - 10_000;

    let early = next_block(&tip, 2, vec![spend(coinbase_out, value)]);
    assert_eq!(rule_code(harness.process(&early)), ErrorCode::ImmatureSpend);
    assert_eq!(harness.tip_hash(), tip.hash);

    let filler = next_block(&tip, 3, Vec::new());
    harness.process_all(std::slice::from_ref(&filler));
    let tip = Tip::of(&filler, 100);

    let spender = spend(coinbase_out, value);
    let block = next_block(&tip, 1, vec![spender.clone()]);
    harness.process_all(std::slice::from_ref(&block));
    assert_eq!(harness.chain.best_snapshot().height, 101);

    assert!(harness.chain.fetch_utxo_entry(&coinbase_out).expect("fetch").is_none());
    let created = harness
        .chain
        .fetch_utxo_entry(&OutPoint::new(spender.txid(), 0))
        .expect("fetch")
        .expect("new output");
    assert_eq!(created.amount(), value);
    assert_eq!(created.block_height(), 101);
    assert!(!created.is_coinbase());

    let view = harness.chain.fetch_utxo_view(&spender).expect("view");
    assert!(view.lookup_entry(&coinbase_out).is_none());
    assert!(view.lookup_entry(&OutPoint::new(spender.txid(), 0)).is_some());
}

#[test]
fn spending_an_unknown_output_fails() {
    let harness = Harness::new();
    let block = next_block(
        &harness.genesis(),
        1,
        vec![spend(OutPoint::new([7u8; 32], 0), 1_000)],
    );
    assert_eq!(rule_code(harness.process(&block)), ErrorCode::MissingTxOut);
    assert_eq!(harness.tip_hash(), harness.params.hash_genesis_block);
    // The block stays indexed so it is recognized as a duplicate.
    assert_eq!(rule_code(harness.process(&block)), ErrorCode::DuplicateBlock);
}

#[test]
fn coinbase_cannot_claim_more_than_the_subsidy() {
    let harness = Harness::new();
    let tip = harness.genesis();
    let greedy = coinbase_to(1, 1, block_subsidy(1, 150) + 1, vec![OP_TRUE]);
    let block = next_block_with(&tip, VERSION, greedy, Vec::new());
    assert_eq!(rule_code(harness.process(&block)), ErrorCode::BadCoinbaseValue);
}

#[test]
fn header_rules_are_enforced() {
    let harness = Harness::new();
    let (blocks, tip) = build_chain(&harness.genesis(), 3, 1);
    harness.process_all(&blocks);

    let mut hard = next_block(&tip, 2, Vec::new());
    hard.header.bits = 0x1f7f_ffff;
    solve(&mut hard, &harness.params.pow_limit);
    assert_eq!(rule_code(harness.process(&hard)), ErrorCode::UnexpectedDifficulty);

    // Median of the last four timestamps is the third block's.
    let stale_tip = Tip {
        time: tip.time - 2 * SPACING,
        ..tip
    };
    let stale = next_block(&stale_tip, 3, Vec::new());
    assert_eq!(stale.header.time, blocks[1].header.time);
    assert_eq!(rule_code(harness.process(&stale)), ErrorCode::TimeTooOld);

    let mut bad_merkle = next_block(&tip, 4, Vec::new());
    bad_merkle.header.merkle_root = [0u8; 32];
    solve(&mut bad_merkle, &harness.params.pow_limit);
    assert_eq!(rule_code(harness.process(&bad_merkle)), ErrorCode::BadMerkleRoot);

    let mut unsolved = next_block(&tip, 5, Vec::new());
    unsolve(&mut unsolved, &harness.params.pow_limit);
    assert_eq!(rule_code(harness.process(&unsolved)), ErrorCode::HighHash);
    harness
        .chain
        .process_block(unsolved, BehaviorFlags::NO_POW_CHECK)
        .expect("pow check skipped");
}

#[test]
fn block_templates_are_checked_against_the_tip() {
    let harness = Harness::new();
    let (blocks, tip) = build_chain(&harness.genesis(), 2, 1);
    harness.process_all(&blocks);

    // Templates are not mined yet.
    let mut template = next_block(&tip, 2, Vec::new());
    unsolve(&mut template, &harness.params.pow_limit);
    harness
        .chain
        .check_connect_block_template(&template)
        .expect("valid template");
    assert_eq!(harness.tip_hash(), tip.hash);

    let stale = next_block(&Tip::of(&blocks[0], 1), 3, Vec::new());
    let err = harness
        .chain
        .check_connect_block_template(&stale)
        .expect_err("stale template");
    assert_eq!(err.rule_code(), Some(ErrorCode::PrevBlockNotBest));

    let overpaid = next_block_with(
        &tip,
        VERSION,
        coinbase_to(3, 4, block_subsidy(3, 150) * 2, vec![OP_TRUE]),
        Vec::new(),
    );
    let err = harness
        .chain
        .check_connect_block_template(&overpaid)
        .expect_err("overpaid template");
    assert_eq!(err.rule_code(), Some(ErrorCode::BadCoinbaseValue));
}

#[test]
fn main_chain_queries() {
    let harness = Harness::new();
    let (blocks, tip) = build_chain(&harness.genesis(), 5, 1);
    harness.process_all(&blocks);
    let hashes: Vec<_> = std::iter::once(harness.params.hash_genesis_block)
        .chain(blocks.iter().map(|block| block.hash()))
        .collect();

    assert_eq!(harness.chain.block_height_by_hash(&hashes[3]).expect("height"), 3);
    assert_eq!(harness.chain.block_hash_by_height(4).expect("hash"), hashes[4]);
    assert!(matches!(
        harness.chain.block_hash_by_height(9),
        Err(ChainError::InvalidRequest(_))
    ));
    assert!(harness.chain.main_chain_has_block(&hashes[2]));
    assert!(!harness.chain.main_chain_has_block(&[3u8; 32]));

    assert_eq!(harness.chain.height_range(1, 4).expect("range"), hashes[1..4].to_vec());
    assert_eq!(harness.chain.height_range(0, 100).expect("range"), hashes);
    assert!(harness.chain.height_range(7, 9).expect("range").is_empty());
    assert!(harness.chain.height_range(3, 2).is_err());

    assert_eq!(
        harness.chain.height_to_hash_range(2, &tip.hash, 10).expect("range"),
        hashes[2..].to_vec()
    );
    assert!(harness.chain.height_to_hash_range(2, &tip.hash, 2).is_err());
    assert_eq!(
        harness.chain.interval_block_hashes(&tip.hash, 2).expect("interval"),
        vec![hashes[2], hashes[4]]
    );

    let header: BlockHeader = harness.chain.fetch_header(&hashes[5]).expect("header");
    assert_eq!(header.time, tip.time);
    assert_eq!(harness.chain.block_by_height(2).expect("block").hash(), hashes[2]);
    assert_eq!(harness.chain.latest_block_locator()[0], tip.hash);
    assert_eq!(
        harness.chain.block_locator_from_hash(&hashes[2]),
        vec![hashes[2], hashes[1], hashes[0]]
    );

    assert_eq!(
        harness
            .chain
            .calc_next_required_difficulty(i64::from(tip.time + SPACING))
            .expect("bits"),
        0x207f_ffff
    );
    // The fixed clock sits far past the tip.
    assert!(!harness.chain.is_current());
}
