use btcnode_consensus::params::{consensus_params, Network};
use btcnode_pow::difficulty::{compact_to_target, hash_meets_target, target_to_compact};
use btcnode_pow::{check_proof_of_work, PowError};
use btcnode_primitives::genesis_block;

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_target(bits).expect("target");
    let back = target_to_compact(&target);
    assert_eq!(back, bits);
}

#[test]
fn compact_target_layout() {
    let bits = 0x207fffff;
    let target = compact_to_target(bits).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    let smaller = [0x00u8; 32];
    let larger = [0xffu8; 32];
    assert!(hash_meets_target(&smaller, &target));
    assert!(!hash_meets_target(&larger, &target));
}

#[test]
fn genesis_blocks_carry_valid_work() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = consensus_params(network);
        let genesis = genesis_block(&params);
        check_proof_of_work(&genesis.header, &params.pow_limit, true).expect("genesis pow");
    }
}

#[test]
fn out_of_range_targets_are_rejected() {
    let params = consensus_params(Network::Mainnet);
    let mut header = genesis_block(&params).header;

    header.bits = 0x207fffff;
    assert_eq!(
        check_proof_of_work(&header, &params.pow_limit, false),
        Err(PowError::TargetAboveLimit(0x207fffff))
    );

    header.bits = 0;
    assert_eq!(
        check_proof_of_work(&header, &params.pow_limit, false),
        Err(PowError::TargetNotPositive(0))
    );

    header.bits = 0x1d80ffff;
    assert_eq!(
        check_proof_of_work(&header, &params.pow_limit, false),
        Err(PowError::TargetNotPositive(0x1d80ffff))
    );
}

#[test]
fn high_hash_is_rejected_unless_skipped() {
    let params = consensus_params(Network::Mainnet);
    let mut header = genesis_block(&params).header;
    header.bits = 0x1a01aa3d;
    assert_eq!(
        check_proof_of_work(&header, &params.pow_limit, true),
        Err(PowError::HighHash)
    );
    check_proof_of_work(&header, &params.pow_limit, false).expect("hash check skipped");
}
