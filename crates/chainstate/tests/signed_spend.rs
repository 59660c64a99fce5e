mod common;

use btcnode_chainstate::ErrorCode;
use btcnode_consensus::block_subsidy;
use btcnode_primitives::hash::hash160;
use btcnode_primitives::outpoint::OutPoint;
use btcnode_primitives::transaction::{Transaction, TxIn, TxOut};
use btcnode_script::parse::push_data_script;
use btcnode_script::sighash::{signature_hash, SighashType, SigVersion, SIGHASH_ALL};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use common::*;

fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&hash160(pubkey));
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Spends `prevout` locked to `secret`, signing with SIGHASH_ALL.
fn signed_spend(prevout: OutPoint, value: i64, lock: &[u8], secret: &SecretKey) -> Transaction {
    let secp = Secp256k1::new();
    let pubkey = PublicKey::from_secret_key(&secp, secret).serialize();
    let mut tx = Transaction {
        version: 1,
        vin: vec![TxIn::new(prevout, Vec::new(), u32::MAX)],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    };
    let digest = signature_hash(&tx, 0, lock, value, SighashType(SIGHASH_ALL), SigVersion::Base, None);
    let mut sig = secp
        .sign_ecdsa(&Message::from_digest(digest), secret)
        .serialize_der()
        .to_vec();
    sig.push(SIGHASH_ALL as u8);

    let mut script_sig = push_data_script(&sig);
    script_sig.extend_from_slice(&push_data_script(&pubkey));
    tx.vin[0].script_sig = script_sig;
    tx
}

#[test]
fn signed_p2pkh_spend_is_verified_in_blocks() {
    let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret key");
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret).serialize();
    let lock = p2pkh(&pubkey);

    let harness = Harness::new();
    let subsidy = block_subsidy(1, 150);
    let funding = next_block_with(
        &harness.genesis(),
        VERSION,
        coinbase_to(1, 1, subsidy, lock.clone()),
        Vec::new(),
    );
    harness.process_all(std::slice::from_ref(&funding));
    let (blocks, tip) = build_chain(&Tip::of(&funding, 1), 100, 1);
    harness.process_all(&blocks);

    let prevout = OutPoint::new(funding.transactions[0].txid(), 0);
    let good = signed_spend(prevout, subsidy - 1_000, &lock, &secret);

    let mut forged = good.clone();
    forged.vout[0].value -= 1;
    let block = next_block(&tip, 2, vec![forged]);
    assert_eq!(rule_code(harness.process(&block)), ErrorCode::ScriptValidation);

    let wrong_key = SecretKey::from_slice(&[0x43; 32]).expect("secret key");
    let stolen = signed_spend(prevout, subsidy - 1_000, &lock, &wrong_key);
    let block = next_block(&tip, 3, vec![stolen]);
    assert_eq!(rule_code(harness.process(&block)), ErrorCode::ScriptValidation);
    assert_eq!(harness.tip_hash(), tip.hash);

    let block = next_block(&tip, 4, vec![good.clone()]);
    assert_eq!(harness.process(&block).expect("signed spend"), (true, false));
    assert!(harness.chain.fetch_utxo_entry(&prevout).expect("fetch").is_none());
    assert!(harness
        .chain
        .fetch_utxo_entry(&OutPoint::new(good.txid(), 0))
        .expect("fetch")
        .is_some());
}
