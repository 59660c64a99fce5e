//! Genesis block construction from per-network header fields.

use btcnode_consensus::{ConsensusParams, COIN};

use crate::block::{Block, BlockHeader};
use crate::hex::hex_to_bytes;
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut};

const GENESIS_MESSAGE: &[u8] = b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

/// The coinbase shared by every network's genesis block.
pub fn genesis_coinbase() -> Transaction {
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    script_sig.push(GENESIS_MESSAGE.len() as u8);
    script_sig.extend_from_slice(GENESIS_MESSAGE);

    let pubkey = hex_to_bytes(GENESIS_PUBKEY).unwrap_or_default();
    let mut script_pubkey = Vec::with_capacity(pubkey.len() + 2);
    script_pubkey.push(pubkey.len() as u8);
    script_pubkey.extend_from_slice(&pubkey);
    script_pubkey.push(0xac);

    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig, u32::MAX)],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

pub fn genesis_block(params: &ConsensusParams) -> Block {
    let coinbase = genesis_coinbase();
    let header = BlockHeader {
        version: params.genesis_version,
        prev_block: [0u8; 32],
        merkle_root: coinbase.txid(),
        time: params.genesis_time,
        bits: params.genesis_bits,
        nonce: params.genesis_nonce,
    };
    Block {
        header,
        transactions: vec![coinbase],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcnode_consensus::{consensus_params, hash256_to_hex, Network};

    #[test]
    fn genesis_hashes_match_params() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = consensus_params(network);
            let block = genesis_block(&params);
            assert_eq!(
                hash256_to_hex(&block.hash()),
                hash256_to_hex(&params.hash_genesis_block),
                "{network:?}"
            );
        }
    }

    #[test]
    fn genesis_merkle_root_is_coinbase_txid() {
        let block = genesis_block(&consensus_params(Network::Mainnet));
        assert_eq!(
            hash256_to_hex(&block.header.merkle_root),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(block.serialized_size(), 285);
        assert_eq!(block.consensus_encode().len(), 285);
    }
}
