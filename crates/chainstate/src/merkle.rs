//! Merkle trees over transaction hashes and the segwit witness commitment.

use btcnode_consensus::constants::{
    COINBASE_WITNESS_DATA_LEN, COINBASE_WITNESS_PK_SCRIPT_LEN, WITNESS_MAGIC_BYTES,
};
use btcnode_consensus::Hash256;
use btcnode_primitives::hash::sha256d_pair;
use btcnode_primitives::transaction::Transaction;

pub fn hash_merkle_branches(left: &Hash256, right: &Hash256) -> Hash256 {
    sha256d_pair(left, right)
}

/// Builds the whole tree as a flat array: leaves first, then each level up,
/// with the root last. Slots past the real leaves are `None`; a parent whose
/// right child is missing hashes its left child with itself.
pub fn build_merkle_tree_store_from_hashes(leaves: &[Hash256]) -> Vec<Option<Hash256>> {
    if leaves.is_empty() {
        return Vec::new();
    }
    let next_pot = leaves.len().next_power_of_two();
    let array_size = next_pot * 2 - 1;
    let mut merkles: Vec<Option<Hash256>> = vec![None; array_size];
    for (slot, leaf) in merkles.iter_mut().zip(leaves) {
        *slot = Some(*leaf);
    }

    let mut offset = next_pot;
    let mut i = 0;
    while i < array_size - 1 {
        merkles[offset] = match (merkles[i], merkles[i + 1]) {
            (None, _) => None,
            (Some(left), None) => Some(hash_merkle_branches(&left, &left)),
            (Some(left), Some(right)) => Some(hash_merkle_branches(&left, &right)),
        };
        offset += 1;
        i += 2;
    }
    merkles
}

/// Tree over txids, or over wtxids when `witness` is set. The coinbase wtxid
/// is taken as all zeros since its witness holds the commitment nonce.
pub fn build_merkle_tree_store(transactions: &[Transaction], witness: bool) -> Vec<Option<Hash256>> {
    let leaves: Vec<Hash256> = transactions
        .iter()
        .enumerate()
        .map(|(index, tx)| match (witness, index) {
            (true, 0) => [0u8; 32],
            (true, _) => tx.wtxid(),
            (false, _) => tx.txid(),
        })
        .collect();
    build_merkle_tree_store_from_hashes(&leaves)
}

pub fn calc_merkle_root(transactions: &[Transaction], witness: bool) -> Hash256 {
    build_merkle_tree_store(transactions, witness)
        .last()
        .copied()
        .flatten()
        .unwrap_or([0u8; 32])
}

pub fn merkle_root_from_hashes(leaves: &[Hash256]) -> Hash256 {
    build_merkle_tree_store_from_hashes(leaves)
        .last()
        .copied()
        .flatten()
        .unwrap_or([0u8; 32])
}

/// The nonce in the coinbase witness, when it has the required shape.
pub fn coinbase_witness_nonce(coinbase: &Transaction) -> Option<&[u8]> {
    let input = coinbase.vin.first()?;
    match input.witness.as_slice() {
        [nonce] if nonce.len() == COINBASE_WITNESS_DATA_LEN => Some(nonce.as_slice()),
        _ => None,
    }
}

/// The committed hash from the last output carrying the witness magic.
pub fn extract_witness_commitment(coinbase: &Transaction) -> Option<Hash256> {
    coinbase.vout.iter().rev().find_map(|output| {
        let script = output.script_pubkey.as_slice();
        if script.len() < COINBASE_WITNESS_PK_SCRIPT_LEN || !script.starts_with(&WITNESS_MAGIC_BYTES) {
            return None;
        }
        let mut commitment = [0u8; 32];
        commitment.copy_from_slice(&script[WITNESS_MAGIC_BYTES.len()..COINBASE_WITNESS_PK_SCRIPT_LEN]);
        Some(commitment)
    })
}

/// Commitment output script for a witness root and nonce.
pub fn witness_commitment_script(witness_root: &Hash256, nonce: &Hash256) -> Vec<u8> {
    let mut script = Vec::with_capacity(COINBASE_WITNESS_PK_SCRIPT_LEN);
    script.extend_from_slice(&WITNESS_MAGIC_BYTES);
    script.extend_from_slice(&hash_merkle_branches(witness_root, nonce));
    script
}
