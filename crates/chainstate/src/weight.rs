//! Block and transaction weight plus signature-operation cost.

use btcnode_consensus::constants::WITNESS_SCALE_FACTOR;
use btcnode_primitives::block::Block;
use btcnode_primitives::transaction::Transaction;
use btcnode_script::interpreter::ScriptFlags;
use btcnode_script::sigops::{precise_sig_op_count, sig_op_count, witness_sig_op_count};
use btcnode_script::standard::is_p2sh;

use crate::error::{rule_error, ChainError, ErrorCode};
use crate::utxoviewpoint::UtxoViewpoint;

/// Witness bytes count once, everything else `WITNESS_SCALE_FACTOR` times.
pub fn block_weight(block: &Block) -> usize {
    block.stripped_size() * (WITNESS_SCALE_FACTOR - 1) + block.serialized_size()
}

pub fn transaction_weight(tx: &Transaction) -> usize {
    tx.stripped_size() * (WITNESS_SCALE_FACTOR - 1) + tx.serialized_size()
}

/// Legacy sig-op count over every input and output script, with multisig
/// charged the maximum.
pub fn count_sig_ops(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| sig_op_count(&input.script_sig, false))
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| sig_op_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Sig-ops inside the redeem scripts of inputs that spend P2SH outputs.
pub fn count_p2sh_sig_ops(
    tx: &Transaction,
    is_coinbase: bool,
    view: &UtxoViewpoint,
) -> Result<usize, ChainError> {
    if is_coinbase {
        return Ok(0);
    }
    let mut total = 0usize;
    for (index, input) in tx.vin.iter().enumerate() {
        let entry = view
            .lookup_entry(&input.prevout)
            .filter(|entry| !entry.is_spent())
            .ok_or_else(|| missing_input(tx, index, input))?;
        let pk_script = entry.pk_script();
        if !is_p2sh(pk_script) {
            continue;
        }
        total += precise_sig_op_count(&input.script_sig, pk_script, true);
    }
    Ok(total)
}

/// Weighted cost: legacy and P2SH sig-ops scaled up, witness sig-ops at face value.
pub fn sig_op_cost(
    tx: &Transaction,
    is_coinbase: bool,
    view: &UtxoViewpoint,
    bip16: bool,
    witness_flags: Option<ScriptFlags>,
) -> Result<usize, ChainError> {
    let mut cost = count_sig_ops(tx) * WITNESS_SCALE_FACTOR;
    if bip16 {
        cost += count_p2sh_sig_ops(tx, is_coinbase, view)? * WITNESS_SCALE_FACTOR;
    }
    if let Some(flags) = witness_flags {
        if !is_coinbase {
            for (index, input) in tx.vin.iter().enumerate() {
                let entry = view
                    .lookup_entry(&input.prevout)
                    .filter(|entry| !entry.is_spent())
                    .ok_or_else(|| missing_input(tx, index, input))?;
                cost += witness_sig_op_count(
                    &input.script_sig,
                    entry.pk_script(),
                    &input.witness,
                    flags,
                );
            }
        }
    }
    Ok(cost)
}

fn missing_input(
    tx: &Transaction,
    index: usize,
    input: &btcnode_primitives::transaction::TxIn,
) -> ChainError {
    rule_error(
        ErrorCode::MissingTxOut,
        format!(
            "unable to find unspent output {} referenced from transaction {}:{}",
            input.prevout,
            btcnode_consensus::hash256_to_hex(&tx.txid()),
            index
        ),
    )
}
