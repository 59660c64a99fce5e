//! Parallel script verification for the inputs of a block.

use btcnode_consensus::hash256_to_hex;
use btcnode_log::log_warn;
use btcnode_primitives::block::Block;
use btcnode_primitives::transaction::Transaction;
use btcnode_script::interpreter::{verify_script, ScriptError, ScriptFlags, TransactionSignatureChecker};
use btcnode_script::sighash::SighashCache;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::error::{rule_error, ChainError, ErrorCode};
use crate::utxoviewpoint::UtxoViewpoint;

struct InputCheck<'a> {
    tx: &'a Transaction,
    cache: &'a SighashCache,
    input_index: usize,
    amount: i64,
    pk_script: &'a [u8],
}

fn script_error_code(err: ScriptError) -> ErrorCode {
    match err {
        ScriptError::ScriptSize
        | ScriptError::PushSize
        | ScriptError::BadOpcode
        | ScriptError::DisabledOpcode => ErrorCode::ScriptMalformed,
        _ => ErrorCode::ScriptValidation,
    }
}

impl InputCheck<'_> {
    fn run(&self, flags: ScriptFlags) -> Result<(), ChainError> {
        let input = &self.tx.vin[self.input_index];
        let checker = TransactionSignatureChecker::new(self.tx, self.input_index, self.amount)
            .with_cache(self.cache);
        verify_script(
            &input.script_sig,
            self.pk_script,
            &input.witness,
            flags,
            &checker,
        )
        .map_err(|err| {
            let txid = hash256_to_hex(&self.tx.txid());
            log_warn!(
                "Script validation failed for transaction {} input {}: {}",
                txid,
                self.input_index,
                err
            );
            rule_error(
                script_error_code(err),
                format!(
                    "failed to validate input {}:{} which references output {}: {err}",
                    txid, self.input_index, input.prevout
                ),
            )
        })
    }
}

/// Runs every input script of the given transactions against `view`. All
/// inputs share one view and one sighash midstate per transaction; the first
/// failure stops the remaining work.
pub fn check_transaction_scripts(
    transactions: &[Transaction],
    view: &UtxoViewpoint,
    flags: ScriptFlags,
    pool: &ThreadPool,
) -> Result<(), ChainError> {
    let caches: Vec<SighashCache> = transactions.iter().map(SighashCache::new).collect();

    let mut checks = Vec::new();
    for (tx, cache) in transactions.iter().zip(&caches) {
        if tx.is_coinbase() {
            continue;
        }
        for (input_index, input) in tx.vin.iter().enumerate() {
            let entry = view.lookup_entry(&input.prevout).ok_or_else(|| {
                rule_error(
                    ErrorCode::MissingTxOut,
                    format!(
                        "unable to find unspent output {} referenced from transaction {}:{}",
                        input.prevout,
                        hash256_to_hex(&tx.txid()),
                        input_index
                    ),
                )
            })?;
            checks.push(InputCheck {
                tx,
                cache,
                input_index,
                amount: entry.amount(),
                pk_script: entry.pk_script(),
            });
        }
    }

    pool.install(|| checks.par_iter().try_for_each(|check| check.run(flags)))
}

pub fn check_block_scripts(
    block: &Block,
    view: &UtxoViewpoint,
    flags: ScriptFlags,
    pool: &ThreadPool,
) -> Result<(), ChainError> {
    check_transaction_scripts(&block.transactions, view, flags, pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcnode_primitives::outpoint::OutPoint;
    use btcnode_primitives::transaction::{TxIn, TxOut};
    use btcnode_script::interpreter::SCRIPT_VERIFY_P2SH;

    const OP_TRUE: u8 = 0x51;
    const OP_EQUAL: u8 = 0x87;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .expect("pool")
    }

    fn funding(scripts: &[Vec<u8>]) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), Vec::new(), u32::MAX)],
            vout: scripts
                .iter()
                .map(|script| TxOut {
                    value: 1_000,
                    script_pubkey: script.clone(),
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn spend(prev: &Transaction, sigs: &[Vec<u8>]) -> Transaction {
        Transaction {
            version: 1,
            vin: sigs
                .iter()
                .enumerate()
                .map(|(index, sig)| TxIn::new(OutPoint::new(prev.txid(), index as u32), sig.clone(), u32::MAX))
                .collect(),
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![OP_TRUE],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn all_inputs_must_pass() {
        // `<3> OP_EQUAL` is satisfied by pushing 3.
        let puzzle = vec![0x53, OP_EQUAL];
        let prev = funding(&[vec![OP_TRUE], puzzle.clone(), puzzle]);
        let mut view = UtxoViewpoint::new();
        view.add_tx_outs(&prev, 1);
        let pool = pool();

        let good = spend(&prev, &[Vec::new(), vec![0x53], vec![0x53]]);
        check_transaction_scripts(&[good], &view, SCRIPT_VERIFY_P2SH, &pool).expect("valid");

        let bad = spend(&prev, &[Vec::new(), vec![0x53], vec![0x54]]);
        let err = check_transaction_scripts(&[bad], &view, SCRIPT_VERIFY_P2SH, &pool)
            .expect_err("invalid");
        assert_eq!(err.rule_code(), Some(ErrorCode::ScriptValidation));
        assert!(err.to_string().contains(":2"));
    }

    #[test]
    fn missing_prevout_is_reported_before_running_scripts() {
        let prev = funding(&[vec![OP_TRUE]]);
        let tx = spend(&prev, &[Vec::new()]);
        let err = check_transaction_scripts(&[tx], &UtxoViewpoint::new(), 0, &pool())
            .expect_err("missing");
        assert_eq!(err.rule_code(), Some(ErrorCode::MissingTxOut));
    }

    #[test]
    fn oversized_scripts_are_malformed() {
        assert_eq!(script_error_code(ScriptError::ScriptSize), ErrorCode::ScriptMalformed);
        assert_eq!(script_error_code(ScriptError::EvalFalse), ErrorCode::ScriptValidation);
    }
}
