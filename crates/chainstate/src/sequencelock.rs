//! Relative lock times carried in input sequence numbers.

use btcnode_consensus::constants::{
    SEQUENCE_LOCK_TIME_DISABLED, SEQUENCE_LOCK_TIME_GRANULARITY, SEQUENCE_LOCK_TIME_IS_SECONDS,
    SEQUENCE_LOCK_TIME_MASK,
};
use btcnode_primitives::transaction::Transaction;

use crate::blocknode::{NodeAncestry, NodeRef};
use crate::error::{assert_error, rule_error, ChainError, ErrorCode};
use crate::utxoviewpoint::UtxoViewpoint;

/// Height marking an output that is not yet in a block.
pub const UNMINED_HEIGHT: i32 = 0x7fff_ffff;

/// The latest second and height at which the transaction is still locked; -1
/// leaves that dimension unconstrained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequenceLock {
    pub seconds: i64,
    pub block_height: i32,
}

impl SequenceLock {
    pub const NONE: SequenceLock = SequenceLock {
        seconds: -1,
        block_height: -1,
    };
}

impl Default for SequenceLock {
    fn default() -> Self {
        Self::NONE
    }
}

/// Lock for `tx` spent in the block after `node`. Only version 2+ transactions
/// are constrained, and only once `csv_active`.
pub fn calc_sequence_lock(
    node: &NodeRef,
    tx: &Transaction,
    view: &UtxoViewpoint,
    csv_active: bool,
) -> Result<SequenceLock, ChainError> {
    let mut lock = SequenceLock::NONE;
    if !csv_active || tx.version < 2 || tx.is_coinbase() {
        return Ok(lock);
    }

    let next_height = node.height + 1;
    for (index, input) in tx.vin.iter().enumerate() {
        let entry = view.lookup_entry(&input.prevout).ok_or_else(|| {
            rule_error(
                ErrorCode::MissingTxOut,
                format!(
                    "output {} referenced from transaction {}:{} either does not exist or has already been spent",
                    input.prevout,
                    btcnode_consensus::hash256_to_hex(&tx.txid()),
                    index
                ),
            )
        })?;

        let mut input_height = entry.block_height();
        if input_height == UNMINED_HEIGHT {
            input_height = next_height;
        }

        let sequence = input.sequence;
        if sequence & SEQUENCE_LOCK_TIME_DISABLED != 0 {
            continue;
        }
        let relative_lock = i64::from(sequence & SEQUENCE_LOCK_TIME_MASK);
        if sequence & SEQUENCE_LOCK_TIME_IS_SECONDS != 0 {
            let prev_input_height = (input_height - 1).max(0);
            let ancestor = node.ancestor(prev_input_height).ok_or_else(|| {
                assert_error(format!(
                    "no ancestor at height {prev_input_height} below {}",
                    node.height
                ))
            })?;
            let median_time = ancestor.calc_past_median_time();
            let lock_seconds = (relative_lock << SEQUENCE_LOCK_TIME_GRANULARITY) - 1;
            lock.seconds = lock.seconds.max(median_time + lock_seconds);
        } else {
            let lock_height = input_height + relative_lock as i32 - 1;
            lock.block_height = lock.block_height.max(lock_height);
        }
    }
    Ok(lock)
}

/// Whether a transaction with `lock` may be included at `block_height` given
/// the past median time of the block's parent.
pub fn sequence_lock_active(lock: &SequenceLock, block_height: i32, median_time_past: i64) -> bool {
    lock.seconds < median_time_past && lock.block_height < block_height
}
