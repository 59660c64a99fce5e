//! Block and transaction validation: context-free sanity checks, checks
//! against the parent block, and the UTXO-consuming connect checks.

use std::collections::HashSet;

use btcnode_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_BASE_SIZE, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT,
    MAX_COINBASE_SCRIPT_LEN, MAX_TIME_OFFSET_SECONDS, MIN_COINBASE_SCRIPT_LEN, SEQUENCE_FINAL,
    WITNESS_SCALE_FACTOR,
};
use btcnode_consensus::{
    block_subsidy, hash256_from_hex, hash256_to_hex, ConsensusParams, DeploymentId, Hash256,
    MAX_MONEY,
};
use btcnode_pow::{check_proof_of_work as check_header_pow, PowError};
use btcnode_primitives::block::{Block, BlockHeader};
use btcnode_primitives::outpoint::OutPoint;
use btcnode_primitives::transaction::Transaction;
use btcnode_script::interpreter::{
    ScriptFlags, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY,
    SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_NULLDUMMY, SCRIPT_VERIFY_P2SH,
    SCRIPT_VERIFY_WITNESS,
};
use btcnode_storage::KeyValueStore;

use crate::blocknode::{BlockNode, NodeRef};
use crate::chain::{BlockChain, ChainLockState};
use crate::checkpoints::{latest_checkpoint, verify_checkpoint};
use crate::difficulty::calc_next_required_difficulty;
use crate::error::{assert_error, rule_error, ChainError, ErrorCode};
use crate::mediantime::TimeSource;
use crate::merkle::{calc_merkle_root, extract_witness_commitment, hash_merkle_branches};
use crate::scriptval::check_block_scripts;
use crate::sequencelock::{calc_sequence_lock, sequence_lock_active};
use crate::spendjournal::SpentTxOut;
use crate::thresholdstate::ThresholdState;
use crate::utxoviewpoint::UtxoViewpoint;
use crate::versionbits::deployment_state;
use crate::weight::{block_weight, count_sig_ops, sig_op_cost};

/// Options that relax parts of block processing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct BehaviorFlags(u32);

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags(0);
    /// The block is known to be valid (for example it is below a checkpoint),
    /// so the expensive contextual checks are skipped.
    pub const FAST_ADD: BehaviorFlags = BehaviorFlags(1 << 0);
    /// Skip the header hash check against the target. Used for templates.
    pub const NO_POW_CHECK: BehaviorFlags = BehaviorFlags(1 << 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: BehaviorFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BehaviorFlags {
    type Output = BehaviorFlags;

    fn bitor(self, rhs: BehaviorFlags) -> BehaviorFlags {
        BehaviorFlags(self.0 | rhs.0)
    }
}

/// Blocks that duplicate earlier coinbase transactions and are grandfathered
/// past the overwrite check.
const BIP0030_EXCEPTIONS: [(i32, &str); 2] = [
    (
        91_842,
        "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
    ),
    (
        91_880,
        "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
    ),
];

pub fn is_bip0030_node(node: &BlockNode) -> bool {
    BIP0030_EXCEPTIONS.iter().any(|(height, hash)| {
        node.height == *height
            && hash256_from_hex(hash).is_ok_and(|expected| expected == node.hash)
    })
}

/// Whether `tx` may be included in a block at `block_height` whose lock-time
/// reference is `block_time`.
pub fn is_finalized_transaction(tx: &Transaction, block_height: i32, block_time: i64) -> bool {
    let lock_time = tx.lock_time;
    if lock_time == 0 {
        return true;
    }
    let threshold = if lock_time < LOCKTIME_THRESHOLD {
        i64::from(block_height)
    } else {
        block_time
    };
    if i64::from(lock_time) < threshold {
        return true;
    }
    // A lock time in the future is still fine when every input opted out of it.
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

pub fn check_transaction_sanity(tx: &Transaction) -> Result<(), ChainError> {
    if tx.vin.is_empty() {
        return Err(rule_error(
            ErrorCode::NoTxInputs,
            "transaction has no inputs",
        ));
    }
    if tx.vout.is_empty() {
        return Err(rule_error(
            ErrorCode::NoTxOutputs,
            "transaction has no outputs",
        ));
    }

    let size = tx.stripped_size();
    if size > MAX_BLOCK_BASE_SIZE {
        return Err(rule_error(
            ErrorCode::TxTooBig,
            format!("serialized transaction is too big - got {size}, max {MAX_BLOCK_BASE_SIZE}"),
        ));
    }

    let mut total: i64 = 0;
    for output in &tx.vout {
        let value = output.value;
        if value < 0 {
            return Err(rule_error(
                ErrorCode::BadTxOutValue,
                format!("transaction output has negative value of {value}"),
            ));
        }
        if value > MAX_MONEY {
            return Err(rule_error(
                ErrorCode::BadTxOutValue,
                format!(
                    "transaction output value of {value} is higher than max allowed value of {MAX_MONEY}"
                ),
            ));
        }
        total = match total.checked_add(value) {
            Some(total) if total <= MAX_MONEY => total,
            _ => {
                return Err(rule_error(
                    ErrorCode::BadTxOutValue,
                    format!(
                        "total value of all transaction outputs exceeds max allowed value of {MAX_MONEY}"
                    ),
                ))
            }
        };
    }

    let mut seen: HashSet<OutPoint> = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(rule_error(
                ErrorCode::DuplicateTxInputs,
                "transaction contains duplicate inputs",
            ));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(rule_error(
                ErrorCode::BadCoinbaseScriptLen,
                format!(
                    "coinbase transaction script length of {len} is out of range (min: {MIN_COINBASE_SCRIPT_LEN}, max: {MAX_COINBASE_SCRIPT_LEN})"
                ),
            ));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(rule_error(
            ErrorCode::BadTxInput,
            "transaction input refers to previous output that is null",
        ));
    }
    Ok(())
}

/// Target range always; the hash itself unless `NO_POW_CHECK` is set.
pub fn check_proof_of_work(
    header: &BlockHeader,
    pow_limit: &Hash256,
    flags: BehaviorFlags,
) -> Result<(), ChainError> {
    let check_hash = !flags.contains(BehaviorFlags::NO_POW_CHECK);
    check_header_pow(header, pow_limit, check_hash).map_err(|err| {
        let code = match err {
            PowError::HighHash => ErrorCode::HighHash,
            _ => ErrorCode::UnexpectedDifficulty,
        };
        let message = match err {
            PowError::HighHash => format!(
                "block hash of {} is higher than expected max",
                hash256_to_hex(&header.hash())
            ),
            other => other.to_string(),
        };
        rule_error(code, message)
    })
}

pub fn check_block_header_sanity(
    header: &BlockHeader,
    pow_limit: &Hash256,
    time_source: &dyn TimeSource,
    flags: BehaviorFlags,
) -> Result<(), ChainError> {
    check_proof_of_work(header, pow_limit, flags)?;

    let max_timestamp = time_source.adjusted_time() + MAX_TIME_OFFSET_SECONDS;
    if i64::from(header.time) > max_timestamp {
        return Err(rule_error(
            ErrorCode::TimeTooNew,
            format!(
                "block timestamp of {} is too far in the future (max {max_timestamp})",
                header.time
            ),
        ));
    }
    Ok(())
}

pub fn check_block_sanity(
    block: &Block,
    pow_limit: &Hash256,
    time_source: &dyn TimeSource,
    flags: BehaviorFlags,
) -> Result<(), ChainError> {
    check_block_header_sanity(&block.header, pow_limit, time_source, flags)?;

    let num_txns = block.transactions.len();
    if num_txns == 0 {
        return Err(rule_error(
            ErrorCode::NoTransactions,
            "block does not contain any transactions",
        ));
    }
    if num_txns > MAX_BLOCK_BASE_SIZE {
        return Err(rule_error(
            ErrorCode::BlockTooBig,
            format!("block contains too many transactions - got {num_txns}, max {MAX_BLOCK_BASE_SIZE}"),
        ));
    }
    let size = block.stripped_size();
    if size > MAX_BLOCK_BASE_SIZE {
        return Err(rule_error(
            ErrorCode::BlockTooBig,
            format!("serialized block is too big - got {size}, max {MAX_BLOCK_BASE_SIZE}"),
        ));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(rule_error(
            ErrorCode::FirstTxNotCoinbase,
            "first transaction in block is not a coinbase",
        ));
    }
    if let Some(index) = block.transactions[1..]
        .iter()
        .position(Transaction::is_coinbase)
    {
        return Err(rule_error(
            ErrorCode::MultipleCoinbases,
            format!("block contains second coinbase at index {}", index + 1),
        ));
    }

    for tx in &block.transactions {
        check_transaction_sanity(tx)?;
    }

    let calculated = calc_merkle_root(&block.transactions, false);
    if calculated != block.header.merkle_root {
        return Err(rule_error(
            ErrorCode::BadMerkleRoot,
            format!(
                "block merkle root is invalid - block header indicates {}, but calculated value is {}",
                hash256_to_hex(&block.header.merkle_root),
                hash256_to_hex(&calculated)
            ),
        ));
    }

    // The merkle tree cannot tell duplicated trailing transactions apart, so check explicitly.
    let mut seen: HashSet<Hash256> = HashSet::with_capacity(num_txns);
    for txid in block.txids() {
        if !seen.insert(txid) {
            return Err(rule_error(
                ErrorCode::DuplicateTx,
                format!("block contains duplicate transaction {}", hash256_to_hex(&txid)),
            ));
        }
    }

    let mut total_sig_ops = 0usize;
    for tx in &block.transactions {
        total_sig_ops = total_sig_ops.saturating_add(count_sig_ops(tx) * WITNESS_SCALE_FACTOR);
        if total_sig_ops > MAX_BLOCK_SIGOPS_COST {
            return Err(rule_error(
                ErrorCode::TooManySigOps,
                format!(
                    "block contains too many signature operations - got {total_sig_ops}, max {MAX_BLOCK_SIGOPS_COST}"
                ),
            ));
        }
    }
    Ok(())
}

/// Height serialized at the start of the coinbase signature script.
pub fn extract_coinbase_height(coinbase: &Transaction) -> Result<i32, ChainError> {
    let script = coinbase
        .vin
        .first()
        .map(|input| input.script_sig.as_slice())
        .unwrap_or_default();
    let Some(&opcode) = script.first() else {
        return Err(rule_error(
            ErrorCode::MissingCoinbaseHeight,
            "the coinbase signature script must start with the length of the serialized block height",
        ));
    };

    // OP_0 and OP_1 through OP_16 encode small heights directly.
    if opcode == 0x00 {
        return Ok(0);
    }
    if (0x51..=0x60).contains(&opcode) {
        return Ok(i32::from(opcode - 0x50));
    }

    let len = usize::from(opcode);
    let Some(serialized) = script.get(1..1 + len) else {
        return Err(rule_error(
            ErrorCode::MissingCoinbaseHeight,
            "the coinbase signature script must start with the serialized block height",
        ));
    };
    let mut bytes = [0u8; 8];
    let used = serialized.len().min(bytes.len());
    bytes[..used].copy_from_slice(&serialized[..used]);
    Ok(u64::from_le_bytes(bytes) as i32)
}

pub fn check_serialized_height(coinbase: &Transaction, want_height: i32) -> Result<(), ChainError> {
    let height = extract_coinbase_height(coinbase)?;
    if height != want_height {
        return Err(rule_error(
            ErrorCode::BadCoinbaseHeight,
            format!(
                "the coinbase signature script serialized block height is {height} when {want_height} was expected"
            ),
        ));
    }
    Ok(())
}

/// Checks the coinbase commitment to the witness merkle root, or that no
/// transaction carries witness data when there is no commitment.
pub fn validate_witness_commitment(block: &Block) -> Result<(), ChainError> {
    let Some(coinbase) = block.transactions.first() else {
        return Err(assert_error(
            "cannot validate witness commitment of block without transactions",
        ));
    };
    let Some(input) = coinbase.vin.first() else {
        return Err(rule_error(
            ErrorCode::NoTxInputs,
            "transaction has no inputs",
        ));
    };

    let Some(commitment) = extract_witness_commitment(coinbase) else {
        if block.transactions.iter().any(Transaction::has_witness) {
            return Err(rule_error(
                ErrorCode::UnexpectedWitness,
                "block contains transaction with witness data, yet no witness commitment present",
            ));
        }
        return Ok(());
    };

    let witness = &input.witness;
    if witness.len() != 1 {
        return Err(rule_error(
            ErrorCode::InvalidWitnessCommitment,
            format!(
                "the coinbase transaction has {} items in its witness stack when only one is allowed",
                witness.len()
            ),
        ));
    }
    let nonce: Hash256 = witness[0].as_slice().try_into().map_err(|_| {
        rule_error(
            ErrorCode::InvalidWitnessCommitment,
            format!(
                "the coinbase transaction witness nonce has {} bytes when it must be 32 bytes",
                witness[0].len()
            ),
        )
    })?;

    let witness_root = calc_merkle_root(&block.transactions, true);
    let computed = hash_merkle_branches(&witness_root, &nonce);
    if computed != commitment {
        return Err(rule_error(
            ErrorCode::WitnessCommitmentMismatch,
            format!(
                "witness commitment does not match: computed {}, coinbase includes {}",
                hash256_to_hex(&computed),
                hash256_to_hex(&commitment)
            ),
        ));
    }
    Ok(())
}

/// Checks the inputs of `tx` against `view` and returns its fee.
pub fn check_transaction_inputs(
    tx: &Transaction,
    tx_height: i32,
    view: &UtxoViewpoint,
    params: &ConsensusParams,
) -> Result<i64, ChainError> {
    if tx.is_coinbase() {
        return Ok(0);
    }

    let txid = tx.txid();
    let mut total_in: i64 = 0;
    for (index, input) in tx.vin.iter().enumerate() {
        let entry = view
            .lookup_entry(&input.prevout)
            .filter(|entry| !entry.is_spent())
            .ok_or_else(|| {
                rule_error(
                    ErrorCode::MissingTxOut,
                    format!(
                        "output {} referenced from transaction {}:{} either does not exist or has already been spent",
                        input.prevout,
                        hash256_to_hex(&txid),
                        index
                    ),
                )
            })?;

        if entry.is_coinbase() {
            let origin_height = entry.block_height();
            let blocks_since = tx_height - origin_height;
            if blocks_since < params.coinbase_maturity {
                return Err(rule_error(
                    ErrorCode::ImmatureSpend,
                    format!(
                        "tried to spend coinbase transaction output {} from height {origin_height} at height {tx_height} before required maturity of {} blocks",
                        input.prevout, params.coinbase_maturity
                    ),
                ));
            }
        }

        let amount = entry.amount();
        if !(0..=MAX_MONEY).contains(&amount) {
            return Err(rule_error(
                ErrorCode::BadTxOutValue,
                format!("transaction output value of {amount} is out of range"),
            ));
        }
        total_in = match total_in.checked_add(amount) {
            Some(total) if total <= MAX_MONEY => total,
            _ => {
                return Err(rule_error(
                    ErrorCode::BadTxOutValue,
                    format!(
                        "total value of all transaction inputs is higher than max allowed value of {MAX_MONEY}"
                    ),
                ))
            }
        };
    }

    // Output ranges were already checked by the sanity checks.
    let total_out: i64 = tx.vout.iter().map(|output| output.value).sum();
    if total_in < total_out {
        return Err(rule_error(
            ErrorCode::SpendTooHigh,
            format!(
                "total value of all transaction inputs for transaction {} is {total_in} which is less than the amount spent of {total_out}",
                hash256_to_hex(&txid)
            ),
        ));
    }
    Ok(total_in - total_out)
}

impl<S: KeyValueStore> BlockChain<S> {
    pub(crate) fn check_block_header_context(
        &self,
        state: &mut ChainLockState,
        header: &BlockHeader,
        prev: Option<&NodeRef>,
        flags: BehaviorFlags,
    ) -> Result<(), ChainError> {
        let Some(prev) = prev else {
            return Ok(());
        };
        let fast_add = flags.contains(BehaviorFlags::FAST_ADD);

        if !fast_add {
            let expected =
                calc_next_required_difficulty(Some(prev), i64::from(header.time), &self.params)?;
            if header.bits != expected {
                return Err(rule_error(
                    ErrorCode::UnexpectedDifficulty,
                    format!(
                        "block difficulty of {:08x} is not the expected value of {expected:08x}",
                        header.bits
                    ),
                ));
            }

            let median_time = prev.calc_past_median_time();
            if i64::from(header.time) <= median_time {
                return Err(rule_error(
                    ErrorCode::TimeTooOld,
                    format!(
                        "block timestamp of {} is not after expected {median_time}",
                        header.time
                    ),
                ));
            }
        }

        let height = prev.height + 1;
        let hash = header.hash();
        if !verify_checkpoint(&self.checkpoints, height, &hash) {
            return Err(rule_error(
                ErrorCode::BadCheckpoint,
                format!("block at height {height} does not match checkpoint hash"),
            ));
        }

        if let Some(checkpoint) = self.find_previous_checkpoint(state)? {
            if height < checkpoint.height {
                return Err(rule_error(
                    ErrorCode::ForkTooOld,
                    format!(
                        "block at height {height} forks the main chain before the previous checkpoint at height {}",
                        checkpoint.height
                    ),
                ));
            }
        }

        if !fast_add {
            let params = &self.params;
            let too_old = (header.version < 2 && height >= params.bip0034_height)
                || (header.version < 3 && height >= params.bip0066_height)
                || (header.version < 4 && height >= params.bip0065_height);
            if too_old {
                return Err(rule_error(
                    ErrorCode::BlockVersionTooOld,
                    format!("new blocks with version {} are no longer valid", header.version),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn check_block_context(
        &self,
        state: &mut ChainLockState,
        block: &Block,
        prev: &NodeRef,
        flags: BehaviorFlags,
    ) -> Result<(), ChainError> {
        let header = &block.header;
        self.check_block_header_context(state, header, Some(prev), flags)?;
        if flags.contains(BehaviorFlags::FAST_ADD) {
            return Ok(());
        }

        // With CSV active, lock times are measured against the median time past.
        let csv = deployment_state(
            Some(prev),
            &self.params,
            DeploymentId::Csv,
            &mut state.deployment_caches,
        )?;
        let block_time = if csv == ThresholdState::Active {
            prev.calc_past_median_time()
        } else {
            i64::from(header.time)
        };

        let height = prev.height + 1;
        for tx in &block.transactions {
            if !is_finalized_transaction(tx, height, block_time) {
                return Err(rule_error(
                    ErrorCode::UnfinalizedTx,
                    format!(
                        "block contains unfinalized transaction {}",
                        hash256_to_hex(&tx.txid())
                    ),
                ));
            }
        }

        if header.version >= 2 && height >= self.params.bip0034_height {
            check_serialized_height(&block.transactions[0], height)?;
        }

        let segwit = deployment_state(
            Some(prev),
            &self.params,
            DeploymentId::Segwit,
            &mut state.deployment_caches,
        )?;
        if segwit == ThresholdState::Active {
            validate_witness_commitment(block)?;
            let weight = block_weight(block);
            if weight > MAX_BLOCK_WEIGHT {
                return Err(rule_error(
                    ErrorCode::BlockWeightTooHigh,
                    format!("block's weight metric is too high - got {weight}, max {MAX_BLOCK_WEIGHT}"),
                ));
            }
        }
        Ok(())
    }

    /// Outputs of `block` that would replace still-unspent outputs of an
    /// earlier transaction with the same id.
    fn check_bip0030(
        &self,
        node: &NodeRef,
        block: &Block,
        view: &mut UtxoViewpoint,
    ) -> Result<(), ChainError> {
        let mut outpoints = HashSet::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            for index in 0..tx.vout.len() {
                outpoints.insert(OutPoint::new(txid, index as u32));
            }
        }
        view.fetch_utxos(self.store.as_ref(), &outpoints)?;

        for outpoint in &outpoints {
            if view
                .lookup_entry(outpoint)
                .is_some_and(|entry| !entry.is_spent())
            {
                return Err(rule_error(
                    ErrorCode::OverwriteTx,
                    format!(
                        "tried to overwrite transaction {} at block height {} that is not fully spent",
                        hash256_to_hex(&outpoint.hash),
                        node.height
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Runs every check that needs the outputs `block` spends, connecting its
    /// transactions to `view` along the way. Scripts run last.
    pub(crate) fn check_connect_block(
        &self,
        state: &mut ChainLockState,
        node: &NodeRef,
        block: &Block,
        view: &mut UtxoViewpoint,
        mut stxos: Option<&mut Vec<SpentTxOut>>,
    ) -> Result<(), ChainError> {
        if node.hash == self.params.hash_genesis_block {
            return Err(rule_error(
                ErrorCode::MissingTxOut,
                "the coinbase for the genesis block is not spendable",
            ));
        }
        let Some(parent) = node.parent.as_ref() else {
            return Err(assert_error(format!(
                "block {} has no parent",
                hash256_to_hex(&node.hash)
            )));
        };
        if view.best_hash() != parent.hash {
            return Err(assert_error(format!(
                "inconsistent view when checking block connection: best hash is {} instead of expected {}",
                hash256_to_hex(&view.best_hash()),
                hash256_to_hex(&parent.hash)
            )));
        }

        // BIP34 makes duplicate coinbases impossible, so the overwrite check
        // only matters below its activation.
        if !is_bip0030_node(node) && node.height < self.params.bip0034_height {
            self.check_bip0030(node, block, view)?;
        }

        view.fetch_input_utxos(self.store.as_ref(), block, node.height)?;

        let enforce_bip0016 = node.timestamp >= self.params.bip0016_time;
        let segwit = deployment_state(
            Some(parent),
            &self.params,
            DeploymentId::Segwit,
            &mut state.deployment_caches,
        )?;
        let enforce_segwit = segwit == ThresholdState::Active;
        let witness_flags = enforce_segwit.then_some(SCRIPT_VERIFY_WITNESS | SCRIPT_VERIFY_P2SH);

        let mut total_sig_op_cost = 0usize;
        for (index, tx) in block.transactions.iter().enumerate() {
            let cost = sig_op_cost(tx, index == 0, view, enforce_bip0016, witness_flags)?;
            total_sig_op_cost = total_sig_op_cost.saturating_add(cost);
            if total_sig_op_cost > MAX_BLOCK_SIGOPS_COST {
                return Err(rule_error(
                    ErrorCode::TooManySigOps,
                    format!(
                        "block contains too many signature operations - got {total_sig_op_cost}, max {MAX_BLOCK_SIGOPS_COST}"
                    ),
                ));
            }
        }

        let mut total_fees: i64 = 0;
        for tx in &block.transactions {
            let fee = check_transaction_inputs(tx, node.height, view, &self.params)?;
            total_fees = total_fees.checked_add(fee).ok_or_else(|| {
                rule_error(
                    ErrorCode::BadFees,
                    "total fees for block overflows accumulator",
                )
            })?;
            view.connect_transaction(tx, node.height, stxos.as_mut().map(|stxos| &mut **stxos))?;
        }

        let coinbase_out: i64 = block.transactions[0]
            .vout
            .iter()
            .map(|output| output.value)
            .sum();
        let expected = block_subsidy(node.height, self.params.subsidy_reduction_interval) + total_fees;
        if coinbase_out > expected {
            return Err(rule_error(
                ErrorCode::BadCoinbaseValue,
                format!(
                    "coinbase transaction for block pays {coinbase_out} which is more than expected value of {expected}"
                ),
            ));
        }

        // History up to the newest checkpoint is vouched for by its hash.
        let run_scripts = latest_checkpoint(&self.checkpoints)
            .map_or(true, |checkpoint| node.height > checkpoint.height);

        let mut script_flags: ScriptFlags = SCRIPT_VERIFY_NONE;
        if enforce_bip0016 {
            script_flags |= SCRIPT_VERIFY_P2SH;
        }
        if block.header.version >= 3 && node.height >= self.params.bip0066_height {
            script_flags |= SCRIPT_VERIFY_DERSIG;
        }
        if block.header.version >= 4 && node.height >= self.params.bip0065_height {
            script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }

        let csv = deployment_state(
            Some(parent),
            &self.params,
            DeploymentId::Csv,
            &mut state.deployment_caches,
        )?;
        if csv == ThresholdState::Active {
            script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
            let median_time = parent.calc_past_median_time();
            for tx in &block.transactions {
                let lock = calc_sequence_lock(node, tx, view, true)?;
                if !sequence_lock_active(&lock, node.height, median_time) {
                    return Err(rule_error(
                        ErrorCode::UnfinalizedTx,
                        format!(
                            "block contains transaction {} whose input sequence locks are not met",
                            hash256_to_hex(&tx.txid())
                        ),
                    ));
                }
            }
        }

        if enforce_segwit {
            script_flags |= SCRIPT_VERIFY_WITNESS | SCRIPT_VERIFY_NULLDUMMY;
        }

        if run_scripts {
            check_block_scripts(block, view, script_flags, &self.script_pool)?;
        }

        view.set_best_hash(node.hash);
        Ok(())
    }

    /// Fully validates `block` as the next block on the current tip without
    /// changing any chain state. Proof of work is not checked.
    pub fn check_connect_block_template(&self, block: &Block) -> Result<(), ChainError> {
        let mut state = self.lock_chain();
        let flags = BehaviorFlags::NO_POW_CHECK;

        let tip = self.tip()?;
        if block.header.prev_block != tip.hash {
            return Err(rule_error(
                ErrorCode::PrevBlockNotBest,
                format!(
                    "previous block must be the current chain tip {}, instead got {}",
                    hash256_to_hex(&tip.hash),
                    hash256_to_hex(&block.header.prev_block)
                ),
            ));
        }

        check_block_sanity(block, &self.params.pow_limit, self.time_source.as_ref(), flags)?;
        self.check_block_context(&mut state, block, &tip, flags)?;

        let mut view = UtxoViewpoint::new();
        view.set_best_hash(tip.hash);
        let node = std::sync::Arc::new(BlockNode::new(&block.header, Some(&tip)));
        self.check_connect_block(&mut state, &node, block, &mut view, None)
    }
}
