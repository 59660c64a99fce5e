//! Block processing: orphan handling, acceptance into the index and
//! selection of the best chain, including reorganizations.

use std::collections::VecDeque;
use std::sync::Arc;

use btcnode_consensus::{hash256_to_hex, Hash256};
use btcnode_log::{log_debug, log_info, log_trace, log_warn};
use btcnode_pow::{compact_to_u256, easiest_difficulty};
use btcnode_primitives::block::Block;
use btcnode_storage::KeyValueStore;

use crate::blocknode::{BlockNode, BlockStatus, NodeRef};
use crate::chain::{BlockChain, ChainLockState};
use crate::chainio::{fetch_block, fetch_spend_journal, store_block};
use crate::error::{assert_error, corruption, rule_error, ChainError, ErrorCode};
use crate::notifications::Notification;
use crate::spendjournal::{count_spent_outputs, SpentTxOut};
use crate::utxoviewpoint::UtxoViewpoint;
use crate::validate::{check_block_sanity, BehaviorFlags};

impl<S: KeyValueStore> BlockChain<S> {
    /// Main entry point for new blocks. Returns whether the block ended up on
    /// the main chain and whether it was held back as an orphan.
    ///
    /// Notifications raised while processing are delivered after the chain
    /// lock is released, so callbacks may query the chain.
    pub fn process_block(
        &self,
        block: impl Into<Arc<Block>>,
        flags: BehaviorFlags,
    ) -> Result<(bool, bool), ChainError> {
        let block = block.into();
        let (result, pending) = {
            let mut state = self.lock_chain();
            let result = self.process_block_locked(&mut state, block, flags);
            (result, std::mem::take(&mut state.pending))
        };
        self.dispatch(pending);
        result
    }

    fn process_block_locked(
        &self,
        state: &mut ChainLockState,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<(bool, bool), ChainError> {
        let fast_add = flags.contains(BehaviorFlags::FAST_ADD);
        let hash = block.hash();
        log_trace!("Processing block {}", hash256_to_hex(&hash));

        if self.index.have_block(&hash) {
            return Err(rule_error(
                ErrorCode::DuplicateBlock,
                format!("already have block {}", hash256_to_hex(&hash)),
            ));
        }
        if self.is_known_orphan(&hash) {
            return Err(rule_error(
                ErrorCode::DuplicateBlock,
                format!("already have block (orphan) {}", hash256_to_hex(&hash)),
            ));
        }

        check_block_sanity(&block, &self.params.pow_limit, self.time_source.as_ref(), flags)?;

        // Blocks that branch off before the last checkpoint can be rejected
        // cheaply by timestamp and by how little work they could carry.
        if let Some(checkpoint) = self.find_previous_checkpoint(state)? {
            let checkpoint_time = i64::from(checkpoint.timestamp);
            let block_time = i64::from(block.header.time);
            if block_time < checkpoint_time {
                return Err(rule_error(
                    ErrorCode::CheckpointTimeTooOld,
                    format!(
                        "block {} has timestamp {block_time} before last checkpoint timestamp {checkpoint_time}",
                        hash256_to_hex(&hash)
                    ),
                ));
            }
            if !fast_add {
                self.check_difficulty_since(&checkpoint, &block)?;
            }
        }

        let prev_hash = block.header.prev_block;
        if !self.index.have_block(&prev_hash) {
            log_info!(
                "Adding orphan block {} with parent {}",
                hash256_to_hex(&hash),
                hash256_to_hex(&prev_hash)
            );
            self.lock_orphans()
                .add(block, self.time_source.adjusted_time());
            return Ok((false, true));
        }

        let is_main_chain = self.maybe_accept_block(state, block, flags)?;
        self.process_orphans(state, &hash, flags)?;

        log_debug!("Accepted block {}", hash256_to_hex(&hash));
        Ok((is_main_chain, false))
    }

    /// A block after `checkpoint` cannot be easier than the easiest target
    /// the retarget rules allow for the elapsed time.
    fn check_difficulty_since(&self, checkpoint: &NodeRef, block: &Block) -> Result<(), ChainError> {
        let duration = i64::from(block.header.time) - i64::from(checkpoint.timestamp);
        let required_bits = easiest_difficulty(checkpoint.bits, duration, &self.params)
            .map_err(|err| assert_error(format!("checkpoint bits {:08x}: {err}", checkpoint.bits)))?;
        let required = compact_to_u256(required_bits)
            .map_err(|err| assert_error(format!("easiest bits {required_bits:08x}: {err}")))?;
        let target = compact_to_u256(block.header.bits).map_err(|err| {
            rule_error(
                ErrorCode::UnexpectedDifficulty,
                format!("block bits {:08x}: {err}", block.header.bits),
            )
        })?;
        if target > required {
            return Err(rule_error(
                ErrorCode::DifficultyTooLow,
                format!(
                    "block target difficulty of {target:x} is too low when compared to the previous checkpoint"
                ),
            ));
        }
        Ok(())
    }

    /// Accepts every orphan that descends from `hash`, breadth first.
    fn process_orphans(
        &self,
        state: &mut ChainLockState,
        hash: &Hash256,
        flags: BehaviorFlags,
    ) -> Result<(), ChainError> {
        let mut queue = VecDeque::from([*hash]);
        while let Some(parent) = queue.pop_front() {
            let children = self.lock_orphans().children_of(&parent);
            for orphan_hash in children {
                // Taken one at a time so a failing sibling leaves the rest pooled.
                let Some(orphan) = self.lock_orphans().remove(&orphan_hash) else {
                    continue;
                };
                match self.maybe_accept_block(state, orphan, flags) {
                    Ok(_) => queue.push_back(orphan_hash),
                    Err(err) if err.is_rule_error() => {
                        log_warn!(
                            "Rejected orphan block {}: {}",
                            hash256_to_hex(&orphan_hash),
                            err
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Runs the contextual checks, stores the block, indexes it and lets it
    /// compete for the best chain.
    pub(crate) fn maybe_accept_block(
        &self,
        state: &mut ChainLockState,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let prev_hash = block.header.prev_block;
        let prev = self.index.lookup_node(&prev_hash).ok_or_else(|| {
            rule_error(
                ErrorCode::PreviousBlockUnknown,
                format!("previous block {} is unknown", hash256_to_hex(&prev_hash)),
            )
        })?;
        if self.index.node_status(&prev).known_invalid() {
            return Err(rule_error(
                ErrorCode::InvalidAncestorBlock,
                format!("previous block {} is known to be invalid", hash256_to_hex(&prev_hash)),
            ));
        }

        self.check_block_context(state, &block, &prev, flags)?;

        // Side-chain blocks need their data for a later reorganize.
        store_block(self.store.as_ref(), &block)?;

        let node = Arc::new(
            BlockNode::new(&block.header, Some(&prev)).with_status(BlockStatus::DATA_STORED),
        );
        self.index.add_node(Arc::clone(&node));
        self.index.flush_to_store(self.store.as_ref())?;

        let is_main_chain = self.connect_best_chain(state, &node, &block, flags)?;
        state.pending.push(Notification::BlockAccepted(block));
        Ok(is_main_chain)
    }

    fn connect_best_chain(
        &self,
        state: &mut ChainLockState,
        node: &NodeRef,
        block: &Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let mut fast_add = flags.contains(BehaviorFlags::FAST_ADD);
        let tip = self.tip()?;

        if block.header.prev_block == tip.hash {
            // A block validated earlier on a side branch needs no second check.
            if !fast_add {
                fast_add = self.index.node_status(node).known_valid();
            }

            let mut view = UtxoViewpoint::new();
            view.set_best_hash(tip.hash);
            let mut stxos: Vec<SpentTxOut> = Vec::with_capacity(count_spent_outputs(block));
            if !fast_add {
                match self.check_connect_block(state, node, block, &mut view, Some(&mut stxos)) {
                    Ok(()) => {
                        self.index.set_status_flags(node, BlockStatus::VALID);
                        self.flush_index();
                    }
                    Err(err) if err.is_rule_error() => {
                        self.index.set_status_flags(node, BlockStatus::VALIDATE_FAILED);
                        self.flush_index();
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            } else {
                view.fetch_input_utxos(self.store.as_ref(), block, node.height)?;
                view.connect_transactions(block, node.height, Some(&mut stxos))?;
            }

            self.connect_block(state, node, block, &mut view, &stxos)?;

            if !self.index.node_status(node).known_valid() {
                self.index.set_status_flags(node, BlockStatus::VALID);
                self.flush_index();
            }
            return Ok(true);
        }

        if fast_add {
            log_warn!(
                "Fast add set in the side chain case for block {}",
                hash256_to_hex(&node.hash)
            );
        }

        // Less or equal work stays on the side chain.
        if node.work_sum <= tip.work_sum {
            if let Some(fork) = self.best_chain.find_fork(Some(node)) {
                if node.parent.as_ref().is_some_and(|parent| parent.hash == fork.hash) {
                    log_info!(
                        "FORK: Block {} forks the chain at height {}/block {}, but does not cause a reorganize",
                        hash256_to_hex(&node.hash),
                        fork.height,
                        hash256_to_hex(&fork.hash)
                    );
                } else {
                    log_info!(
                        "EXTEND FORK: Block {} extends a side chain which forks the chain at height {}/block {}",
                        hash256_to_hex(&node.hash),
                        fork.height,
                        hash256_to_hex(&fork.hash)
                    );
                }
            }
            return Ok(false);
        }

        log_info!(
            "REORGANIZE: Block {} is causing a reorganize.",
            hash256_to_hex(&node.hash)
        );
        let result = self
            .get_reorganize_nodes(node)
            .and_then(|(detach, attach)| self.reorganize_chain(state, &detach, &attach));
        // Status changes from a failed attempt are kept too.
        self.flush_index();
        result?;
        Ok(true)
    }

    /// Nodes to detach (tip first) and attach (oldest first) to make `node`
    /// the tip. A branch with an invalid block marks the rest as invalid
    /// descendants and fails.
    fn get_reorganize_nodes(
        &self,
        node: &NodeRef,
    ) -> Result<(Vec<NodeRef>, Vec<NodeRef>), ChainError> {
        let invalid_ancestor = |hash: &Hash256| {
            rule_error(
                ErrorCode::InvalidAncestorBlock,
                format!("block {} descends from an invalid block", hash256_to_hex(hash)),
            )
        };

        if let Some(parent) = node.parent.as_ref() {
            if self.index.node_status(parent).known_invalid() {
                self.index.set_status_flags(node, BlockStatus::INVALID_ANCESTOR);
                return Err(invalid_ancestor(&node.hash));
            }
        }

        let fork = self.best_chain.find_fork(Some(node));
        let is_fork = |candidate: &NodeRef| fork.as_ref().is_some_and(|fork| fork.hash == candidate.hash);

        let mut attach = Vec::new();
        let mut cursor = Some(Arc::clone(node));
        while let Some(current) = cursor {
            if is_fork(&current) {
                break;
            }
            if self.index.node_status(&current).known_invalid() {
                for descendant in &attach {
                    self.index.set_status_flags(descendant, BlockStatus::INVALID_ANCESTOR);
                }
                return Err(invalid_ancestor(&node.hash));
            }
            cursor = current.parent.clone();
            attach.push(current);
        }
        attach.reverse();

        let mut detach = Vec::new();
        let mut cursor = self.best_chain.tip();
        while let Some(current) = cursor {
            if is_fork(&current) {
                break;
            }
            cursor = current.parent.clone();
            detach.push(current);
        }
        Ok((detach, attach))
    }

    fn fetch_node_block(&self, node: &NodeRef) -> Result<Arc<Block>, ChainError> {
        let block = fetch_block(self.store.as_ref(), &node.hash)?.ok_or_else(|| {
            corruption(
                "block data",
                format!(
                    "block {} at height {} is indexed but not stored",
                    hash256_to_hex(&node.hash),
                    node.height
                ),
            )
        })?;
        if block.hash() != node.hash {
            return Err(assert_error(format!(
                "detach block node hash {} (height {}) does not match previous parent block hash {}",
                hash256_to_hex(&node.hash),
                node.height,
                hash256_to_hex(&block.hash())
            )));
        }
        Ok(Arc::new(block))
    }

    /// Switches the best chain to the branch ending in the last `attach`
    /// node. Every attached block is checked against a scratch view before
    /// anything is written, so a rule violation leaves the chain untouched.
    fn reorganize_chain(
        &self,
        state: &mut ChainLockState,
        detach: &[NodeRef],
        attach: &[NodeRef],
    ) -> Result<(), ChainError> {
        if detach.is_empty() && attach.is_empty() {
            return Ok(());
        }

        let old_best = self.tip()?;
        if let Some(first) = detach.first() {
            if first.hash != old_best.hash {
                return Err(assert_error(format!(
                    "reorganize nodes to detach are not for the current best chain -- first detach node {}, current chain {}",
                    hash256_to_hex(&first.hash),
                    hash256_to_hex(&old_best.hash)
                )));
            }
        }
        if let (Some(first_attach), Some(last_detach)) = (attach.first(), detach.last()) {
            let attach_parent = first_attach.parent.as_ref().map(|parent| parent.hash);
            let detach_parent = last_detach.parent.as_ref().map(|parent| parent.hash);
            if attach_parent != detach_parent {
                return Err(assert_error(
                    "reorganize nodes do not have the same fork point",
                ));
            }
        }

        // Check phase: unwind and replay on a scratch view.
        let mut detach_blocks = Vec::with_capacity(detach.len());
        let mut detach_stxos = Vec::with_capacity(detach.len());
        let mut view = UtxoViewpoint::new();
        view.set_best_hash(old_best.hash);
        let mut new_best = Arc::clone(&old_best);
        for node in detach {
            self.interrupt.check()?;
            let block = self.fetch_node_block(node)?;
            view.fetch_input_utxos(self.store.as_ref(), &block, node.height)?;
            let stxos = fetch_spend_journal(self.store.as_ref(), &block)?;
            view.disconnect_transactions(self.store.as_ref(), &block, node.height, &stxos)?;
            detach_blocks.push(block);
            detach_stxos.push(stxos);
            if let Some(parent) = node.parent.as_ref() {
                new_best = Arc::clone(parent);
            }
        }
        let fork = (!attach.is_empty()).then(|| Arc::clone(&new_best));

        let mut attach_blocks = Vec::with_capacity(attach.len());
        for (position, node) in attach.iter().enumerate() {
            self.interrupt.check()?;
            let block = self.fetch_node_block(node)?;

            if self.index.node_status(node).known_valid() {
                view.fetch_input_utxos(self.store.as_ref(), &block, node.height)?;
                view.connect_transactions(&block, node.height, None)?;
            } else if let Err(err) = self.check_connect_block(state, node, &block, &mut view, None) {
                if err.is_rule_error() {
                    self.index.set_status_flags(node, BlockStatus::VALIDATE_FAILED);
                    for descendant in &attach[position + 1..] {
                        self.index.set_status_flags(descendant, BlockStatus::INVALID_ANCESTOR);
                    }
                }
                return Err(err);
            } else {
                self.index.set_status_flags(node, BlockStatus::VALID);
            }
            attach_blocks.push(block);
            new_best = Arc::clone(node);
        }

        // Commit phase: the checks passed, so apply for real.
        let mut view = UtxoViewpoint::new();
        view.set_best_hash(old_best.hash);
        for ((node, block), stxos) in detach.iter().zip(&detach_blocks).zip(&detach_stxos) {
            view.fetch_input_utxos(self.store.as_ref(), block, node.height)?;
            view.disconnect_transactions(self.store.as_ref(), block, node.height, stxos)?;
            self.disconnect_block(state, node, block, &mut view)?;
        }
        for (node, block) in attach.iter().zip(&attach_blocks) {
            view.fetch_input_utxos(self.store.as_ref(), block, node.height)?;
            let mut stxos = Vec::with_capacity(count_spent_outputs(block));
            view.connect_transactions(block, node.height, Some(&mut stxos))?;
            self.connect_block(state, node, block, &mut view, &stxos)?;
        }

        if let Some(fork) = fork {
            log_info!(
                "REORGANIZE: Chain forks at {} (height {})",
                hash256_to_hex(&fork.hash),
                fork.height
            );
        }
        log_info!(
            "REORGANIZE: Old best chain head was {} (height {})",
            hash256_to_hex(&old_best.hash),
            old_best.height
        );
        log_info!(
            "REORGANIZE: New best chain head is {} (height {})",
            hash256_to_hex(&new_best.hash),
            new_best.height
        );
        Ok(())
    }
}
