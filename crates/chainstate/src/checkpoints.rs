//! Hard-coded known-good blocks and the helpers that enforce them.

use btcnode_consensus::constants::CHECKPOINT_CONFIRMATIONS;
use btcnode_consensus::{hash256_to_hex, Checkpoint, Hash256};
use btcnode_primitives::block::Block;
use btcnode_primitives::transaction::Transaction;
use btcnode_script::standard::{classify_script_pubkey, ScriptType};

use crate::blockindex::BlockIndex;
use crate::blocknode::NodeRef;
use crate::chainview::ChainView;
use crate::error::{assert_error, ChainError};

pub fn latest_checkpoint(checkpoints: &[Checkpoint]) -> Option<&Checkpoint> {
    checkpoints.last()
}

/// False only when a checkpoint exists at `height` with a different hash.
pub fn verify_checkpoint(checkpoints: &[Checkpoint], height: i32, hash: &Hash256) -> bool {
    match checkpoints.iter().find(|checkpoint| checkpoint.height == height) {
        Some(checkpoint) => checkpoint.hash == *hash,
        None => true,
    }
}

/// Remembers the newest checkpoint reached by the best chain so the lookup
/// does not rescan the list on every block.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    node: Option<NodeRef>,
    next: Option<usize>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_checkpoint<'a>(&self, checkpoints: &'a [Checkpoint]) -> Option<&'a Checkpoint> {
        self.next.and_then(|index| checkpoints.get(index))
    }

    /// Newest checkpoint that is part of the best chain, if any.
    pub fn find_previous(
        &mut self,
        checkpoints: &[Checkpoint],
        index: &BlockIndex,
        best_chain: &ChainView,
    ) -> Result<Option<NodeRef>, ChainError> {
        if checkpoints.is_empty() {
            return Ok(None);
        }

        if self.node.is_none() && self.next.is_none() {
            for (position, checkpoint) in checkpoints.iter().enumerate().rev() {
                let Some(node) = index.lookup_node(&checkpoint.hash) else {
                    continue;
                };
                if !best_chain.contains(&node) {
                    continue;
                }
                self.node = Some(std::sync::Arc::clone(&node));
                if position + 1 < checkpoints.len() {
                    self.next = Some(position + 1);
                }
                return Ok(Some(node));
            }
            self.next = Some(0);
            return Ok(None);
        }

        let Some(next) = self.next else {
            return Ok(self.node.clone());
        };
        let next_checkpoint = &checkpoints[next];
        if best_chain.height() < next_checkpoint.height {
            return Ok(self.node.clone());
        }

        // The best chain passed the next checkpoint, which was verified on the way in.
        let node = index.lookup_node(&next_checkpoint.hash).ok_or_else(|| {
            assert_error(format!(
                "checkpoint {} at height {} is not in the block index",
                hash256_to_hex(&next_checkpoint.hash),
                next_checkpoint.height
            ))
        })?;
        self.node = Some(std::sync::Arc::clone(&node));
        self.next = (next + 1 < checkpoints.len()).then_some(next + 1);
        Ok(Some(node))
    }
}

/// Any output script outside the standard templates.
pub fn is_nonstandard_transaction(tx: &Transaction) -> bool {
    tx.vout
        .iter()
        .any(|output| classify_script_pubkey(&output.script_pubkey) == ScriptType::NonStandard)
}

/// Whether `block` would make a reasonable new checkpoint: deep enough in the
/// best chain, surrounded by blocks with ordered timestamps, and made only of
/// standard outputs.
pub fn is_checkpoint_candidate(best_chain: &ChainView, node: Option<&NodeRef>, block: &Block) -> bool {
    let Some(node) = node else {
        return false;
    };
    if !best_chain.contains(node) {
        return false;
    }
    if node.height > best_chain.height() - CHECKPOINT_CONFIRMATIONS {
        return false;
    }
    let Some(next) = best_chain.next(node) else {
        return false;
    };
    let Some(prev) = node.parent.as_ref() else {
        return false;
    };
    if prev.timestamp >= node.timestamp || next.timestamp <= node.timestamp {
        return false;
    }
    !block.transactions.iter().any(is_nonstandard_transaction)
}
