//! Blocks whose parent has not been seen yet.

use std::collections::HashMap;
use std::sync::Arc;

use btcnode_consensus::constants::{MAX_ORPHAN_BLOCKS, ORPHAN_EXPIRATION_SECS};
use btcnode_consensus::{hash256_to_hex, Hash256};
use btcnode_log::log_debug;
use btcnode_primitives::block::Block;

#[derive(Clone, Debug)]
struct OrphanBlock {
    hash: Hash256,
    block: Arc<Block>,
    expiration: i64,
}

/// Bounded pool indexed by hash and by parent hash.
#[derive(Debug)]
pub struct OrphanPool {
    orphans: HashMap<Hash256, OrphanBlock>,
    prev_orphans: HashMap<Hash256, Vec<Hash256>>,
    max_orphans: usize,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(MAX_ORPHAN_BLOCKS)
    }
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        Self {
            orphans: HashMap::new(),
            prev_orphans: HashMap::new(),
            max_orphans,
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn is_known(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Walks back through orphan parents and returns the first hash whose
    /// parent is not itself an orphan. Unknown hashes are their own root.
    pub fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        let mut root = *hash;
        let mut prev = *hash;
        while let Some(orphan) = self.orphans.get(&prev) {
            root = prev;
            prev = orphan.block.header.prev_block;
        }
        root
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Arc<Block>> {
        let orphan = self.orphans.remove(hash)?;
        let prev = orphan.block.header.prev_block;
        if let Some(siblings) = self.prev_orphans.get_mut(&prev) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.prev_orphans.remove(&prev);
            }
        }
        Some(orphan.block)
    }

    /// Adds `block` after expiring stale entries, evicting the entry closest
    /// to expiry when the pool is full.
    pub fn add(&mut self, block: Arc<Block>, now: i64) {
        let expired: Vec<Hash256> = self
            .orphans
            .values()
            .filter(|orphan| now > orphan.expiration)
            .map(|orphan| orphan.hash)
            .collect();
        for hash in expired {
            self.remove(&hash);
            log_debug!("Expired orphan block {}", hash256_to_hex(&hash));
        }

        if self.orphans.len() + 1 > self.max_orphans {
            let oldest = self
                .orphans
                .values()
                .min_by_key(|orphan| orphan.expiration)
                .map(|orphan| orphan.hash);
            if let Some(oldest) = oldest {
                self.remove(&oldest);
                log_debug!("Evicted orphan block {} to make room", hash256_to_hex(&oldest));
            }
        }

        let hash = block.hash();
        let prev = block.header.prev_block;
        self.orphans.insert(
            hash,
            OrphanBlock {
                hash,
                block,
                expiration: now + ORPHAN_EXPIRATION_SECS,
            },
        );
        self.prev_orphans.entry(prev).or_default().push(hash);
    }

    /// Hashes of the orphans whose parent is `prev`, oldest first.
    pub fn children_of(&self, prev: &Hash256) -> Vec<Hash256> {
        self.prev_orphans.get(prev).cloned().unwrap_or_default()
    }
}
