//! In-memory metadata for one block header.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use btcnode_consensus::constants::MEDIAN_TIME_BLOCKS;
use btcnode_consensus::Hash256;
use btcnode_pow::{block_work, U256};
use btcnode_primitives::block::BlockHeader;

/// Validation state bits of a block node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct BlockStatus(u8);

impl BlockStatus {
    pub const NONE: BlockStatus = BlockStatus(0);
    /// The full block is in the block store.
    pub const DATA_STORED: BlockStatus = BlockStatus(1 << 0);
    /// The block passed full validation.
    pub const VALID: BlockStatus = BlockStatus(1 << 1);
    pub const VALIDATE_FAILED: BlockStatus = BlockStatus(1 << 2);
    pub const INVALID_ANCESTOR: BlockStatus = BlockStatus(1 << 3);

    pub const fn from_bits(bits: u8) -> Self {
        BlockStatus(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: BlockStatus) -> Self {
        BlockStatus(self.0 | other.0)
    }

    pub const fn difference(self, other: BlockStatus) -> Self {
        BlockStatus(self.0 & !other.0)
    }

    pub const fn contains(self, other: BlockStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn have_data(self) -> bool {
        self.contains(Self::DATA_STORED)
    }

    pub fn known_valid(self) -> bool {
        self.contains(Self::VALID)
    }

    pub fn known_invalid(self) -> bool {
        self.0 & (Self::VALIDATE_FAILED.0 | Self::INVALID_ANCESTOR.0) != 0
    }
}

impl std::ops::BitOr for BlockStatus {
    type Output = BlockStatus;

    fn bitor(self, rhs: BlockStatus) -> BlockStatus {
        self.union(rhs)
    }
}

pub type NodeRef = Arc<BlockNode>;

/// One block header positioned in the block tree.
///
/// Everything but the status is fixed at construction. The status lives in an
/// atomic so the index can flip bits under its own lock while readers keep
/// their `Arc` handles.
pub struct BlockNode {
    pub hash: Hash256,
    pub parent: Option<NodeRef>,
    pub height: i32,
    pub work_sum: U256,
    pub version: i32,
    pub bits: u32,
    pub nonce: u32,
    pub timestamp: u32,
    pub merkle_root: Hash256,
    status: AtomicU8,
}

impl BlockNode {
    pub fn new(header: &BlockHeader, parent: Option<&NodeRef>) -> Self {
        let work = block_work(header.bits);
        let (height, work_sum) = match parent {
            Some(parent) => (parent.height + 1, parent.work_sum.saturating_add(work)),
            None => (0, work),
        };
        Self {
            hash: header.hash(),
            parent: parent.cloned(),
            height,
            work_sum,
            version: header.version,
            bits: header.bits,
            nonce: header.nonce,
            timestamp: header.time,
            merkle_root: header.merkle_root,
            status: AtomicU8::new(BlockStatus::NONE.bits()),
        }
    }

    pub fn with_status(self, status: BlockStatus) -> Self {
        self.status.store(status.bits(), Ordering::Release);
        self
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self
                .parent
                .as_ref()
                .map(|parent| parent.hash)
                .unwrap_or([0u8; 32]),
            merkle_root: self.merkle_root,
            time: self.timestamp,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Status as last written; consistent reads go through the block index.
    pub(crate) fn load_status(&self) -> BlockStatus {
        BlockStatus::from_bits(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn store_status(&self, status: BlockStatus) {
        self.status.store(status.bits(), Ordering::Release);
    }

    /// Median timestamp of this block and up to ten of its ancestors.
    ///
    /// Even-length windows take the upper of the two middle values.
    pub fn calc_past_median_time(&self) -> i64 {
        let mut timestamps = Vec::with_capacity(MEDIAN_TIME_BLOCKS);
        let mut node = Some(self);
        while let Some(current) = node {
            if timestamps.len() == MEDIAN_TIME_BLOCKS {
                break;
            }
            timestamps.push(i64::from(current.timestamp));
            node = current.parent.as_deref();
        }
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }
}

/// Ancestor walks need the `Arc` of every visited node, so they live on the handle.
pub trait NodeAncestry {
    fn ancestor(&self, height: i32) -> Option<NodeRef>;
    fn relative_ancestor(&self, distance: i32) -> Option<NodeRef>;
}

impl NodeAncestry for NodeRef {
    fn ancestor(&self, height: i32) -> Option<NodeRef> {
        if height < 0 || height > self.height {
            return None;
        }
        let mut node = self;
        while node.height > height {
            node = node.parent.as_ref()?;
        }
        Some(Arc::clone(node))
    }

    fn relative_ancestor(&self, distance: i32) -> Option<NodeRef> {
        self.ancestor(self.height - distance)
    }
}

impl Drop for BlockNode {
    fn drop(&mut self) {
        // Unlink uniquely owned ancestors one at a time instead of recursing
        // through the whole parent chain.
        let mut parent = self.parent.take();
        while let Some(node) = parent {
            match Arc::try_unwrap(node) {
                Ok(mut owned) => parent = owned.parent.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for BlockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockNode")
            .field("hash", &btcnode_consensus::hash256_to_hex(&self.hash))
            .field("height", &self.height)
            .field("status", &self.load_status())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    /// A linear branch of `len` nodes on top of `parent`, one second apart.
    pub(crate) fn chain(parent: Option<&NodeRef>, len: usize, tag: u32) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = Vec::with_capacity(len);
        let mut prev = parent.cloned();
        for i in 0..len {
            let prev_hash = prev.as_ref().map(|node| node.hash).unwrap_or([0u8; 32]);
            let time = 1_600_000_000 + prev.as_ref().map(|n| n.height + 1).unwrap_or(0) as u32;
            let node = Arc::new(BlockNode::new(
                &header(prev_hash, time, tag * 1_000 + i as u32),
                prev.as_ref(),
            ));
            nodes.push(Arc::clone(&node));
            prev = Some(node);
        }
        nodes
    }

    #[test]
    fn heights_and_work_accumulate() {
        let nodes = chain(None, 3, 0);
        assert_eq!(nodes[0].height, 0);
        assert_eq!(nodes[2].height, 2);
        assert_eq!(nodes[2].work_sum, block_work(0x207f_ffff) * U256::from(3u8));
        assert_eq!(nodes[2].header().prev_block, nodes[1].hash);
        assert_eq!(nodes[2].header().hash(), nodes[2].hash);
    }

    #[test]
    fn ancestors() {
        let nodes = chain(None, 10, 0);
        let tip = &nodes[9];
        assert!(Arc::ptr_eq(&tip.ancestor(4).expect("ancestor"), &nodes[4]));
        assert!(Arc::ptr_eq(&tip.ancestor(9).expect("self"), tip));
        assert!(tip.ancestor(10).is_none());
        assert!(tip.ancestor(-1).is_none());
        assert!(Arc::ptr_eq(&tip.relative_ancestor(9).expect("genesis"), &nodes[0]));
    }

    #[test]
    fn median_time_takes_upper_middle() {
        let times = [10u32, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120];
        let mut nodes: Vec<NodeRef> = Vec::new();
        for (i, time) in times.iter().enumerate() {
            let prev = nodes.last();
            let prev_hash = prev.map(|node| node.hash).unwrap_or([0u8; 32]);
            let node = Arc::new(BlockNode::new(&header(prev_hash, *time, i as u32), prev));
            nodes.push(node);
        }
        assert_eq!(nodes[0].calc_past_median_time(), 10);
        // [10, 20] has two middles; index 1 wins.
        assert_eq!(nodes[1].calc_past_median_time(), 20);
        // Eleven blocks [10..110] give t5.
        assert_eq!(nodes[10].calc_past_median_time(), 60);
        // Only the newest eleven count.
        assert_eq!(nodes[11].calc_past_median_time(), 70);
    }

    #[test]
    fn median_time_sorts_out_of_order_stamps() {
        let times = [50u32, 10, 40, 20, 30];
        let mut nodes: Vec<NodeRef> = Vec::new();
        for (i, time) in times.iter().enumerate() {
            let prev = nodes.last();
            let prev_hash = prev.map(|node| node.hash).unwrap_or([0u8; 32]);
            let node = Arc::new(BlockNode::new(&header(prev_hash, *time, i as u32), prev));
            nodes.push(node);
        }
        assert_eq!(nodes[4].calc_past_median_time(), 30);
    }

    #[test]
    fn dropping_a_long_chain_does_not_overflow() {
        let nodes = chain(None, 100_000, 0);
        // Front-to-back drop leaves the tip holding the only handle to everything.
        drop(nodes);
    }

    #[test]
    fn status_predicates() {
        let status = BlockStatus::DATA_STORED | BlockStatus::VALID;
        assert!(status.have_data());
        assert!(status.known_valid());
        assert!(!status.known_invalid());
        assert!(BlockStatus::INVALID_ANCESTOR.known_invalid());
        assert!(BlockStatus::VALIDATE_FAILED.known_invalid());
        assert_eq!(status.difference(BlockStatus::VALID), BlockStatus::DATA_STORED);
    }
}
