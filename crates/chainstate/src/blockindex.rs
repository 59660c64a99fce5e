//! Every known header, keyed by hash, with dirty tracking for persistence.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use btcnode_consensus::Hash256;
use btcnode_primitives::block::{BlockHeader, HEADER_SIZE};
use btcnode_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blocknode::{BlockStatus, NodeRef};

/// Key of a block index record: big-endian height then hash, so a prefix scan
/// returns parents before children.
pub fn block_index_key(height: i32, hash: &Hash256) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..4].copy_from_slice(&(height as u32).to_be_bytes());
    key[4..].copy_from_slice(hash);
    key
}

pub fn encode_block_index_value(header: &BlockHeader, status: BlockStatus) -> Vec<u8> {
    let mut value = Vec::with_capacity(HEADER_SIZE + 1);
    value.extend_from_slice(&header.consensus_encode());
    value.push(status.bits());
    value
}

pub fn decode_block_index_value(bytes: &[u8]) -> Result<(BlockHeader, BlockStatus), StoreError> {
    if bytes.len() != HEADER_SIZE + 1 {
        return Err(StoreError::corruption(format!(
            "block index entry has {} bytes, expected {}",
            bytes.len(),
            HEADER_SIZE + 1
        )));
    }
    let header = BlockHeader::consensus_decode(&bytes[..HEADER_SIZE])
        .map_err(|err| StoreError::corruption(format!("block index header: {err}")))?;
    Ok((header, BlockStatus::from_bits(bytes[HEADER_SIZE])))
}

#[derive(Default)]
struct IndexInner {
    index: HashMap<Hash256, NodeRef>,
    dirty: HashSet<Hash256>,
}

#[derive(Default)]
pub struct BlockIndex {
    inner: RwLock<IndexInner>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.read().index.contains_key(hash)
    }

    pub fn lookup_node(&self, hash: &Hash256) -> Option<NodeRef> {
        self.read().index.get(hash).cloned()
    }

    /// Adds a freshly connected header and marks it for the next flush.
    pub fn add_node(&self, node: NodeRef) {
        let mut inner = self.write();
        inner.dirty.insert(node.hash);
        inner.index.insert(node.hash, node);
    }

    /// Used while loading from the store, where the record is already persisted.
    pub fn add_node_no_lock(&mut self, node: NodeRef) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.index.insert(node.hash, node);
    }

    pub fn len(&self) -> usize {
        self.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_status(&self, node: &NodeRef) -> BlockStatus {
        let _guard = self.read();
        node.load_status()
    }

    pub fn set_status_flags(&self, node: &NodeRef, flags: BlockStatus) {
        let mut inner = self.write();
        let current = node.load_status();
        let next = current.union(flags);
        if next != current {
            node.store_status(next);
            inner.dirty.insert(node.hash);
        }
    }

    pub fn unset_status_flags(&self, node: &NodeRef, flags: BlockStatus) {
        let mut inner = self.write();
        let current = node.load_status();
        let next = current.difference(flags);
        if next != current {
            node.store_status(next);
            inner.dirty.insert(node.hash);
        }
    }

    /// Snapshot of all nodes. Order is unspecified.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.read().index.values().cloned().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.read().dirty.len()
    }

    /// Writes every dirty node in one batch. The dirty set is kept on failure.
    pub fn flush_to_store<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.dirty.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for hash in &inner.dirty {
            let Some(node) = inner.index.get(hash) else {
                continue;
            };
            batch.put(
                Column::BlockIndex,
                block_index_key(node.height, &node.hash),
                encode_block_index_value(&node.header(), node.load_status()),
            );
        }
        store.write_batch(&batch)?;
        inner.dirty.clear();
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocknode::tests::chain;
    use btcnode_storage::memory::MemoryStore;

    #[test]
    fn status_changes_mark_dirty_once() {
        let index = BlockIndex::new();
        let nodes = chain(None, 2, 0);
        for node in &nodes {
            index.add_node(node.clone());
        }
        assert_eq!(index.dirty_count(), 2);

        let store = MemoryStore::new();
        index.flush_to_store(&store).expect("flush");
        assert_eq!(index.dirty_count(), 0);

        index.set_status_flags(&nodes[1], BlockStatus::VALID);
        index.set_status_flags(&nodes[1], BlockStatus::VALID);
        assert_eq!(index.dirty_count(), 1);
        assert!(index.node_status(&nodes[1]).known_valid());

        index.unset_status_flags(&nodes[0], BlockStatus::VALID);
        assert_eq!(index.dirty_count(), 1);
    }

    #[test]
    fn flush_writes_header_and_status() {
        let index = BlockIndex::new();
        let nodes = chain(None, 3, 0);
        for node in &nodes {
            index.add_node(node.clone());
        }
        index.set_status_flags(&nodes[2], BlockStatus::DATA_STORED | BlockStatus::VALID);
        let store = MemoryStore::new();
        index.flush_to_store(&store).expect("flush");

        let records = store.scan_prefix(Column::BlockIndex, &[]).expect("scan");
        assert_eq!(records.len(), 3);
        let key = block_index_key(2, &nodes[2].hash);
        let value = store
            .get(Column::BlockIndex, &key)
            .expect("get")
            .expect("present");
        let (header, status) = decode_block_index_value(&value).expect("decode");
        assert_eq!(header.hash(), nodes[2].hash);
        assert_eq!(status, BlockStatus::DATA_STORED | BlockStatus::VALID);
    }

    #[test]
    fn keys_sort_by_height() {
        let low = block_index_key(1, &[0xff; 32]);
        let high = block_index_key(256, &[0x00; 32]);
        assert!(low < high);
    }

    #[test]
    fn rejects_truncated_values() {
        assert!(decode_block_index_value(&[0u8; 80]).is_err());
    }

    #[test]
    fn dropping_a_long_chain_does_not_overflow() {
        let index = BlockIndex::new();
        for node in chain(None, 50_000, 0) {
            index.add_node(node);
        }
        drop(index);
    }
}
