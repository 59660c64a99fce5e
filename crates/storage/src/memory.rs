use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered in-memory backend with one map per column. Batches apply under one write lock, so
/// readers never see half of one.
#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<[ColumnMap; Column::ALL.len()]>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, [ColumnMap; Column::ALL.len()]> {
        self.columns.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn column_len(&self, column: Column) -> usize {
        self.read()[column.index()].len()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()[column.index()].get(key).cloned())
    }

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read()[column.index()].contains_key(key))
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read();
        for (key, value) in guard[column.index()]
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.columns.write().unwrap_or_else(PoisonError::into_inner);
        for op in batch.iter() {
            let map = &mut guard[op.column().index()];
            match op {
                WriteOp::Put { key, value, .. } => {
                    map.insert(key.to_vec(), value.clone());
                }
                WriteOp::Delete { key, .. } => {
                    map.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}
