//! Persistent backend on fjall, one partition per [`Column`].

use std::path::Path;
use std::time::{Duration, Instant};

use btcnode_log::{log_debug, log_warn};
use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    durability: PersistMode,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    /// Block cache size; fjall's default when unset.
    pub cache_bytes: Option<u64>,
    /// Fsync every batch instead of leaving it in the OS buffer.
    pub sync_writes: bool,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        let keyspace = config.open().map_err(map_err)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map_err(map_err)
            })
            .collect::<Result<Vec<_>, _>>()?;
        log_debug!(
            "fjall keyspace open with {} partitions (sync writes {})",
            partitions.len(),
            options.sync_writes
        );
        Ok(Self {
            keyspace,
            partitions,
            durability: if options.sync_writes {
                PersistMode::SyncAll
            } else {
                PersistMode::Buffer
            },
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    /// Syncs the journal so every committed batch survives a power loss.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.partition(column)?
            .prefix(prefix)
            .map(|entry| {
                let (key, value) = entry.map_err(map_err)?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column)?.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(self.durability));
        for op in batch.iter() {
            let partition = self.partition(op.column())?;
            match op {
                WriteOp::Put { key, value, .. } => {
                    fjall_batch.insert(partition, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { key, .. } => {
                    fjall_batch.remove(partition, key.as_slice());
                }
            }
        }

        let started = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            let columns: Vec<&str> = batch.touched().iter().map(Column::as_str).collect();
            log_warn!(
                "fjall commit of {} ops took {}ms (columns {}, journals {})",
                batch.len(),
                elapsed.as_millis(),
                columns.join(","),
                self.keyspace.journal_count(),
            );
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.persist()
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
