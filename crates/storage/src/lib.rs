//! Column-oriented key-value store for the chain state.
//!
//! Every mutation goes through a [`WriteBatch`]; a block connect or disconnect is one batch, so a
//! backend only needs `write_batch` to be atomic for the chain state to survive a crash.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    /// Persisted bytes that failed to decode, with context naming the record.
    Corruption(String),
}

impl StoreError {
    pub fn corruption(context: impl Into<String>) -> Self {
        StoreError::Corruption(context.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Corruption(message) => write!(f, "corrupt store data: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Named buckets of the chain-state store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// `<height BE4><hash>` -> `<header><status>`
    BlockIndex,
    /// hash -> height LE4 (main chain only)
    HashIndex,
    /// height LE4 -> hash (main chain only)
    HeightIndex,
    /// `<txid><VLQ index>` -> compressed entry
    Utxo,
    /// block hash -> spent outputs in reverse order
    SpendJournal,
    /// block hash -> raw block bytes
    BlockData,
    Meta,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::BlockIndex,
        Column::HashIndex,
        Column::HeightIndex,
        Column::Utxo,
        Column::SpendJournal,
        Column::BlockData,
        Column::Meta,
    ];

    /// Position in [`Column::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// On-disk name; changing one orphans the data written under it.
    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "blockidx",
            Column::HashIndex => "hashidx",
            Column::HeightIndex => "heightidx",
            Column::Utxo => "utxoset",
            Column::SpendJournal => "spendjournal",
            Column::BlockData => "blocks",
            Column::Meta => "meta",
        }
    }
}

/// A set of columns, e.g. the ones a batch writes to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ColumnSet(u8);

impl ColumnSet {
    pub const EMPTY: ColumnSet = ColumnSet(0);

    pub fn insert(&mut self, column: Column) {
        self.0 |= 1 << column.index();
    }

    pub fn contains(self, column: Column) -> bool {
        self.0 & (1 << column.index()) != 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Column> {
        Column::ALL
            .into_iter()
            .filter(move |column| self.contains(*column))
    }
}

/// Keys are at most a hash plus a few bytes (outpoints, block index rows).
pub type Key = SmallVec<[u8; 40]>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: Key,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Key,
    },
}

impl WriteOp {
    pub fn column(&self) -> Column {
        match self {
            WriteOp::Put { column, .. } | WriteOp::Delete { column, .. } => *column,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key.as_slice(),
        }
    }
}

/// Ordered puts and deletes applied atomically by [`KeyValueStore::write_batch`]. A later op on
/// the same key wins.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    touched: ColumnSet,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.touched.insert(column);
        self.ops.push(WriteOp::Put {
            column,
            key: Key::from_slice(key.as_ref()),
            value: value.as_ref().to_vec(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl AsRef<[u8]>) {
        self.touched.insert(column);
        self.ops.push(WriteOp::Delete {
            column,
            key: Key::from_slice(key.as_ref()),
        });
    }

    /// What the batch will leave under `key`: `Some(Some(value))` for a put, `Some(None)` for a
    /// delete, `None` when the batch does not touch it.
    pub fn pending(&self, column: Column, key: &[u8]) -> Option<Option<&[u8]>> {
        if !self.touched.contains(column) {
            return None;
        }
        self.ops
            .iter()
            .rev()
            .find(|op| op.column() == column && op.key() == key)
            .map(|op| match op {
                WriteOp::Put { value, .. } => Some(value.as_slice()),
                WriteOp::Delete { .. } => None,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn touched(&self) -> ColumnSet {
        self.touched
    }

    pub fn append(&mut self, other: WriteBatch) {
        for column in other.touched.iter() {
            self.touched.insert(column);
        }
        self.ops.extend(other.ops);
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }

    /// Key-ordered entries whose key starts with `prefix`.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut out = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            out.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(out)
    }

    /// Streams the same entries as [`KeyValueStore::scan_prefix`]; a visitor error stops the scan.
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;

    /// Applies every op of `batch` or none of them.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Makes committed batches durable. Volatile backends have nothing to do.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        self.as_ref().contains(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.as_ref().flush()
    }
}
