use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use btcnode_log::log_info;
use btcnode_storage::fjall::FjallStore;
use btcnode_storage::memory::MemoryStore;
use btcnode_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

use crate::config::{Backend, Config};

pub const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        match self {
            Store::Memory(store) => store.contains(column, key),
            Store::Fjall(store) => store.contains(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.flush(),
            Store::Fjall(store) => store.flush(),
        }
    }
}

pub fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let db_path = config.db_path();
            fs::create_dir_all(&db_path)
                .map_err(|err| format!("failed to create {}: {err}", db_path.display()))?;
            log_info!("Opening fjall store at {}", db_path.display());
            let store = FjallStore::open(&db_path).map_err(|err| err.to_string())?;
            Ok(Store::Fjall(store))
        }
    }
}

/// Held for the life of the process; the OS drops the lock with the file.
pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    use fs2::FileExt;

    fs::create_dir_all(data_dir)
        .map_err(|err| format!("failed to create data dir {}: {err}", data_dir.display()))?;
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked by another btcnode instance; lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {}: {err}",
            data_dir.display()
        )),
    }
}
