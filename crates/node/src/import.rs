//! Bootstrap import: a stream of `u32` little-endian length prefixed blocks.

use std::fmt;
use std::io::{self, Read};
use std::time::{Duration, Instant};

use btcnode_chainstate::{BehaviorFlags, BlockChain, ChainError};
use btcnode_consensus::constants::MAX_BLOCK_WEIGHT;
use btcnode_consensus::{hash256_to_hex, Hash256};
use btcnode_log::{log_debug, log_info};
use btcnode_primitives::block::{Block, BlockDecodeError};
use btcnode_storage::KeyValueStore;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportSummary {
    /// Records read from the stream.
    pub read: u64,
    /// Blocks accepted onto the main chain.
    pub imported: u64,
    /// Blocks the chain already had.
    pub skipped: u64,
    pub interrupted: bool,
}

#[derive(Debug)]
pub enum ImportError {
    Io(io::Error),
    Truncated { record: u64 },
    TooLarge { record: u64, len: u32 },
    Decode { record: u64, error: BlockDecodeError },
    Chain { record: u64, hash: Hash256, error: ChainError },
    NotMainChain { record: u64, hash: Hash256 },
    Orphan { record: u64, hash: Hash256 },
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::Io(err) => write!(f, "import read failed: {err}"),
            ImportError::Truncated { record } => write!(f, "record {record} is truncated"),
            ImportError::TooLarge { record, len } => {
                write!(f, "record {record} claims {len} bytes, above the block limit")
            }
            ImportError::Decode { record, error } => {
                write!(f, "record {record} is not a block: {error}")
            }
            ImportError::Chain {
                record,
                hash,
                error,
            } => write!(
                f,
                "record {record} (block {}) rejected: {error}",
                hash256_to_hex(hash)
            ),
            ImportError::NotMainChain { record, hash } => write!(
                f,
                "record {record} (block {}) does not extend the main chain",
                hash256_to_hex(hash)
            ),
            ImportError::Orphan { record, hash } => write!(
                f,
                "record {record} (block {}) is an orphan",
                hash256_to_hex(hash)
            ),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<io::Error> for ImportError {
    fn from(err: io::Error) -> Self {
        ImportError::Io(err)
    }
}

/// Streams every record into `process_block`. The file must hold the chain in order, so a block
/// that lands off the main chain or as an orphan stops the import.
pub fn import_blocks<S, R>(
    chain: &BlockChain<S>,
    mut reader: R,
    flags: BehaviorFlags,
) -> Result<ImportSummary, ImportError>
where
    S: KeyValueStore,
    R: Read,
{
    let mut summary = ImportSummary::default();
    let started = Instant::now();
    let mut last_report = started;
    let mut since_report = 0u64;

    loop {
        if chain.interrupt().is_requested() {
            summary.interrupted = true;
            break;
        }
        let Some(bytes) = read_record(&mut reader, summary.read)? else {
            break;
        };
        let record = summary.read;
        summary.read += 1;

        let block = Block::consensus_decode(&bytes)
            .map_err(|error| ImportError::Decode { record, error })?;
        let hash = block.hash();
        if chain.have_block(&hash) {
            log_debug!("Skipping known block {}", hash256_to_hex(&hash));
            summary.skipped += 1;
            continue;
        }

        match chain.process_block(block, flags) {
            Ok((_, true)) => return Err(ImportError::Orphan { record, hash }),
            Ok((false, _)) => return Err(ImportError::NotMainChain { record, hash }),
            Ok((true, false)) => {
                summary.imported += 1;
                since_report += 1;
            }
            Err(ChainError::Interrupted) => {
                summary.interrupted = true;
                break;
            }
            Err(error) => {
                return Err(ImportError::Chain {
                    record,
                    hash,
                    error,
                })
            }
        }

        let now = Instant::now();
        if now.duration_since(last_report) >= PROGRESS_INTERVAL {
            log_info!(
                "Processed {} blocks in the last {:.1}s (height {})",
                since_report,
                now.duration_since(last_report).as_secs_f64(),
                chain.best_snapshot().height
            );
            last_report = now;
            since_report = 0;
        }
    }

    log_info!(
        "Import {}: read {} records, imported {} blocks, skipped {} known, tip height {} after {:.1}s",
        if summary.interrupted { "interrupted" } else { "finished" },
        summary.read,
        summary.imported,
        summary.skipped,
        chain.best_snapshot().height,
        started.elapsed().as_secs_f64()
    );
    Ok(summary)
}

/// `None` at a clean end of stream.
fn read_record<R: Read>(reader: &mut R, record: u64) -> Result<Option<Vec<u8>>, ImportError> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ImportError::Truncated { record }),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_le_bytes(len_bytes);
    if len as usize > MAX_BLOCK_WEIGHT {
        return Err(ImportError::TooLarge { record, len });
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => ImportError::Truncated { record },
        _ => ImportError::Io(err),
    })?;
    Ok(Some(bytes))
}

/// Writes blocks in the import format.
pub fn write_records<'a, W, I>(mut writer: W, blocks: I) -> io::Result<()>
where
    W: io::Write,
    I: IntoIterator<Item = &'a Block>,
{
    for block in blocks {
        let bytes = block.consensus_encode();
        let len = u32::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too large"))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
    }
    writer.flush()
}
