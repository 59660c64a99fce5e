//! Consensus-wide constants shared across validation.

/// Maximum serialized size of a block without witness data (network rule).
pub const MAX_BLOCK_BASE_SIZE: usize = 1_000_000;
/// Maximum block weight once segwit is active (network rule).
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;
/// Discount applied to witness bytes and legacy sig-ops.
pub const WITNESS_SCALE_FACTOR: usize = 4;
/// Cap on the weighted signature operation cost of a block.
pub const MAX_BLOCK_SIGOPS_COST: usize = 80_000;
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;
/// Number of previous timestamps used for the median time past.
pub const MEDIAN_TIME_BLOCKS: usize = 11;
/// How far ahead of network-adjusted time a block timestamp may be.
pub const MAX_TIME_OFFSET_SECONDS: i64 = 2 * 60 * 60;
/// Lock times below this are block heights, at or above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
pub const SEQUENCE_LOCK_TIME_DISABLED: u32 = 1 << 31;
pub const SEQUENCE_LOCK_TIME_IS_SECONDS: u32 = 1 << 22;
pub const SEQUENCE_LOCK_TIME_MASK: u32 = 0x0000_ffff;
/// Relative time locks count in units of 2^9 = 512 seconds.
pub const SEQUENCE_LOCK_TIME_GRANULARITY: u32 = 9;
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: u32 = 0xe000_0000;
/// Number of usable signalling bits in a version-bits header.
pub const VERSIONBITS_NUM_BITS: u32 = 29;
pub const MAX_ORPHAN_BLOCKS: usize = 100;
pub const ORPHAN_EXPIRATION_SECS: i64 = 60 * 60;
/// Minimum depth below the tip before a block may become a checkpoint.
pub const CHECKPOINT_CONFIRMATIONS: i32 = 2016;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const COINBASE_WITNESS_DATA_LEN: usize = 32;
pub const COINBASE_WITNESS_PK_SCRIPT_LEN: usize = 38;
/// `OP_RETURN OP_DATA_36 0xaa21a9ed` prefix of the coinbase witness commitment output.
pub const WITNESS_MAGIC_BYTES: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
