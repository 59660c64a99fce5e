use btcnode_consensus::Hash256;
use btcnode_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    TargetNotPositive(u32),
    TargetAboveLimit(u32),
    HighHash,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::TargetNotPositive(bits) => {
                write!(f, "block target difficulty of {bits:08x} is too low")
            }
            PowError::TargetAboveLimit(bits) => {
                write!(f, "block target difficulty of {bits:08x} is higher than max")
            }
            PowError::HighHash => write!(f, "block hash is higher than expected max"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that the header's target is in range and, when `check_hash` is set,
/// that the header hash satisfies it.
pub fn check_proof_of_work(
    header: &BlockHeader,
    pow_limit: &Hash256,
    check_hash: bool,
) -> Result<(), PowError> {
    let target = match compact_to_u256(header.bits) {
        Ok(target) => target,
        Err(CompactError::Negative) => return Err(PowError::TargetNotPositive(header.bits)),
        Err(err) => return Err(err.into()),
    };
    if target.is_zero() {
        return Err(PowError::TargetNotPositive(header.bits));
    }

    if target > U256::from_little_endian(pow_limit) {
        return Err(PowError::TargetAboveLimit(header.bits));
    }

    if check_hash && U256::from_little_endian(&header.hash()) > target {
        return Err(PowError::HighHash);
    }

    Ok(())
}
