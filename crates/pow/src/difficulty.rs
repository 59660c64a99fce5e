//! Difficulty and compact target utilities.

use btcnode_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        if word != 0 {
            let overflow =
                size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
            if overflow {
                return Err(CompactError::Overflow);
            }
        }
        U256::from(word) << (8 * (size - 3))
    };

    // A set sign bit on a zero mantissa still encodes zero.
    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to find a block at `bits`: 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Like `block_proof`, but unencodable targets contribute no work.
pub fn block_work(bits: u32) -> U256 {
    block_proof(bits).unwrap_or_default()
}

fn pow_limit(params: &ConsensusParams) -> U256 {
    U256::from_little_endian(&params.pow_limit)
}

/// Scales `old_bits` by the observed timespan of one retarget interval.
pub fn retarget_bits(
    old_bits: u32,
    actual_timespan: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let adjusted = actual_timespan.clamp(
        params.min_retarget_timespan(),
        params.max_retarget_timespan(),
    );
    let old_target = compact_to_u256(old_bits)?;
    let limit = pow_limit(params);

    let scaled: U512 = old_target.full_mul(U256::from(adjusted as u64))
        / U512::from(params.target_timespan as u64);
    let new_target = U256::try_from(scaled).unwrap_or(limit).min(limit);

    Ok(u256_to_compact(new_target))
}

/// Easiest target a block could legally carry `duration` seconds after a
/// block with `bits`.
pub fn easiest_difficulty(
    bits: u32,
    duration: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    if params.reduce_min_difficulty && duration > params.min_diff_reduction_time {
        return Ok(params.pow_limit_bits);
    }

    let limit = pow_limit(params);
    let factor = U256::from(params.retarget_adjustment_factor as u64);
    let step = params.max_retarget_timespan();
    let mut target = compact_to_u256(bits)?;
    let mut remaining = duration;
    while remaining > 0 && target < limit {
        target = target.saturating_mul(factor);
        remaining -= step;
    }
    Ok(u256_to_compact(target.min(limit)))
}
