//! Required difficulty for the next block on a branch.

use btcnode_consensus::ConsensusParams;
use btcnode_pow::retarget_bits;

use crate::blocknode::{NodeAncestry, NodeRef};
use crate::error::{assert_error, ChainError};

/// Bits of the last block on the branch that was not mined under the
/// min-difficulty exception, stopping at retarget boundaries.
pub fn find_prev_testnet_difficulty(start: &NodeRef, params: &ConsensusParams) -> u32 {
    let blocks_per_retarget = params.blocks_per_retarget();
    let mut cursor = Some(start);
    while let Some(node) = cursor {
        if node.height % blocks_per_retarget == 0 || node.bits != params.pow_limit_bits {
            return node.bits;
        }
        cursor = node.parent.as_ref();
    }
    params.pow_limit_bits
}

/// Bits a block built on `last` with timestamp `new_block_time` must carry.
pub fn calc_next_required_difficulty(
    last: Option<&NodeRef>,
    new_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, ChainError> {
    let Some(last) = last else {
        return Ok(params.pow_limit_bits);
    };

    let blocks_per_retarget = params.blocks_per_retarget();
    if (last.height + 1) % blocks_per_retarget != 0 {
        if params.reduce_min_difficulty {
            // Allow a min-difficulty block once too long has passed without one.
            let allow_min_time = i64::from(last.timestamp) + params.min_diff_reduction_time;
            if new_block_time > allow_min_time {
                return Ok(params.pow_limit_bits);
            }
            return Ok(find_prev_testnet_difficulty(last, params));
        }
        return Ok(last.bits);
    }

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let first = last.relative_ancestor(blocks_per_retarget - 1).ok_or_else(|| {
        assert_error(format!(
            "unable to obtain the retarget start below height {}",
            last.height
        ))
    })?;
    let actual_timespan = i64::from(last.timestamp) - i64::from(first.timestamp);
    retarget_bits(last.bits, actual_timespan, params)
        .map_err(|err| assert_error(format!("invalid bits {:08x} at height {}: {err}", last.bits, last.height)))
}
