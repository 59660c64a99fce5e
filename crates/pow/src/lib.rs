//! Compact targets, work accounting and proof-of-work checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_proof, block_work, compact_to_target, compact_to_u256, easiest_difficulty,
    hash_meets_target, retarget_bits, target_to_compact, u256_to_compact, CompactError,
};
pub use primitive_types::U256;
pub use validation::{check_proof_of_work, PowError};
