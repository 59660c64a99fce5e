//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in satoshi) is valid.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

/// Subsidy paid to the first block of every reduction interval.
pub const BASE_SUBSIDY: Amount = 50 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Newly minted coins allowed in the coinbase at `height`; an interval of zero never halves.
pub fn block_subsidy(height: i32, subsidy_reduction_interval: i32) -> Amount {
    if subsidy_reduction_interval <= 0 {
        return BASE_SUBSIDY;
    }
    let halvings = height.max(0) / subsidy_reduction_interval;
    if halvings >= 64 {
        return 0;
    }
    BASE_SUBSIDY >> halvings
}
