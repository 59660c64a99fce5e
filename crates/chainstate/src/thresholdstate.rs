//! BIP9-style rule activation tracked per confirmation window.

use std::collections::HashMap;
use std::fmt;

use btcnode_consensus::Hash256;

use crate::blocknode::{NodeAncestry, NodeRef};
use crate::error::{assert_error, ChainError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdState::Defined => "ThresholdDefined",
            ThresholdState::Started => "ThresholdStarted",
            ThresholdState::LockedIn => "ThresholdLockedIn",
            ThresholdState::Active => "ThresholdActive",
            ThresholdState::Failed => "ThresholdFailed",
        }
    }
}

impl fmt::Display for ThresholdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a threshold computation needs to know about one rule change.
pub trait ThresholdConditionChecker {
    /// Median time at which voting may start.
    fn begin_time(&self) -> u64;
    /// Median time after which an unlocked deployment fails.
    fn end_time(&self) -> u64;
    fn rule_change_activation_threshold(&self) -> u32;
    fn miner_confirmation_window(&self) -> u32;
    /// Whether `node` counts as a vote for the change.
    fn condition(&mut self, node: &NodeRef) -> Result<bool, ChainError>;
}

/// States keyed by the hash of the last block of each window.
#[derive(Clone, Debug, Default)]
pub struct ThresholdStateCache {
    entries: HashMap<Hash256, ThresholdState>,
}

impl ThresholdStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<ThresholdState> {
        self.entries.get(hash).copied()
    }

    pub fn update(&mut self, hash: Hash256, state: ThresholdState) {
        self.entries.insert(hash, state);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State of the deployment described by `checker` for the block after `prev`.
///
/// States only change on window boundaries, so the result is cached under the
/// last block of the window that decided it.
pub fn threshold_state(
    prev: Option<&NodeRef>,
    checker: &mut dyn ThresholdConditionChecker,
    cache: &mut ThresholdStateCache,
) -> Result<ThresholdState, ChainError> {
    let window = checker.miner_confirmation_window() as i32;
    let Some(prev) = prev else {
        return Ok(ThresholdState::Defined);
    };
    if window <= 0 || prev.height + 1 < window {
        return Ok(ThresholdState::Defined);
    }

    // Snap to the last block of the previous window.
    let mut cursor = prev.ancestor(prev.height - (prev.height + 1) % window);

    let mut needed: Vec<NodeRef> = Vec::new();
    while let Some(node) = cursor.take() {
        if cache.lookup(&node.hash).is_some() {
            cursor = Some(node);
            break;
        }
        if (node.calc_past_median_time() as u64) < checker.begin_time() {
            cache.update(node.hash, ThresholdState::Defined);
            cursor = Some(node);
            break;
        }
        cursor = node.relative_ancestor(window);
        needed.push(node);
    }

    let mut state = match &cursor {
        Some(node) => cache.lookup(&node.hash).ok_or_else(|| {
            assert_error(format!(
                "threshold state cache has no entry for window ending at height {}",
                node.height
            ))
        })?,
        None => ThresholdState::Defined,
    };

    for node in needed.iter().rev() {
        match state {
            ThresholdState::Defined => {
                let median = node.calc_past_median_time() as u64;
                if median >= checker.end_time() {
                    state = ThresholdState::Failed;
                } else if median >= checker.begin_time() {
                    state = ThresholdState::Started;
                }
            }
            ThresholdState::Started => {
                let median = node.calc_past_median_time() as u64;
                if median >= checker.end_time() {
                    state = ThresholdState::Failed;
                } else {
                    let mut count = 0u32;
                    let mut counted = Some(std::sync::Arc::clone(node));
                    for _ in 0..window {
                        let Some(current) = counted else {
                            break;
                        };
                        if checker.condition(&current)? {
                            count += 1;
                        }
                        counted = current.parent.clone();
                    }
                    if count >= checker.rule_change_activation_threshold() {
                        state = ThresholdState::LockedIn;
                    }
                }
            }
            ThresholdState::LockedIn => state = ThresholdState::Active,
            ThresholdState::Active | ThresholdState::Failed => {}
        }
        cache.update(node.hash, state);
    }

    Ok(state)
}
