//! Network-adjusted time from the median of peer clock offsets.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use btcnode_log::{log_debug, log_warn};

/// Offsets kept; older samples are dropped first.
pub const MAX_MEDIAN_TIME_ENTRIES: usize = 200;
/// Larger median offsets are ignored outright.
const MAX_ALLOWED_OFFSET_SECS: i64 = 70 * 60;
/// A sample this close to local time counts as agreeing with it.
const SIMILAR_TIME_SECS: i64 = 5 * 60;

/// Source of the adjusted time used for timestamp checks.
pub trait TimeSource: Send + Sync {
    /// Local time plus the current offset, in unix seconds.
    fn adjusted_time(&self) -> i64;
    /// Records the time reported by `source_id`. Repeated ids are ignored.
    fn add_time_sample(&self, source_id: &str, time: i64);
    fn offset(&self) -> i64;
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct MedianState {
    known_ids: HashSet<String>,
    offsets: Vec<i64>,
    offset_secs: i64,
    invalid_time_checked: bool,
}

pub struct MedianTimeSource {
    clock: fn() -> i64,
    state: Mutex<MedianState>,
}

impl MedianTimeSource {
    pub fn new() -> Self {
        Self::with_clock(unix_now)
    }

    pub fn with_clock(clock: fn() -> i64) -> Self {
        Self {
            clock,
            state: Mutex::new(MedianState::default()),
        }
    }
}

impl Default for MedianTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MedianTimeSource {
    fn adjusted_time(&self) -> i64 {
        (self.clock)() + self.offset()
    }

    fn add_time_sample(&self, source_id: &str, time: i64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.known_ids.insert(source_id.to_string()) {
            return;
        }

        let offset = time - (self.clock)();
        if state.offsets.len() == MAX_MEDIAN_TIME_ENTRIES {
            state.offsets.remove(0);
        }
        state.offsets.push(offset);
        let count = state.offsets.len();
        log_debug!("Added time sample of {}s (total: {})", offset, count);

        // Only odd sample counts move the offset, matching long-standing behaviour.
        if count < 5 || count % 2 != 1 {
            return;
        }

        let mut sorted = state.offsets.clone();
        sorted.sort_unstable();
        let median = sorted[count / 2];
        if median.abs() < MAX_ALLOWED_OFFSET_SECS {
            state.offset_secs = median;
        } else {
            state.offset_secs = 0;
            if !state.invalid_time_checked {
                state.invalid_time_checked = true;
                let close = sorted.iter().any(|offset| offset.abs() < SIMILAR_TIME_SECS);
                if !close {
                    log_warn!(
                        "Please check your date and time are correct! The node will not work properly with an invalid time"
                    );
                }
            }
        }
        log_debug!("New time offset: {}s", state.offset_secs);
    }

    fn offset(&self) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offset_secs
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedTimeSource {
    now: AtomicI64,
}

impl FixedTimeSource {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::Relaxed);
    }
}

impl TimeSource for FixedTimeSource {
    fn adjusted_time(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }

    fn add_time_sample(&self, _source_id: &str, _time: i64) {}

    fn offset(&self) -> i64 {
        0
    }
}
