use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::Level;

/// One record kept by the capture ring.
#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub msg: String,
}

struct Ring {
    capacity: usize,
    records: VecDeque<CapturedLog>,
}

/// Bounded FIFO of the most recent records; the oldest falls out once `capacity` is reached.
pub(crate) struct CaptureRing {
    enabled: AtomicBool,
    ring: Mutex<Ring>,
}

impl CaptureRing {
    pub(crate) const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            ring: Mutex::new(Ring {
                capacity: 0,
                records: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enable(&self, capacity: usize) {
        if capacity == 0 {
            self.disable();
            return;
        }
        let mut ring = self.lock();
        ring.capacity = capacity;
        while ring.records.len() > capacity {
            ring.records.pop_front();
        }
        drop(ring);
        self.enabled.store(true, Ordering::Release);
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn push(&self, record: CapturedLog) {
        let mut ring = self.lock();
        if ring.capacity == 0 {
            return;
        }
        if ring.records.len() == ring.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(record);
    }

    pub(crate) fn clear(&self) {
        self.lock().records.clear();
    }

    /// The newest `limit` records, oldest first.
    pub(crate) fn snapshot(&self, limit: usize) -> Vec<CapturedLog> {
        let ring = self.lock();
        let skip = ring.records.len().saturating_sub(limit);
        ring.records.iter().skip(skip).cloned().collect()
    }
}
