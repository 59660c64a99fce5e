//! Cooperative cancellation shared between the node and long-running chain work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ChainError;

#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing flag, e.g. one a signal handler sets.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(ChainError::Interrupted)` once a stop was requested.
    pub fn check(&self) -> Result<(), ChainError> {
        if self.is_requested() {
            return Err(ChainError::Interrupted);
        }
        Ok(())
    }
}
