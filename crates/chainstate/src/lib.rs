//! Chain state: block index, best chain selection, UTXO set and the
//! consensus rules that guard them.

pub mod blockindex;
pub mod blocknode;
mod chain;
pub mod chainio;
pub mod chainview;
pub mod checkpoints;
pub mod compress;
pub mod difficulty;
pub mod error;
pub mod interrupt;
pub mod mediantime;
pub mod merkle;
pub mod notifications;
pub mod orphans;
mod process;
pub mod scriptval;
pub mod sequencelock;
pub mod spendjournal;
pub mod thresholdstate;
pub mod utxoviewpoint;
pub mod validate;
pub mod versionbits;
pub mod weight;

pub use blocknode::{BlockNode, BlockStatus, NodeRef};
pub use chain::{BestState, BlockChain, ChainConfig, IndexManager};
pub use error::{ChainError, ErrorCode, RuleError};
pub use interrupt::Interrupt;
pub use mediantime::{FixedTimeSource, MedianTimeSource, TimeSource};
pub use notifications::{Notification, NotificationCallback};
pub use sequencelock::SequenceLock;
pub use spendjournal::SpentTxOut;
pub use thresholdstate::ThresholdState;
pub use utxoviewpoint::{UtxoEntry, UtxoViewpoint};
pub use validate::BehaviorFlags;
