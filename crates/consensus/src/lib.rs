//! Consensus constants, parameters, and deployment schedule.

pub mod constants;
pub mod deployments;
pub mod hash;
pub mod money;
pub mod params;

pub use deployments::{Deployment, DeploymentId, DEFINED_DEPLOYMENTS};
pub use hash::{hash256_from_hex, hash256_to_hex, Hash256, HexError};
pub use money::{block_subsidy, money_range, Amount, COIN, MAX_MONEY};
pub use params::{chain_params, consensus_params, ChainParams, Checkpoint, ConsensusParams, Network};
