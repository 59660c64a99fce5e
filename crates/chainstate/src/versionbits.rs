//! Version-bits signalling: known deployments and warnings about unknown ones.

use btcnode_consensus::constants::{
    VERSIONBITS_NUM_BITS, VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK,
};
use btcnode_consensus::deployments::ALL_DEPLOYMENTS;
use btcnode_consensus::{ConsensusParams, Deployment, DeploymentId};
use btcnode_log::log_warn;

use crate::blocknode::NodeRef;
use crate::error::ChainError;
use crate::thresholdstate::{threshold_state, ThresholdConditionChecker, ThresholdState, ThresholdStateCache};

/// Blocks inspected for unexpected version bits.
const UNKNOWN_VER_NUM_TO_CHECK: usize = 100;
/// More upgraded blocks than this among the inspected ones triggers a warning.
const UNKNOWN_VER_WARN_NUM: usize = UNKNOWN_VER_NUM_TO_CHECK / 2;

fn signals_bit(version: i32, bit: u32) -> bool {
    let version = version as u32;
    version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS && version & (1u32 << bit) != 0
}

/// Votes for one defined deployment.
pub struct DeploymentChecker<'a> {
    deployment: &'a Deployment,
    params: &'a ConsensusParams,
}

impl<'a> DeploymentChecker<'a> {
    pub fn new(deployment: &'a Deployment, params: &'a ConsensusParams) -> Self {
        Self { deployment, params }
    }
}

impl ThresholdConditionChecker for DeploymentChecker<'_> {
    fn begin_time(&self) -> u64 {
        self.deployment.start_time
    }

    fn end_time(&self) -> u64 {
        self.deployment.expire_time
    }

    fn rule_change_activation_threshold(&self) -> u32 {
        self.params.rule_change_activation_threshold
    }

    fn miner_confirmation_window(&self) -> u32 {
        self.params.miner_confirmation_window
    }

    fn condition(&mut self, node: &NodeRef) -> Result<bool, ChainError> {
        Ok(signals_bit(node.version, u32::from(self.deployment.bit_number)))
    }
}

/// Votes for a bit this node has no deployment for: a block counts when it sets
/// the bit although the known deployments did not expect it.
pub struct BitConditionChecker<'a> {
    bit: u32,
    params: &'a ConsensusParams,
    deployment_caches: &'a mut [ThresholdStateCache],
}

impl<'a> BitConditionChecker<'a> {
    pub fn new(
        bit: u32,
        params: &'a ConsensusParams,
        deployment_caches: &'a mut [ThresholdStateCache],
    ) -> Self {
        Self {
            bit,
            params,
            deployment_caches,
        }
    }
}

impl ThresholdConditionChecker for BitConditionChecker<'_> {
    fn begin_time(&self) -> u64 {
        0
    }

    fn end_time(&self) -> u64 {
        u64::MAX
    }

    fn rule_change_activation_threshold(&self) -> u32 {
        self.params.rule_change_activation_threshold
    }

    fn miner_confirmation_window(&self) -> u32 {
        self.params.miner_confirmation_window
    }

    fn condition(&mut self, node: &NodeRef) -> Result<bool, ChainError> {
        if !signals_bit(node.version, self.bit) {
            return Ok(false);
        }
        let expected =
            calc_next_block_version(node.parent.as_ref(), self.params, self.deployment_caches)?;
        Ok(expected as u32 & (1u32 << self.bit) == 0)
    }
}

/// State of deployment `id` for the block after `prev`.
pub fn deployment_state(
    prev: Option<&NodeRef>,
    params: &ConsensusParams,
    id: DeploymentId,
    deployment_caches: &mut [ThresholdStateCache],
) -> Result<ThresholdState, ChainError> {
    let mut checker = DeploymentChecker::new(params.deployment(id), params);
    threshold_state(prev, &mut checker, &mut deployment_caches[id.as_usize()])
}

/// Version a block built on `prev` should carry: the top bits plus every
/// deployment that is started or locked in.
pub fn calc_next_block_version(
    prev: Option<&NodeRef>,
    params: &ConsensusParams,
    deployment_caches: &mut [ThresholdStateCache],
) -> Result<i32, ChainError> {
    let mut expected = VERSIONBITS_TOP_BITS;
    for id in ALL_DEPLOYMENTS {
        let state = deployment_state(prev, params, id, deployment_caches)?;
        if matches!(state, ThresholdState::Started | ThresholdState::LockedIn) {
            expected |= 1u32 << params.deployment(id).bit_number;
        }
    }
    Ok(expected as i32)
}

/// Warns when a bit with no known deployment locks in or activates.
pub fn warn_unknown_rule_activations(
    node: &NodeRef,
    params: &ConsensusParams,
    deployment_caches: &mut [ThresholdStateCache],
    warning_caches: &mut [ThresholdStateCache],
    rules_warned: &mut bool,
) -> Result<(), ChainError> {
    for bit in 0..VERSIONBITS_NUM_BITS {
        let mut checker = BitConditionChecker::new(bit, params, deployment_caches);
        let state = threshold_state(
            node.parent.as_ref(),
            &mut checker,
            &mut warning_caches[bit as usize],
        )?;
        match state {
            ThresholdState::Active => {
                if !*rules_warned {
                    log_warn!("Unknown new rules activated (bit {})", bit);
                    *rules_warned = true;
                }
            }
            ThresholdState::LockedIn => {
                let window = params.miner_confirmation_window as i32;
                let remaining = window - node.height % window;
                log_warn!(
                    "Unknown new rules are about to activate in {} blocks (bit {})",
                    remaining,
                    bit
                );
            }
            _ => {}
        }
    }
    Ok(())
}

/// Warns once when most recent blocks carry version bits this node does not expect.
pub fn warn_unknown_versions(
    node: &NodeRef,
    params: &ConsensusParams,
    deployment_caches: &mut [ThresholdStateCache],
    versions_warned: &mut bool,
) -> Result<(), ChainError> {
    if *versions_warned {
        return Ok(());
    }
    let upgraded = count_unknown_versions(node, params, deployment_caches)?;
    if upgraded > UNKNOWN_VER_WARN_NUM {
        log_warn!(
            "Unknown block versions are being mined, so new rules might be in effect. Are you running the latest version of the software?"
        );
        *versions_warned = true;
    }
    Ok(())
}

fn count_unknown_versions(
    node: &NodeRef,
    params: &ConsensusParams,
    deployment_caches: &mut [ThresholdStateCache],
) -> Result<usize, ChainError> {
    let mut upgraded = 0;
    let mut cursor = Some(std::sync::Arc::clone(node));
    for _ in 0..UNKNOWN_VER_NUM_TO_CHECK {
        let Some(current) = cursor else {
            break;
        };
        let expected = calc_next_block_version(current.parent.as_ref(), params, deployment_caches)?;
        if current.version & !expected != 0 {
            upgraded += 1;
        }
        cursor = current.parent.clone();
    }
    Ok(upgraded)
}

/// One empty cache per defined deployment.
pub fn new_deployment_caches() -> Vec<ThresholdStateCache> {
    ALL_DEPLOYMENTS
        .iter()
        .map(|_| ThresholdStateCache::new())
        .collect()
}

/// One empty cache per signalling bit.
pub fn new_warning_caches() -> Vec<ThresholdStateCache> {
    (0..VERSIONBITS_NUM_BITS)
        .map(|_| ThresholdStateCache::new())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocknode::BlockNode;
    use btcnode_consensus::{consensus_params, Network};
    use btcnode_primitives::block::BlockHeader;
    use std::sync::Arc;

    fn small_window_params() -> ConsensusParams {
        let mut params = consensus_params(Network::Regtest);
        params.miner_confirmation_window = 10;
        params.rule_change_activation_threshold = 8;
        params
    }

    fn chain_with_versions(versions: impl Fn(usize) -> i32, len: usize) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = Vec::with_capacity(len);
        for i in 0..len {
            let prev = nodes.last();
            let header = BlockHeader {
                version: versions(i),
                prev_block: prev.map(|node| node.hash).unwrap_or([0u8; 32]),
                merkle_root: [0u8; 32],
                time: 1_600_000_000 + i as u32 * 600,
                bits: 0x207f_ffff,
                nonce: i as u32,
            };
            let node = Arc::new(BlockNode::new(&header, prev));
            nodes.push(node);
        }
        nodes
    }

    #[test]
    fn deployment_checker_needs_top_bits() {
        let params = small_window_params();
        let deployment = params.deployment(DeploymentId::Csv);
        let mut checker = DeploymentChecker::new(deployment, &params);
        let nodes = chain_with_versions(|i| [0x2000_0001, 0x0000_0001, 0x2000_0002][i], 3);
        assert!(checker.condition(&nodes[0]).expect("condition"));
        assert!(!checker.condition(&nodes[1]).expect("condition"));
        assert!(!checker.condition(&nodes[2]).expect("condition"));
    }

    #[test]
    fn next_version_signals_started_deployments() {
        let params = small_window_params();
        let mut caches = new_deployment_caches();
        let nodes = chain_with_versions(|_| VERSIONBITS_TOP_BITS as i32, 25);

        // Regtest deployments start at time zero: defined during the first window.
        let version = calc_next_block_version(Some(&nodes[5]), &params, &mut caches)
            .expect("version");
        assert_eq!(version as u32, VERSIONBITS_TOP_BITS);

        let version = calc_next_block_version(Some(&nodes[9]), &params, &mut caches)
            .expect("version");
        let csv = 1u32 << params.deployment(DeploymentId::Csv).bit_number;
        let segwit = 1u32 << params.deployment(DeploymentId::Segwit).bit_number;
        let dummy = 1u32 << params.deployment(DeploymentId::TestDummy).bit_number;
        assert_eq!(version as u32, VERSIONBITS_TOP_BITS | csv | segwit | dummy);
    }

    #[test]
    fn csv_activates_after_signalling() {
        let params = small_window_params();
        let mut caches = new_deployment_caches();
        let nodes = chain_with_versions(|_| 0x2000_0003, 30);
        assert_eq!(
            deployment_state(Some(&nodes[9]), &params, DeploymentId::Csv, &mut caches)
                .expect("state"),
            ThresholdState::Started
        );
        assert_eq!(
            deployment_state(Some(&nodes[19]), &params, DeploymentId::Csv, &mut caches)
                .expect("state"),
            ThresholdState::LockedIn
        );
        assert_eq!(
            deployment_state(Some(&nodes[29]), &params, DeploymentId::Segwit, &mut caches)
                .expect("state"),
            ThresholdState::Active
        );
        // Nobody signalled bit 28.
        assert_eq!(
            deployment_state(Some(&nodes[29]), &params, DeploymentId::TestDummy, &mut caches)
                .expect("state"),
            ThresholdState::Started
        );
    }

    #[test]
    fn unknown_bits_are_counted() {
        let params = small_window_params();
        let mut caches = new_deployment_caches();
        // Bit 5 belongs to no deployment.
        let nodes = chain_with_versions(|_| 0x2000_0020, 120);
        let upgraded = count_unknown_versions(&nodes[119], &params, &mut caches).expect("count");
        assert_eq!(upgraded, UNKNOWN_VER_NUM_TO_CHECK);

        let mut warned = false;
        warn_unknown_versions(&nodes[119], &params, &mut caches, &mut warned).expect("warn");
        assert!(warned);

        let plain = chain_with_versions(|_| VERSIONBITS_TOP_BITS as i32, 20);
        assert_eq!(count_unknown_versions(&plain[19], &params, &mut caches).expect("count"), 0);
    }

    #[test]
    fn unknown_rule_activation_is_tracked() {
        let params = small_window_params();
        let mut caches = new_deployment_caches();
        let mut warnings = new_warning_caches();
        let nodes = chain_with_versions(|_| 0x2000_0020, 40);

        let mut warned = false;
        warn_unknown_rule_activations(&nodes[39], &params, &mut caches, &mut warnings, &mut warned)
            .expect("warn");
        assert!(warned);

        let mut checker = BitConditionChecker::new(5, &params, &mut caches);
        let state = threshold_state(Some(&nodes[38]), &mut checker, &mut warnings[5])
            .expect("state");
        assert_eq!(state, ThresholdState::Active);

        let mut checker = BitConditionChecker::new(0, &params, &mut caches);
        assert!(!checker.condition(&nodes[20]).expect("condition"));
    }
}
