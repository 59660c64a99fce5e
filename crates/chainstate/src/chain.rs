//! The chain controller: owns the block index, the best chain view and the
//! persisted chain state, and answers queries about them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

use btcnode_consensus::deployments::ALL_DEPLOYMENTS;
use btcnode_consensus::{hash256_to_hex, Checkpoint, ConsensusParams, DeploymentId, Hash256};
use btcnode_log::{log_info, log_warn};
use btcnode_primitives::block::{Block, BlockHeader};
use btcnode_primitives::genesis::genesis_block;
use btcnode_primitives::outpoint::OutPoint;
use btcnode_primitives::transaction::Transaction;
use btcnode_storage::{Column, KeyValueStore, WriteBatch};

use crate::blockindex::{block_index_key, encode_block_index_value, BlockIndex};
use crate::blocknode::{BlockNode, BlockStatus, NodeAncestry, NodeRef};
use crate::chainio::{
    fetch_best_chain_state, fetch_block, fetch_db_version, fetch_hash_by_height,
    fetch_height_by_hash, fetch_spend_journal, fetch_utxo_entry, load_block_index_records,
    put_best_chain_state, put_block, put_db_version, put_main_chain_index, put_spend_journal,
    put_utxo_view, remove_main_chain_index, remove_spend_journal, BestChainState, DB_VERSION,
};
use crate::chainview::ChainView;
use crate::checkpoints::{is_checkpoint_candidate, latest_checkpoint, CheckpointTracker};
use crate::difficulty;
use crate::error::{assert_error, corruption, ChainError};
use crate::interrupt::Interrupt;
use crate::mediantime::{MedianTimeSource, TimeSource};
use crate::notifications::{Notification, NotificationCallback};
use crate::orphans::OrphanPool;
use crate::sequencelock::{self, SequenceLock};
use crate::spendjournal::{count_spent_outputs, SpentTxOut};
use crate::thresholdstate::{threshold_state, ThresholdState, ThresholdStateCache};
use crate::utxoviewpoint::{UtxoEntry, UtxoViewpoint};
use crate::versionbits::{
    self, deployment_state, new_deployment_caches, new_warning_caches, warn_unknown_rule_activations,
    warn_unknown_versions, BitConditionChecker,
};
use crate::weight::block_weight;

/// A tip older than this is treated as still syncing.
const CURRENT_TIP_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Summary of the best chain tip, replaced wholesale on every tip change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BestState {
    pub hash: Hash256,
    pub height: i32,
    pub bits: u32,
    pub block_size: u64,
    pub block_weight: u64,
    pub num_txns: u64,
    pub total_txns: u64,
    pub median_time: i64,
}

impl BestState {
    fn new(node: &BlockNode, block: &Block, total_txns: u64) -> Self {
        Self {
            hash: node.hash,
            height: node.height,
            bits: node.bits,
            block_size: block.serialized_size() as u64,
            block_weight: block_weight(block) as u64,
            num_txns: block.transactions.len() as u64,
            total_txns,
            median_time: node.calc_past_median_time(),
        }
    }
}

/// Optional indexes maintained alongside the best chain. Writes go into the
/// same batch as the chain state so both move together.
pub trait IndexManager: Send + Sync {
    fn connect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        height: i32,
        stxos: &[SpentTxOut],
    ) -> Result<(), ChainError>;

    fn disconnect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        height: i32,
        stxos: &[SpentTxOut],
    ) -> Result<(), ChainError>;
}

pub struct ChainConfig<S> {
    pub store: Arc<S>,
    pub params: ConsensusParams,
    pub time_source: Arc<dyn TimeSource>,
    pub index_manager: Option<Arc<dyn IndexManager>>,
    pub interrupt: Interrupt,
    pub checkpoints_enabled: bool,
    /// Script verification threads; zero lets rayon pick.
    pub verify_workers: usize,
}

impl<S> ChainConfig<S> {
    pub fn new(store: Arc<S>, params: ConsensusParams) -> Self {
        Self {
            store,
            params,
            time_source: Arc::new(MedianTimeSource::new()),
            index_manager: None,
            interrupt: Interrupt::new(),
            checkpoints_enabled: true,
            verify_workers: 0,
        }
    }
}

/// State that only changes under the chain lock.
pub(crate) struct ChainLockState {
    pub(crate) deployment_caches: Vec<ThresholdStateCache>,
    pub(crate) warning_caches: Vec<ThresholdStateCache>,
    pub(crate) checkpoint_tracker: CheckpointTracker,
    pub(crate) unknown_rules_warned: bool,
    pub(crate) unknown_versions_warned: bool,
    /// Notifications raised while the lock is held, delivered after it is released.
    pub(crate) pending: Vec<Notification>,
}

impl ChainLockState {
    fn new() -> Self {
        Self {
            deployment_caches: new_deployment_caches(),
            warning_caches: new_warning_caches(),
            checkpoint_tracker: CheckpointTracker::new(),
            unknown_rules_warned: false,
            unknown_versions_warned: false,
            pending: Vec::new(),
        }
    }
}

pub struct BlockChain<S> {
    pub(crate) store: Arc<S>,
    pub(crate) params: ConsensusParams,
    pub(crate) checkpoints: Vec<Checkpoint>,
    pub(crate) time_source: Arc<dyn TimeSource>,
    index_manager: Option<Arc<dyn IndexManager>>,
    pub(crate) interrupt: Interrupt,
    pub(crate) script_pool: rayon::ThreadPool,
    chain_lock: RwLock<ChainLockState>,
    pub(crate) index: BlockIndex,
    pub(crate) best_chain: ChainView,
    pub(crate) orphans: Mutex<OrphanPool>,
    state_snapshot: RwLock<Arc<BestState>>,
    subscribers: RwLock<Vec<NotificationCallback>>,
}

impl<S: KeyValueStore> BlockChain<S> {
    /// Opens the chain in `config.store`, creating the genesis state when the
    /// store is empty.
    pub fn new(config: ChainConfig<S>) -> Result<Self, ChainError> {
        let script_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.verify_workers)
            .thread_name(|index| format!("script-verify-{index}"))
            .build()
            .map_err(|err| ChainError::InvalidRequest(format!("script verification pool: {err}")))?;

        let checkpoints = if config.checkpoints_enabled {
            config.params.checkpoints.clone()
        } else {
            Vec::new()
        };
        let genesis = genesis_block(&config.params);
        let placeholder = BestState::new(&BlockNode::new(&genesis.header, None), &genesis, 1);

        let mut chain = Self {
            store: config.store,
            params: config.params,
            checkpoints,
            time_source: config.time_source,
            index_manager: config.index_manager,
            interrupt: config.interrupt,
            script_pool,
            chain_lock: RwLock::new(ChainLockState::new()),
            index: BlockIndex::new(),
            best_chain: ChainView::new(None),
            orphans: Mutex::new(OrphanPool::default()),
            state_snapshot: RwLock::new(Arc::new(placeholder)),
            subscribers: RwLock::new(Vec::new()),
        };
        chain.init_chain_state()?;
        chain.init_threshold_caches()?;

        let best = chain.best_snapshot();
        log_info!(
            "Chain state (height {}, hash {}, totaltx {}, work {})",
            best.height,
            hash256_to_hex(&best.hash),
            best.total_txns,
            chain.tip()?.work_sum
        );
        Ok(chain)
    }

    fn init_chain_state(&mut self) -> Result<(), ChainError> {
        let Some(saved) = fetch_best_chain_state(self.store.as_ref())? else {
            return self.create_chain_state();
        };

        match fetch_db_version(self.store.as_ref())? {
            Some(DB_VERSION) => {}
            Some(version) => {
                return Err(corruption(
                    "database version",
                    format!("found {version}, this node understands {DB_VERSION}"),
                ))
            }
            None => return Err(corruption("database version", "missing")),
        }

        log_info!("Loading block index...");
        let records = load_block_index_records(self.store.as_ref())?;
        let mut index = BlockIndex::new();
        let mut last: Option<NodeRef> = None;
        for (header, status) in records {
            let hash = header.hash();
            let parent = if last.is_none() {
                if hash != self.params.hash_genesis_block {
                    return Err(corruption(
                        "block index",
                        format!("first record {} is not the genesis block", hash256_to_hex(&hash)),
                    ));
                }
                None
            } else {
                let parent = index.lookup_node(&header.prev_block).ok_or_else(|| {
                    corruption(
                        "block index",
                        format!("could not find parent for block {}", hash256_to_hex(&hash)),
                    )
                })?;
                Some(parent)
            };
            let node = Arc::new(BlockNode::new(&header, parent.as_ref()).with_status(status));
            index.add_node_no_lock(Arc::clone(&node));
            last = Some(node);
        }
        self.index = index;

        let tip = self.index.lookup_node(&saved.hash).ok_or_else(|| {
            corruption(
                "best chain state",
                format!("tip {} is not in the block index", hash256_to_hex(&saved.hash)),
            )
        })?;
        self.best_chain.set_tip(Some(&tip));

        // Anything on the best chain has been connected, so it is valid.
        let mut cursor = Some(Arc::clone(&tip));
        while let Some(node) = cursor {
            if !self.index.node_status(&node).known_valid() {
                log_info!(
                    "Block {} ({}) is in the best chain but not marked valid, marking it",
                    hash256_to_hex(&node.hash),
                    node.height
                );
                self.index.set_status_flags(&node, BlockStatus::VALID);
            }
            cursor = node.parent.clone();
        }
        self.index.flush_to_store(self.store.as_ref())?;

        let block = fetch_block(self.store.as_ref(), &tip.hash)?.ok_or_else(|| {
            corruption(
                "best chain state",
                format!("tip block {} is not stored", hash256_to_hex(&tip.hash)),
            )
        })?;
        self.swap_snapshot(BestState::new(&tip, &block, saved.total_txns));
        Ok(())
    }

    fn create_chain_state(&mut self) -> Result<(), ChainError> {
        let genesis = genesis_block(&self.params);
        let status = BlockStatus::DATA_STORED | BlockStatus::VALID;
        let node = Arc::new(BlockNode::new(&genesis.header, None).with_status(status));
        if node.hash != self.params.hash_genesis_block {
            return Err(assert_error(format!(
                "genesis block hash {} does not match the network parameters",
                hash256_to_hex(&node.hash)
            )));
        }

        let mut batch = WriteBatch::new();
        put_db_version(&mut batch);
        batch.put(
            Column::BlockIndex,
            block_index_key(0, &node.hash),
            encode_block_index_value(&genesis.header, status),
        );
        put_main_chain_index(&mut batch, &node.hash, 0);
        put_best_chain_state(
            &mut batch,
            &BestChainState {
                hash: node.hash,
                height: 0,
                total_txns: 1,
                work_sum: node.work_sum,
            },
        );
        put_block(&mut batch, &genesis);
        self.store.write_batch(&batch)?;

        self.index.add_node_no_lock(Arc::clone(&node));
        self.best_chain.set_tip(Some(&node));
        self.swap_snapshot(BestState::new(&node, &genesis, 1));
        log_info!("Created chain state at genesis {}", hash256_to_hex(&node.hash));
        Ok(())
    }

    /// Computes the deployment and warning states for the current tip so the
    /// first blocks after startup do not pay for walking every window.
    fn init_threshold_caches(&self) -> Result<(), ChainError> {
        let mut state = self.lock_chain();
        let state = &mut *state;
        let tip = self.tip()?;
        let prev = tip.parent.as_ref();

        for bit in 0..state.warning_caches.len() {
            let mut checker =
                BitConditionChecker::new(bit as u32, &self.params, &mut state.deployment_caches);
            threshold_state(prev, &mut checker, &mut state.warning_caches[bit])?;
        }
        for id in ALL_DEPLOYMENTS {
            deployment_state(prev, &self.params, id, &mut state.deployment_caches)?;
        }

        if self.is_current() {
            self.warn_unknown(state, &tip)?;
        }
        Ok(())
    }

    fn warn_unknown(&self, state: &mut ChainLockState, node: &NodeRef) -> Result<(), ChainError> {
        warn_unknown_rule_activations(
            node,
            &self.params,
            &mut state.deployment_caches,
            &mut state.warning_caches,
            &mut state.unknown_rules_warned,
        )?;
        warn_unknown_versions(
            node,
            &self.params,
            &mut state.deployment_caches,
            &mut state.unknown_versions_warned,
        )
    }

    pub(crate) fn lock_chain(&self) -> RwLockWriteGuard<'_, ChainLockState> {
        self.chain_lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_orphans(&self) -> MutexGuard<'_, OrphanPool> {
        self.orphans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tip(&self) -> Result<NodeRef, ChainError> {
        self.best_chain
            .tip()
            .ok_or_else(|| assert_error("best chain has no tip"))
    }

    fn swap_snapshot(&self, best: BestState) {
        *self
            .state_snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(best);
    }

    pub(crate) fn find_previous_checkpoint(
        &self,
        state: &mut ChainLockState,
    ) -> Result<Option<NodeRef>, ChainError> {
        state
            .checkpoint_tracker
            .find_previous(&self.checkpoints, &self.index, &self.best_chain)
    }

    pub(crate) fn flush_index(&self) {
        if let Err(err) = self.index.flush_to_store(self.store.as_ref()) {
            log_warn!("Error flushing block index changes to disk: {}", err);
        }
    }

    /// Delivers queued notifications. Must be called without the chain lock held.
    pub(crate) fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for notification in &notifications {
            for callback in subscribers.iter() {
                callback(notification);
            }
        }
    }

    /// Makes `node` the new tip. `view` must already hold the spends of `block`
    /// and `stxos` every output it spent.
    pub(crate) fn connect_block(
        &self,
        state: &mut ChainLockState,
        node: &NodeRef,
        block: &Arc<Block>,
        view: &mut UtxoViewpoint,
        stxos: &[SpentTxOut],
    ) -> Result<(), ChainError> {
        let tip = self.tip()?;
        if block.header.prev_block != tip.hash {
            return Err(assert_error(
                "connect_block must be called with a block that extends the main chain",
            ));
        }
        if stxos.len() != count_spent_outputs(block) {
            return Err(assert_error(format!(
                "connect_block called with {} spent outputs, block spends {}",
                stxos.len(),
                count_spent_outputs(block)
            )));
        }

        if self.is_current() {
            self.warn_unknown(state, node)?;
        }

        self.flush_index();

        let num_txns = block.transactions.len() as u64;
        let total_txns = self.best_snapshot().total_txns + num_txns;
        let best = BestState::new(node, block, total_txns);

        let mut batch = WriteBatch::new();
        put_best_chain_state(
            &mut batch,
            &BestChainState {
                hash: node.hash,
                height: node.height as u32,
                total_txns,
                work_sum: node.work_sum,
            },
        );
        put_main_chain_index(&mut batch, &node.hash, node.height);
        put_utxo_view(&mut batch, view);
        put_spend_journal(&mut batch, &node.hash, stxos);
        if let Some(manager) = &self.index_manager {
            manager.connect_block(&mut batch, block, node.height, stxos)?;
        }
        self.store.write_batch(&batch)?;

        view.commit();
        self.best_chain.set_tip(Some(node));
        self.swap_snapshot(best);
        state
            .pending
            .push(Notification::BlockConnected(Arc::clone(block)));
        Ok(())
    }

    /// Removes the tip `node`. `view` must already hold the undo of `block`.
    pub(crate) fn disconnect_block(
        &self,
        state: &mut ChainLockState,
        node: &NodeRef,
        block: &Arc<Block>,
        view: &mut UtxoViewpoint,
    ) -> Result<(), ChainError> {
        let tip = self.tip()?;
        if node.hash != tip.hash {
            return Err(assert_error(
                "disconnect_block must be called with the block at the end of the main chain",
            ));
        }
        let Some(prev) = node.parent.as_ref() else {
            return Err(assert_error("cannot disconnect the genesis block"));
        };
        let prev_block = fetch_block(self.store.as_ref(), &prev.hash)?.ok_or_else(|| {
            corruption(
                "disconnect",
                format!("parent block {} is not stored", hash256_to_hex(&prev.hash)),
            )
        })?;

        self.flush_index();

        let total_txns = self
            .best_snapshot()
            .total_txns
            .saturating_sub(block.transactions.len() as u64);
        let best = BestState::new(prev, &prev_block, total_txns);

        let stxos = fetch_spend_journal(self.store.as_ref(), block)?;
        let mut batch = WriteBatch::new();
        put_best_chain_state(
            &mut batch,
            &BestChainState {
                hash: prev.hash,
                height: prev.height as u32,
                total_txns,
                work_sum: prev.work_sum,
            },
        );
        remove_main_chain_index(&mut batch, &node.hash, node.height);
        put_utxo_view(&mut batch, view);
        remove_spend_journal(&mut batch, &node.hash);
        if let Some(manager) = &self.index_manager {
            manager.disconnect_block(&mut batch, block, node.height, &stxos)?;
        }
        self.store.write_batch(&batch)?;

        view.commit();
        self.best_chain.set_tip(Some(prev));
        self.swap_snapshot(best);
        state
            .pending
            .push(Notification::BlockDisconnected(Arc::clone(block)));
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn subscribe(&self, callback: NotificationCallback) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub fn best_snapshot(&self) -> Arc<BestState> {
        Arc::clone(
            &self
                .state_snapshot
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Whether the chain appears synced: past the newest checkpoint and with a
    /// tip no older than a day by adjusted time.
    pub fn is_current(&self) -> bool {
        let Some(tip) = self.best_chain.tip() else {
            return false;
        };
        if let Some(checkpoint) = latest_checkpoint(&self.checkpoints) {
            if tip.height < checkpoint.height {
                return false;
            }
        }
        let min_time = self.time_source.adjusted_time() - CURRENT_TIP_MAX_AGE_SECS;
        i64::from(tip.timestamp) >= min_time
    }

    /// Known in the block index on any branch, or waiting as an orphan.
    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.index.have_block(hash) || self.is_known_orphan(hash)
    }

    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.lock_orphans().is_known(hash)
    }

    pub fn get_orphan_root(&self, hash: &Hash256) -> Hash256 {
        self.lock_orphans().orphan_root(hash)
    }

    pub fn fetch_header(&self, hash: &Hash256) -> Result<BlockHeader, ChainError> {
        self.index
            .lookup_node(hash)
            .map(|node| node.header())
            .ok_or_else(|| {
                ChainError::InvalidRequest(format!("block {} is not known", hash256_to_hex(hash)))
            })
    }

    pub fn main_chain_has_block(&self, hash: &Hash256) -> bool {
        self.index
            .lookup_node(hash)
            .is_some_and(|node| self.best_chain.contains(&node))
    }

    /// Locator starting at `hash`, or at the tip when the hash is unknown.
    pub fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256> {
        let node = self.index.lookup_node(hash);
        self.best_chain.block_locator(node.as_ref())
    }

    pub fn latest_block_locator(&self) -> Vec<Hash256> {
        self.best_chain.block_locator(None)
    }

    /// Height of `hash` on the main chain.
    pub fn block_height_by_hash(&self, hash: &Hash256) -> Result<i32, ChainError> {
        match self.index.lookup_node(hash) {
            Some(node) if self.best_chain.contains(&node) => Ok(node.height),
            _ => fetch_height_by_hash(self.store.as_ref(), hash)?.ok_or_else(|| {
                ChainError::InvalidRequest(format!(
                    "block {} is not in the main chain",
                    hash256_to_hex(hash)
                ))
            }),
        }
    }

    pub fn block_hash_by_height(&self, height: i32) -> Result<Hash256, ChainError> {
        if let Some(node) = self.best_chain.node_by_height(height) {
            return Ok(node.hash);
        }
        fetch_hash_by_height(self.store.as_ref(), height)?.ok_or_else(|| {
            ChainError::InvalidRequest(format!("no block at height {height} exists"))
        })
    }

    /// Main-chain hashes for heights `start..end`. `end` past the tip is
    /// clamped; a start past the tip yields nothing.
    pub fn height_range(&self, start: i32, end: i32) -> Result<Vec<Hash256>, ChainError> {
        if start < 0 {
            return Err(ChainError::InvalidRequest(format!(
                "start height of fetch range must not be less than zero - got {start}"
            )));
        }
        if end < start {
            return Err(ChainError::InvalidRequest(format!(
                "end height of fetch range must not be less than the start height - got start {start}, end {end}"
            )));
        }

        let tip_height = self.best_chain.height();
        if start == end || start > tip_height {
            return Ok(Vec::new());
        }
        let end = end.min(tip_height + 1);

        let mut hashes = Vec::with_capacity((end - start) as usize);
        for height in start..end {
            let node = self.best_chain.node_by_height(height).ok_or_else(|| {
                assert_error(format!("main chain is missing height {height}"))
            })?;
            hashes.push(node.hash);
        }
        Ok(hashes)
    }

    /// Hashes from `start_height` through the block `end_hash`, on whichever
    /// branch that block is on.
    pub fn height_to_hash_range(
        &self,
        start_height: i32,
        end_hash: &Hash256,
        max_results: usize,
    ) -> Result<Vec<Hash256>, ChainError> {
        let end = self.index.lookup_node(end_hash).ok_or_else(|| {
            ChainError::InvalidRequest(format!("no known block header with hash {}", hash256_to_hex(end_hash)))
        })?;
        if !self.index.node_status(&end).known_valid() {
            return Err(ChainError::InvalidRequest(format!(
                "block {} is not yet validated",
                hash256_to_hex(end_hash)
            )));
        }
        if start_height < 0 {
            return Err(ChainError::InvalidRequest(format!(
                "start height ({start_height}) is below 0"
            )));
        }
        if start_height > end.height {
            return Err(ChainError::InvalidRequest(format!(
                "start height ({start_height}) is past end height ({})",
                end.height
            )));
        }
        let count = (end.height - start_height + 1) as usize;
        if count > max_results {
            return Err(ChainError::InvalidRequest(format!(
                "number of results ({count}) would exceed max ({max_results})"
            )));
        }

        let mut hashes = vec![[0u8; 32]; count];
        let mut cursor = Some(end);
        for slot in hashes.iter_mut().rev() {
            let node = cursor.ok_or_else(|| assert_error("branch ended before the start height"))?;
            *slot = node.hash;
            cursor = node.parent.clone();
        }
        Ok(hashes)
    }

    /// Hashes at every multiple of `interval` up to `end_hash`.
    pub fn interval_block_hashes(
        &self,
        end_hash: &Hash256,
        interval: i32,
    ) -> Result<Vec<Hash256>, ChainError> {
        if interval <= 0 {
            return Err(ChainError::InvalidRequest(format!(
                "interval must be positive - got {interval}"
            )));
        }
        let end = self.index.lookup_node(end_hash).ok_or_else(|| {
            ChainError::InvalidRequest(format!("no known block header with hash {}", hash256_to_hex(end_hash)))
        })?;
        if !self.index.node_status(&end).known_valid() {
            return Err(ChainError::InvalidRequest(format!(
                "block {} is not yet validated",
                hash256_to_hex(end_hash)
            )));
        }

        let count = end.height / interval;
        let mut hashes = Vec::with_capacity(count as usize);
        for step in 1..=count {
            let node = end.ancestor(step * interval).ok_or_else(|| {
                assert_error(format!("missing ancestor at height {}", step * interval))
            })?;
            hashes.push(node.hash);
        }
        Ok(hashes)
    }

    /// Relative lock of `tx` if mined in the block after the tip. With
    /// `mempool` set the lock is evaluated even before CSV activates.
    pub fn calc_sequence_lock(
        &self,
        tx: &Transaction,
        view: &UtxoViewpoint,
        mempool: bool,
    ) -> Result<SequenceLock, ChainError> {
        let mut state = self.lock_chain();
        let tip = self.tip()?;
        let csv_active = mempool
            || deployment_state(
                Some(&tip),
                &self.params,
                DeploymentId::Csv,
                &mut state.deployment_caches,
            )? == ThresholdState::Active;
        sequencelock::calc_sequence_lock(&tip, tx, view, csv_active)
    }

    /// State of deployment `id` for the block after the tip.
    pub fn threshold_state(&self, id: DeploymentId) -> Result<ThresholdState, ChainError> {
        let mut state = self.lock_chain();
        let tip = self.tip()?;
        deployment_state(Some(&tip), &self.params, id, &mut state.deployment_caches)
    }

    pub fn is_deployment_active(&self, id: DeploymentId) -> Result<bool, ChainError> {
        Ok(self.threshold_state(id)? == ThresholdState::Active)
    }

    pub fn calc_next_block_version(&self) -> Result<i32, ChainError> {
        let mut state = self.lock_chain();
        let tip = self.tip()?;
        versionbits::calc_next_block_version(Some(&tip), &self.params, &mut state.deployment_caches)
    }

    /// Bits required of a block on the tip with the given timestamp.
    pub fn calc_next_required_difficulty(&self, timestamp: i64) -> Result<u32, ChainError> {
        let _state = self.lock_chain();
        let tip = self.tip()?;
        difficulty::calc_next_required_difficulty(Some(&tip), timestamp, &self.params)
    }

    /// View holding the outputs of `tx` and the outputs it spends, as the
    /// main chain currently sees them.
    pub fn fetch_utxo_view(&self, tx: &Transaction) -> Result<UtxoViewpoint, ChainError> {
        let _state = self.lock_chain();
        let txid = tx.txid();
        let mut needed: HashSet<OutPoint> = (0..tx.vout.len())
            .map(|index| OutPoint::new(txid, index as u32))
            .collect();
        if !tx.is_coinbase() {
            needed.extend(tx.vin.iter().map(|input| input.prevout));
        }

        let mut view = UtxoViewpoint::new();
        view.fetch_utxos_main(self.store.as_ref(), &needed)?;
        view.set_best_hash(self.best_snapshot().hash);
        Ok(view)
    }

    pub fn fetch_utxo_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
        let _state = self.lock_chain();
        fetch_utxo_entry(self.store.as_ref(), outpoint)
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        latest_checkpoint(&self.checkpoints)
    }

    pub fn is_checkpoint_candidate(&self, block: &Block) -> bool {
        let _state = self.lock_chain();
        let node = self.index.lookup_node(&block.hash());
        is_checkpoint_candidate(&self.best_chain, node.as_ref(), block)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Block, ChainError> {
        fetch_block(self.store.as_ref(), hash)?.ok_or_else(|| {
            ChainError::InvalidRequest(format!("block {} is not stored", hash256_to_hex(hash)))
        })
    }

    pub fn block_by_height(&self, height: i32) -> Result<Block, ChainError> {
        let hash = self.block_hash_by_height(height)?;
        self.block_by_hash(&hash)
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }
}
