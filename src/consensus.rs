//! Consensus driver: the block-production loop.
//!
//! One logical task per node. Each slot it derives a selection seed from
//! the chain tip, asks the registry for the proposer, and either
//! produces a block itself (draining the mempool) or waits for the
//! chosen proposer's block with a timeout. Timeouts record a miss and
//! reselect with an evolved seed so every node converges on the same
//! fallback proposer. Cancellation happens between transitions; no
//! partial block is ever appended.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block::Block;
use crate::constants::consensus as consts;
use crate::crypto::{self, Keypair, DOMAIN_SELECTION};
use crate::error::{NodeError, NodeResult};
use crate::mempool::Mempool;
use crate::registry::ValidatorRegistry;
use crate::state::StateMachine;
use crate::store::BlockStore;
use crate::types::{now_ms, Hash256};
use crate::validator::Validator;

/// Producer-loop phases, mirrored in logs for operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverPhase {
    Idle,
    SelectingProposer,
    Producing,
    Waiting,
    Applying,
    MissRecorded,
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub block_time_ms: u64,
    pub proposer_timeout_ms: u64,
    pub max_block_bytes: usize,
    pub max_block_txs: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            block_time_ms: consts::TARGET_BLOCK_TIME_MS,
            proposer_timeout_ms: consts::PROPOSER_TIMEOUT_MS,
            max_block_bytes: consts::MAX_BLOCK_BYTES,
            max_block_txs: consts::MAX_BLOCK_TXS,
        }
    }
}

/// How many consecutive forfeited slots are retried before the driver
/// goes back to idle and waits for the next tick.
const MAX_SELECTION_ATTEMPTS: u32 = 8;

pub struct ConsensusDriver {
    state: Arc<StateMachine>,
    registry: Arc<ValidatorRegistry>,
    mempool: Arc<Mempool>,
    store: Arc<BlockStore>,
    /// Signing key when this node runs a validator
    local_key: Option<Keypair>,
    config: DriverConfig,
    /// Seam for the out-of-scope P2P layer: externally received blocks
    /// are injected here.
    external_blocks: mpsc::Receiver<Block>,
    cancel: CancellationToken,
    phase: DriverPhase,
}

impl ConsensusDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateMachine>,
        registry: Arc<ValidatorRegistry>,
        mempool: Arc<Mempool>,
        store: Arc<BlockStore>,
        local_key: Option<Keypair>,
        config: DriverConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<Block>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                state,
                registry,
                mempool,
                store,
                local_key,
                config,
                external_blocks: rx,
                cancel,
                phase: DriverPhase::Idle,
            },
            tx,
        )
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    /// Run until cancelled. Returns an error only on a fatal store
    /// failure, in which case the caller must halt the process rather
    /// than risk a corrupted chain.
    pub async fn run(mut self) -> NodeResult<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.block_time_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "⚙️  Consensus driver started (block time {} ms)",
            self.config.block_time_ms
        );

        loop {
            self.phase = DriverPhase::Idle;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("🛑 Consensus driver stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.run_slot().await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            error!("💀 Fatal store error, halting writer: {e}");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!("Slot failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// One slot: select → produce | wait → apply → account.
    pub async fn run_slot(&mut self) -> NodeResult<()> {
        if !self.state.genesis_applied().await {
            debug!("Genesis not applied yet; slot skipped");
            return Ok(());
        }

        let mut seed = self.state.last_block_hash().await;
        for attempt in 0..MAX_SELECTION_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.phase = DriverPhase::SelectingProposer;
            let now = now_ms();
            let Some(proposer) = self.registry.select_proposer(&seed, now).await else {
                debug!("No eligible validators; slot idle");
                return Ok(());
            };

            let is_local = self
                .local_key
                .as_ref()
                .is_some_and(|k| k.address() == proposer.address);

            if is_local {
                self.phase = DriverPhase::Producing;
                let block = self.produce_block(&proposer).await?;
                self.phase = DriverPhase::Applying;
                self.commit_block(&block).await?;
                return Ok(());
            }

            self.phase = DriverPhase::Waiting;
            let wait = Duration::from_millis(self.config.proposer_timeout_ms);
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = timeout(wait, self.external_blocks.recv()) => r,
            };

            match received {
                Ok(Some(block)) => {
                    if block.validator_address != proposer.address {
                        warn!(
                            "Rejected block {}: proposer {} was not selected",
                            hex::encode(block.hash),
                            block.validator_address
                        );
                        continue;
                    }
                    if !block.verify_signature(&proposer.public_key) {
                        warn!(
                            "Rejected block {}: bad proposer signature",
                            hex::encode(block.hash)
                        );
                        continue;
                    }
                    self.phase = DriverPhase::Applying;
                    self.commit_block(&block).await?;
                    return Ok(());
                }
                Ok(None) => {
                    // Injection channel closed; nothing more will arrive.
                    return Ok(());
                }
                Err(_) => {
                    self.phase = DriverPhase::MissRecorded;
                    info!(
                        "⏱️  Proposer {} forfeited its slot (attempt {})",
                        proposer.address,
                        attempt + 1
                    );
                    self.registry.record_missed(&proposer.address, now_ms()).await;
                    self.registry
                        .apply_reputation(&proposer.address, false)
                        .await;
                    // Evolve the seed deterministically so all observers
                    // reselect the same fallback proposer.
                    let mut material = seed.to_vec();
                    material.push(attempt as u8);
                    seed = crypto::hash256(DOMAIN_SELECTION, &material);
                }
            }
        }

        warn!("Slot abandoned after {MAX_SELECTION_ATTEMPTS} forfeits");
        Ok(())
    }

    /// Drain the mempool and assemble a signed candidate block.
    async fn produce_block(&self, proposer: &Validator) -> NodeResult<Block> {
        let key = self.local_key.as_ref().ok_or_else(|| {
            NodeError::Crypto("producing without a local signing key".to_string())
        })?;

        let txs = self
            .mempool
            .take(self.config.max_block_txs, self.config.max_block_bytes);
        let height = self.state.current_height().await + 1;
        let prev_hash = self.state.last_block_hash().await;
        let reward = self.state.next_block_reward().await;

        // Timestamp must strictly exceed the parent's even if the clock
        // stalled.
        let parent_ts = self
            .store
            .get_by_height(height - 1)?
            .map(|b| b.timestamp)
            .unwrap_or(0);
        let timestamp = now_ms().max(parent_ts + 1);

        let mut block = Block::new(
            height,
            prev_hash,
            timestamp,
            txs,
            proposer.address.clone(),
            reward,
        );
        block.sign(key);
        debug!(
            "🧱 Produced candidate block {} with {} tx",
            height,
            block.transactions.len()
        );
        Ok(block)
    }

    /// Apply, persist, and account for an accepted block. A validation
    /// rejection restores state and is logged with the offending hash; a
    /// store failure is fatal.
    async fn commit_block(&self, block: &Block) -> NodeResult<()> {
        // Structural validation against the stored parent (linkage plus
        // timestamp monotonicity); apply_block re-checks the state legs.
        if block.height > 0 {
            if let Some(parent) = self.store.get_by_height(block.height - 1)? {
                if let Err(e) = block.validate_against(&parent, now_ms()) {
                    warn!(
                        "Rejected block {} at height {}: {} ({})",
                        hex::encode(block.hash),
                        block.height,
                        e,
                        e.kind()
                    );
                    return Err(e);
                }
            }
        }

        let receipt = match self.state.apply_block(block).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    "Rejected block {} at height {}: {} ({})",
                    hex::encode(block.hash),
                    block.height,
                    e,
                    e.kind()
                );
                return Err(e);
            }
        };

        self.store.add_block(block)?;

        let now = now_ms();
        self.registry
            .record_produced(&block.validator_address, now)
            .await;
        self.registry
            .apply_reputation(&block.validator_address, true)
            .await;

        let included: Vec<Hash256> = block.transactions.iter().map(|tx| tx.hash).collect();
        self.mempool.remove_included(&included);

        info!(
            "✅ Block {} committed ({} tx, {} sats fees)",
            receipt.height, receipt.transactions, receipt.fees
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::genesis::GenesisConfig;
    use crate::events::EventBus;
    use crate::mempool::MempoolLimits;
    use crate::state::RegistrationPayload;
    use crate::types::Transaction;

    struct Harness {
        driver: ConsensusDriver,
        injector: mpsc::Sender<Block>,
        state: Arc<StateMachine>,
        registry: Arc<ValidatorRegistry>,
        mempool: Arc<Mempool>,
        genesis: GenesisConfig,
        key: Keypair,
        _dir: tempfile::TempDir,
    }

    async fn harness(with_local_key: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let key = Keypair::generate();
        let genesis = GenesisConfig::create("bt2c-test".into(), key.address(), now_ms() - 1_000);
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let events = EventBus::new();
        let registry = Arc::new(ValidatorRegistry::open(db, &genesis, events.clone()));
        let state = Arc::new(StateMachine::new(&genesis, registry.clone(), events.clone()));
        let mempool = Arc::new(Mempool::new(MempoolLimits::default(), events.clone()));
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());

        state.apply_block(&genesis.genesis_block).await.unwrap();
        store.add_block(&genesis.genesis_block).unwrap();
        let payload =
            RegistrationPayload::new_signed(&key, consts::SATS_PER_BT2C, "local".into());
        state.register_validator(&payload).await.unwrap();

        let config = DriverConfig {
            block_time_ms: 50,
            proposer_timeout_ms: 30,
            ..DriverConfig::default()
        };
        let (driver, injector) = ConsensusDriver::new(
            state.clone(),
            registry.clone(),
            mempool.clone(),
            store,
            with_local_key.then(|| key.clone()),
            config,
            CancellationToken::new(),
        );
        Harness {
            driver,
            injector,
            state,
            registry,
            mempool,
            genesis,
            key,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_local_proposer_produces_and_commits() {
        let mut h = harness(true).await;

        let snapshot = h.state.snapshot().await;
        let mut tx = Transaction::new(
            h.key.address(),
            "bt2c_friend".into(),
            consts::SATS_PER_BT2C,
            1_000,
            1,
        );
        tx.sign(&h.key);
        h.mempool.add(tx.clone(), &snapshot, now_ms()).unwrap();

        h.driver.run_slot().await.unwrap();

        assert_eq!(h.state.current_height().await, 1);
        assert!(h.mempool.is_empty(), "included tx must leave the mempool");
        let v = h.registry.get(&h.key.address()).await.unwrap();
        assert_eq!(v.blocks_produced, 1);
        assert_eq!(
            h.state.account("bt2c_friend").await.unwrap().balance,
            consts::SATS_PER_BT2C
        );
    }

    #[tokio::test]
    async fn test_external_block_applied_in_time() {
        let mut h = harness(false).await;

        let reward = h.state.next_block_reward().await;
        let mut block = Block::new(
            1,
            h.genesis.genesis_block.hash,
            h.genesis.genesis_block.timestamp + 1_000,
            vec![],
            h.key.address(),
            reward,
        );
        block.sign(&h.key);

        h.injector.send(block).await.unwrap();
        h.driver.run_slot().await.unwrap();

        assert_eq!(h.state.current_height().await, 1);
        let v = h.registry.get(&h.key.address()).await.unwrap();
        assert_eq!(v.blocks_produced, 1);
    }

    #[tokio::test]
    async fn test_proposer_timeout_records_miss() {
        let mut h = harness(false).await;

        h.driver.run_slot().await.unwrap();

        let v = h.registry.get(&h.key.address()).await.unwrap();
        assert_eq!(v.blocks_produced, 0);
        assert_eq!(v.blocks_missed, MAX_SELECTION_ATTEMPTS as u64);
        assert!(v.reputation < consts::REPUTATION_START);
        assert_eq!(h.state.current_height().await, 0);
    }

    #[tokio::test]
    async fn test_forged_external_block_rejected() {
        let mut h = harness(false).await;

        let imposter = Keypair::generate();
        let reward = h.state.next_block_reward().await;
        let mut block = Block::new(
            1,
            h.genesis.genesis_block.hash,
            h.genesis.genesis_block.timestamp + 1_000,
            vec![],
            h.key.address(),
            reward,
        );
        // Signed by the wrong key for the claimed proposer.
        block.sign(&imposter);

        h.injector.send(block).await.unwrap();
        h.driver.run_slot().await.unwrap();
        assert_eq!(h.state.current_height().await, 0);
    }
}
