//! Node assembly: wires configuration, genesis, state, registry,
//! mempool, block store and the consensus driver together, and exposes
//! the typed read/submit surface consumed by the API layers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::block::genesis::GenesisConfig;
use crate::block::Block;
use crate::config::Config;
use crate::consensus::{ConsensusDriver, DriverConfig};
use crate::crypto::Keypair;
use crate::error::{NodeError, NodeResult};
use crate::events::EventBus;
use crate::mempool::{Mempool, MempoolLimits, PoolError};
use crate::registry::ValidatorRegistry;
use crate::shutdown::ShutdownManager;
use crate::state::StateMachine;
use crate::store::BlockStore;
use crate::types::{now_ms, Account, Hash256, Transaction};
use crate::validator::Validator;

/// Aggregate chain statistics for dashboards and the API layer.
#[derive(Clone, Debug)]
pub struct ChainStats {
    pub network: String,
    pub chain_id: String,
    pub height: u64,
    pub last_block_hash: Hash256,
    pub total_supply: u64,
    pub validator_count: usize,
    pub eligible_validators: usize,
    pub mempool_count: usize,
    pub mempool_bytes: usize,
}

/// Typed read surface over the chain. The HTTP API, explorer and
/// exporters consume this; they never touch components directly.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_by_height(&self, height: u64) -> NodeResult<Option<Block>>;
    async fn block_by_hash(&self, hash: &Hash256) -> NodeResult<Option<Block>>;
    async fn blocks_in_range(&self, start: u64, end: u64) -> NodeResult<Vec<Block>>;
    async fn transaction_by_hash(&self, hash: &Hash256)
        -> NodeResult<Option<(Transaction, u64)>>;
    async fn account(&self, address: &str) -> Option<Account>;
    async fn validator(&self, address: &str) -> Option<Validator>;
    async fn validators(&self) -> Vec<Validator>;
    async fn stats(&self) -> ChainStats;
}

pub struct Node {
    config: Config,
    genesis: GenesisConfig,
    db: Arc<sled::Db>,
    events: EventBus,
    state: Arc<StateMachine>,
    registry: Arc<ValidatorRegistry>,
    mempool: Arc<Mempool>,
    store: Arc<BlockStore>,
}

impl Node {
    /// Open the node: storage, registry, state machine, mempool. Applies
    /// genesis on first run; on restart restores the persisted chain
    /// state and replays any blocks it is missing.
    pub async fn open(config: Config, genesis: GenesisConfig) -> NodeResult<Self> {
        genesis.validate()?;
        let data_dir = config.network_data_dir();
        std::fs::create_dir_all(&data_dir)?;

        let db = Arc::new(
            sled::open(data_dir.join("node.db"))
                .map_err(|e| NodeError::Config(format!("cannot open node db: {e}")))?,
        );
        let events = EventBus::new();
        let registry = Arc::new(ValidatorRegistry::open(db.clone(), &genesis, events.clone()));
        let state = Arc::new(
            StateMachine::new(&genesis, registry.clone(), events.clone())
                .with_persistence(db.clone()),
        );
        let store = Arc::new(BlockStore::open(data_dir.join("blocks"))?);

        match store.tip_height() {
            None => {
                info!("💎 Initializing chain {} from genesis", genesis.chain_id);
                state.apply_block(&genesis.genesis_block).await?;
                store.add_block(&genesis.genesis_block)?;
            }
            Some(tip) => {
                let restored = state.restore_persisted().await;
                let replay_from = match restored {
                    Some(height) if height <= tip => {
                        // Sanity: the snapshot must sit on this chain.
                        let last_hash = state.last_block_hash().await;
                        let on_chain = store
                            .get_by_height(height)?
                            .map(|b| b.hash == last_hash)
                            .unwrap_or(false);
                        if on_chain {
                            height + 1
                        } else {
                            warn!("Persisted state diverges from the block log, replaying");
                            state.reset().await;
                            0
                        }
                    }
                    Some(_) => {
                        // Snapshot is ahead of the log (lost tail); replay
                        // from scratch so state and log agree.
                        state.reset().await;
                        0
                    }
                    None => 0,
                };
                for height in replay_from..=tip {
                    let block = store.get_by_height(height)?.ok_or_else(|| {
                        NodeError::Config(format!("block {height} missing during replay"))
                    })?;
                    state.apply_block(&block).await?;
                }
                info!(
                    "🔁 Chain ready at height {} ({} replayed)",
                    tip,
                    tip + 1 - replay_from
                );
            }
        }

        let limits = MempoolLimits {
            max_count: config.mempool_max_count,
            max_size_bytes: config.mempool_max_size_bytes,
            expiration_ms: config.mempool_expiration_ms,
        };
        let mempool = Arc::new(Mempool::new(limits, events.clone()));
        let snapshot = state.snapshot().await;
        mempool.load_mirror(&db, &snapshot, now_ms());

        Ok(Self {
            config,
            genesis,
            db,
            events,
            state,
            registry,
            mempool,
            store,
        })
    }

    /// Spawn the consensus driver, the mempool sweeper and the mirror
    /// persistence task. Returns the block-injection sender used by the
    /// transport layer.
    pub fn start(
        self: &Arc<Self>,
        local_key: Option<Keypair>,
        shutdown: &mut ShutdownManager,
    ) -> mpsc::Sender<Block> {
        let driver_config = DriverConfig {
            block_time_ms: self.config.block_time_ms,
            proposer_timeout_ms: self.config.proposer_timeout_ms,
            max_block_bytes: self.config.max_block_bytes,
            ..DriverConfig::default()
        };
        let (driver, injector) = ConsensusDriver::new(
            self.state.clone(),
            self.registry.clone(),
            self.mempool.clone(),
            self.store.clone(),
            local_key,
            driver_config,
            shutdown.token(),
        );

        let node = self.clone();
        shutdown.register_task(tokio::spawn(async move {
            if let Err(e) = driver.run().await {
                // A store failure must halt rather than risk a corrupted
                // chain.
                error!("💀 Writer halted: {e}");
                node.flush();
                std::process::exit(3);
            }
        }));

        let mempool = self.mempool.clone();
        let token = shutdown.token();
        shutdown.register_task(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(
                crate::constants::mempool::SWEEP_INTERVAL_MS,
            ));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        mempool.sweep_expired(now_ms());
                    }
                }
            }
        }));

        let mempool = self.mempool.clone();
        let db = self.db.clone();
        let token = shutdown.token();
        let persistence_ms = self.config.mempool_persistence_ms;
        shutdown.register_task(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(persistence_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = mempool.persist_mirror(&db) {
                            warn!("Final mempool mirror write failed: {e}");
                        }
                        break;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = mempool.persist_mirror(&db) {
                            warn!("Mempool mirror write failed: {e}");
                        }
                    }
                }
            }
        }));

        injector
    }

    /// Validate and enqueue a transaction for inclusion.
    pub async fn submit_transaction(&self, tx: Transaction) -> NodeResult<Hash256> {
        let snapshot = self.state.snapshot().await;
        let hash = tx.hash;
        let sender = tx.sender.clone();
        self.mempool
            .add(tx, &snapshot, now_ms())
            .map_err(|e| match e {
                PoolError::AlreadyExists => NodeError::DuplicateTransaction {
                    hash: hex::encode(hash),
                },
                PoolError::PoolFull => NodeError::MempoolFull,
                PoolError::InvalidSignature => NodeError::InvalidSignature {
                    signer: sender.clone(),
                },
                PoolError::StaleNonce { current, got } => NodeError::InvalidNonce {
                    address: sender.clone(),
                    expected: current + 1,
                    got,
                },
                PoolError::InsufficientFunds { needed, available } => {
                    NodeError::InsufficientFunds {
                        address: sender.clone(),
                        needed,
                        available,
                    }
                }
                PoolError::InvalidStructure(msg) => NodeError::InvalidStructure(msg),
                PoolError::ShuttingDown => {
                    NodeError::InvalidStructure("node is shutting down".to_string())
                }
                PoolError::Storage(msg) => NodeError::Config(msg),
            })
    }

    /// Pending mempool transactions of one address.
    pub fn pending_transactions(&self, address: &str) -> Vec<Transaction> {
        self.mempool.pending_for(address)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn genesis(&self) -> &GenesisConfig {
        &self.genesis
    }

    /// Final durability pass: stop admissions, mirror the mempool, fsync
    /// the block store.
    pub fn flush(&self) {
        self.mempool.stop_accepting();
        if let Err(e) = self.mempool.persist_mirror(&self.db) {
            warn!("Mempool mirror flush failed: {e}");
        }
        if let Err(e) = self.store.sync() {
            warn!("Block store fsync failed: {e}");
        }
        if let Err(e) = self.db.flush() {
            warn!("Node db flush failed: {e}");
        }
    }
}

#[async_trait]
impl ChainReader for Node {
    async fn block_by_height(&self, height: u64) -> NodeResult<Option<Block>> {
        self.store.get_by_height(height)
    }

    async fn block_by_hash(&self, hash: &Hash256) -> NodeResult<Option<Block>> {
        self.store.get_by_hash(hash)
    }

    async fn blocks_in_range(&self, start: u64, end: u64) -> NodeResult<Vec<Block>> {
        self.store.get_range(start, end)
    }

    async fn transaction_by_hash(
        &self,
        hash: &Hash256,
    ) -> NodeResult<Option<(Transaction, u64)>> {
        self.store.transaction_by_hash(hash)
    }

    async fn account(&self, address: &str) -> Option<Account> {
        self.state.account(address).await
    }

    async fn validator(&self, address: &str) -> Option<Validator> {
        self.registry.get(address).await
    }

    async fn validators(&self) -> Vec<Validator> {
        self.registry.all().await
    }

    async fn stats(&self) -> ChainStats {
        let snapshot = self.state.snapshot().await;
        let now = now_ms();
        ChainStats {
            network: self.config.network.clone(),
            chain_id: self.genesis.chain_id.clone(),
            height: snapshot.current_height,
            last_block_hash: snapshot.last_block_hash,
            total_supply: snapshot.total_supply,
            validator_count: self.registry.all().await.len(),
            eligible_validators: self.registry.eligible_count(now).await,
            mempool_count: self.mempool.len(),
            mempool_bytes: self.mempool.size_bytes(),
        }
    }
}
