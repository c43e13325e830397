//! Deterministic chain state machine.
//!
//! Single writer over the account map and chain scalars. `apply_block`
//! is atomic: validation and application run against a scratch copy of
//! the state which replaces the live state only on success, so a
//! rejection leaves the observable state byte-identical.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::block::genesis::GenesisConfig;
use crate::block::Block;
use crate::constants::consensus::*;
use crate::crypto::{self, Keypair, DOMAIN_REGISTRATION};
use crate::error::{NodeError, NodeResult};
use crate::events::{EventBus, NodeEvent};
use crate::registry::{DistributionReason, RegistryError, ValidatorRegistry};
use crate::types::{now_ms, Account, Hash256, Transaction, ZERO_HASH};

/// Process-wide chain state. Mutated only by [`StateMachine`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainState {
    pub accounts: HashMap<String, Account>,
    pub current_height: u64,
    pub genesis_applied: bool,
    pub last_block_hash: Hash256,
    pub total_supply: u64,
    pub developer_node_set: bool,
}

impl ChainState {
    fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            current_height: 0,
            genesis_applied: false,
            last_block_hash: ZERO_HASH,
            total_supply: 0,
            developer_node_set: false,
        }
    }

    /// Best-known nonce for an address (0 for unknown accounts).
    pub fn nonce(&self, address: &str) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    /// Spendable balance for an address (0 for unknown accounts).
    pub fn balance(&self, address: &str) -> u64 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    fn account_mut(&mut self, address: &str, now: u64) -> &mut Account {
        self.accounts
            .entry(address.to_string())
            .or_insert_with(|| Account::new(address.to_string(), now))
    }
}

/// Economic parameters frozen at genesis.
#[derive(Clone, Debug)]
struct Economics {
    initial_reward: u64,
    halving_interval: u64,
    max_supply: u64,
    min_stake: u64,
}

/// Signed validator-registration request.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RegistrationPayload {
    pub address: String,
    pub public_key: Vec<u8>,
    pub stake: u64,
    pub moniker: String,
    pub signature: Vec<u8>,
}

impl RegistrationPayload {
    fn signable_bytes(address: &str, public_key: &[u8], stake: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(44 + address.len() + public_key.len());
        buf.extend_from_slice(&(address.len() as u32).to_le_bytes());
        buf.extend_from_slice(address.as_bytes());
        buf.extend_from_slice(&(public_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(public_key);
        buf.extend_from_slice(&stake.to_le_bytes());
        buf
    }

    /// Build and sign a registration for the keypair's own address.
    pub fn new_signed(keypair: &Keypair, stake: u64, moniker: String) -> Self {
        let address = keypair.address();
        let public_key = keypair.public_bytes().to_vec();
        let bytes = Self::signable_bytes(&address, &public_key, stake);
        let mut domain_bytes = DOMAIN_REGISTRATION.to_vec();
        domain_bytes.extend_from_slice(&bytes);
        Self {
            signature: keypair.sign(&domain_bytes),
            address,
            public_key,
            stake,
            moniker,
        }
    }

    fn verify(&self) -> bool {
        if crate::address::derive_address(&self.public_key) != self.address {
            return false;
        }
        let mut domain_bytes = DOMAIN_REGISTRATION.to_vec();
        domain_bytes.extend_from_slice(&Self::signable_bytes(
            &self.address,
            &self.public_key,
            self.stake,
        ));
        crypto::verify(&self.public_key, &domain_bytes, &self.signature)
    }
}

/// Summary returned by [`StateMachine::apply_block`].
#[derive(Clone, Debug)]
pub struct BlockReceipt {
    pub height: u64,
    pub hash: Hash256,
    pub reward: u64,
    pub fees: u64,
    pub transactions: usize,
}

const STATE_KEY: &[u8] = b"chainstate";

pub struct StateMachine {
    state: RwLock<ChainState>,
    registry: Arc<ValidatorRegistry>,
    events: EventBus,
    economics: Economics,
    /// Durable snapshot target. Stake escrow and distribution rewards do
    /// not travel in blocks, so the chain state itself must survive
    /// restarts; block replay alone cannot reproduce it.
    persistence: Option<Arc<sled::Db>>,
}

impl StateMachine {
    pub fn new(genesis: &GenesisConfig, registry: Arc<ValidatorRegistry>, events: EventBus) -> Self {
        Self {
            state: RwLock::new(ChainState::new()),
            registry,
            events,
            economics: Economics {
                initial_reward: genesis.initial_reward,
                halving_interval: genesis.halving_interval,
                max_supply: genesis.max_supply,
                min_stake: genesis.min_stake,
            },
            persistence: None,
        }
    }

    /// Persist the chain state into `db` after every mutation.
    pub fn with_persistence(mut self, db: Arc<sled::Db>) -> Self {
        self.persistence = Some(db);
        self
    }

    fn persist(&self, state: &ChainState) {
        let Some(db) = &self.persistence else { return };
        match bincode::serialize(state) {
            Ok(bytes) => {
                if let Err(e) = db.insert(STATE_KEY, bytes) {
                    tracing::warn!("Failed to persist chain state: {e}");
                }
            }
            Err(e) => tracing::warn!("Failed to serialize chain state: {e}"),
        }
    }

    /// Restore a previously persisted chain state. Returns the restored
    /// height when a snapshot was present and loadable.
    pub async fn restore_persisted(&self) -> Option<u64> {
        let db = self.persistence.as_ref()?;
        let bytes = db.get(STATE_KEY).ok().flatten()?;
        let restored: ChainState = match bincode::deserialize(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Persisted chain state unreadable, will replay: {e}");
                return None;
            }
        };
        if !restored.genesis_applied {
            return None;
        }
        let height = restored.current_height;
        *self.state.write().await = restored;
        Some(height)
    }

    /// Clear back to the empty pre-genesis state (used when a persisted
    /// snapshot turns out not to belong to the stored chain).
    pub async fn reset(&self) {
        *self.state.write().await = ChainState::new();
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    /// Immutable snapshot of the chain state for readers.
    pub async fn snapshot(&self) -> ChainState {
        self.state.read().await.clone()
    }

    pub async fn account(&self, address: &str) -> Option<Account> {
        self.state.read().await.accounts.get(address).cloned()
    }

    pub async fn current_height(&self) -> u64 {
        self.state.read().await.current_height
    }

    pub async fn last_block_hash(&self) -> Hash256 {
        self.state.read().await.last_block_hash
    }

    pub async fn total_supply(&self) -> u64 {
        self.state.read().await.total_supply
    }

    pub async fn genesis_applied(&self) -> bool {
        self.state.read().await.genesis_applied
    }

    /// Block reward at `height` given the supply minted so far:
    /// `max(initial >> halvings, MIN_REWARD)` clamped to the remaining
    /// supply. Pure integer arithmetic keeps every node bit-identical.
    pub fn block_reward_at(&self, height: u64, total_supply: u64) -> u64 {
        let halvings = height / self.economics.halving_interval;
        let base = if halvings >= 63 {
            0
        } else {
            self.economics.initial_reward >> halvings
        };
        let reward = base.max(MIN_REWARD_SATS);
        reward.min(self.economics.max_supply.saturating_sub(total_supply))
    }

    /// Reward the next produced block would carry.
    pub async fn next_block_reward(&self) -> u64 {
        let state = self.state.read().await;
        let height = if state.genesis_applied {
            state.current_height + 1
        } else {
            0
        };
        if height == 0 {
            0
        } else {
            self.block_reward_at(height, state.total_supply)
        }
    }

    /// Apply a block atomically. On any rejection the live state is
    /// untouched and a typed error describes the first failure.
    pub async fn apply_block(&self, block: &Block) -> NodeResult<BlockReceipt> {
        let now = now_ms();
        let mut state = self.state.write().await;

        // Height and parent linkage against the live tip.
        let expected_height = if state.genesis_applied {
            state.current_height + 1
        } else {
            0
        };
        if block.height != expected_height {
            return Err(NodeError::InvalidHeight {
                expected: expected_height,
                got: block.height,
            });
        }
        let expected_parent = if state.genesis_applied {
            state.last_block_hash
        } else {
            ZERO_HASH
        };
        if block.previous_hash != expected_parent {
            return Err(NodeError::InvalidParent {
                height: block.height,
            });
        }
        block.validate_structure(now)?;

        // Coinbase transactions mint outside the reward schedule; only the
        // genesis document is allowed to do that.
        if !block.is_genesis() && block.transactions.iter().any(|tx| tx.is_coinbase()) {
            return Err(NodeError::InvalidStructure(
                "coinbase outside genesis".to_string(),
            ));
        }

        // Everything below mutates a scratch copy; the live state is
        // replaced only after the whole block has applied.
        let mut work = state.clone();

        let expected_reward = if block.is_genesis() {
            0
        } else {
            self.block_reward_at(block.height, work.total_supply)
        };
        if block.reward != expected_reward {
            return Err(NodeError::InvalidReward {
                height: block.height,
                expected: expected_reward,
                got: block.reward,
            });
        }

        // Pre-validation pass: walk every user transaction against the
        // scratch accounts so intra-block sequences (several spends from
        // one sender) are checked in order. Nothing is committed yet.
        {
            let mut check = work.clone();
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                Self::check_and_debit(&mut check, tx, block.timestamp)?;
            }
        }

        // Mint pass: coinbase credits (genesis) and the proposer reward.
        for tx in block.transactions.iter().filter(|tx| tx.is_coinbase()) {
            if work.total_supply.saturating_add(tx.amount) > self.economics.max_supply {
                return Err(NodeError::InvalidReward {
                    height: block.height,
                    expected: self.economics.max_supply - work.total_supply,
                    got: tx.amount,
                });
            }
            let recipient = work.account_mut(&tx.recipient, block.timestamp);
            recipient.balance += tx.amount;
            recipient.updated_at = block.timestamp;
            work.total_supply += tx.amount;
        }
        if block.reward > 0 {
            let proposer = work.account_mut(&block.validator_address, block.timestamp);
            proposer.balance += block.reward;
            proposer.updated_at = block.timestamp;
            work.total_supply += block.reward;
        }

        // Application pass: debits, credits, nonces, fees to the proposer.
        let mut fees = 0u64;
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            Self::check_and_debit(&mut work, tx, block.timestamp)?;
            let recipient = work.account_mut(&tx.recipient, block.timestamp);
            recipient.balance += tx.amount;
            recipient.updated_at = block.timestamp;
            if tx.fee > 0 {
                let proposer = work.account_mut(&block.validator_address, block.timestamp);
                proposer.balance += tx.fee;
                proposer.updated_at = block.timestamp;
            }
            fees += tx.fee;
        }

        work.current_height = block.height;
        work.genesis_applied = true;
        work.last_block_hash = block.hash;

        // Commit.
        self.persist(&work);
        *state = work;
        drop(state);

        self.events.emit(NodeEvent::BlockApplied {
            height: block.height,
            hash: block.hash,
            validator: block.validator_address.clone(),
        });
        for tx in &block.transactions {
            self.events.emit(NodeEvent::TransactionApplied {
                hash: tx.hash,
                sender: tx.sender.clone(),
                recipient: tx.recipient.clone(),
                amount: tx.amount,
            });
        }
        if block.reward > 0 {
            self.events.emit(NodeEvent::RewardBlock {
                validator: block.validator_address.clone(),
                amount: block.reward,
            });
        }

        info!(
            "📦 Applied block {} ({} tx, reward {} sats)",
            block.height,
            block.transactions.len(),
            block.reward
        );
        Ok(BlockReceipt {
            height: block.height,
            hash: block.hash,
            reward: block.reward,
            fees,
            transactions: block.transactions.len(),
        })
    }

    /// Validate one user transaction against `state` and debit the
    /// sender. Shared by the pre-validation and application passes.
    fn check_and_debit(state: &mut ChainState, tx: &Transaction, now: u64) -> NodeResult<()> {
        if tx.amount == 0 {
            return Err(NodeError::InvalidStructure(
                "zero-amount transaction".to_string(),
            ));
        }
        if !tx.verify_signature() {
            return Err(NodeError::InvalidSignature {
                signer: tx.sender.clone(),
            });
        }
        let expected_nonce = state.nonce(&tx.sender) + 1;
        if tx.nonce != expected_nonce {
            return Err(NodeError::InvalidNonce {
                address: tx.sender.clone(),
                expected: expected_nonce,
                got: tx.nonce,
            });
        }
        let needed = tx.amount.saturating_add(tx.fee);
        let available = state.balance(&tx.sender);
        if available < needed {
            return Err(NodeError::InsufficientFunds {
                address: tx.sender.clone(),
                needed,
                available,
            });
        }
        let sender = state.account_mut(&tx.sender, now);
        sender.balance -= needed;
        sender.nonce = tx.nonce;
        sender.updated_at = now;
        Ok(())
    }

    /// Move value between an account's balance and its stake. Positive
    /// deltas stake, negative deltas unstake. Flips the validator's
    /// Active/Inactive state when the stake crosses the minimum.
    pub async fn update_stake(&self, address: &str, delta_sats: i64) -> NodeResult<u64> {
        let new_stake = {
            let mut state = self.state.write().await;
            let now = now_ms();
            let account = state.account_mut(address, now);
            if delta_sats >= 0 {
                let delta = delta_sats as u64;
                if account.balance < delta {
                    return Err(NodeError::InsufficientFunds {
                        address: address.to_string(),
                        needed: delta,
                        available: account.balance,
                    });
                }
                account.balance -= delta;
                account.stake += delta;
            } else {
                let delta = delta_sats.unsigned_abs();
                if account.stake < delta {
                    return Err(NodeError::InsufficientFunds {
                        address: address.to_string(),
                        needed: delta,
                        available: account.stake,
                    });
                }
                account.stake -= delta;
                account.balance += delta;
            }
            account.updated_at = now;
            let stake = account.stake;
            self.persist(&state);
            stake
        };

        self.registry.update_stake(address, new_stake).await;
        debug!("Stake for {address} now {new_stake} sats");
        Ok(new_stake)
    }

    /// Register a validator from a signed payload: verify the signature,
    /// escrow the stake, create the registry record, and pay any
    /// distribution-window reward.
    pub async fn register_validator(&self, payload: &RegistrationPayload) -> NodeResult<()> {
        if !payload.verify() {
            return Err(NodeError::InvalidSignature {
                signer: payload.address.clone(),
            });
        }
        if payload.stake < self.economics.min_stake {
            return Err(NodeError::ValidatorIneligible {
                address: payload.address.clone(),
            });
        }

        let now = now_ms();
        let mut state = self.state.write().await;

        let available = state.balance(&payload.address);
        if available < payload.stake {
            return Err(NodeError::InsufficientFunds {
                address: payload.address.clone(),
                needed: payload.stake,
                available,
            });
        }

        let validator = self
            .registry
            .register(
                payload.address.clone(),
                payload.public_key.clone(),
                payload.stake,
                payload.moniker.clone(),
                now,
            )
            .await
            .map_err(|e| match e {
                RegistryError::Storage(msg) => NodeError::Config(msg),
                _ => NodeError::ValidatorIneligible {
                    address: payload.address.clone(),
                },
            })?;

        // Escrow the stake now that the registry accepted the record.
        let account = state.account_mut(&payload.address, now);
        account.balance -= payload.stake;
        account.stake += payload.stake;
        account.updated_at = now;

        self.registry.activate(&payload.address).await;
        if validator.is_first_validator {
            state.developer_node_set = true;
        }

        let outcome = self
            .registry
            .process_distribution_reward(&payload.address, now)
            .await;
        let event = if outcome.success {
            let minted = outcome
                .amount
                .min(self.economics.max_supply.saturating_sub(state.total_supply));
            let account = state.account_mut(&payload.address, now);
            account.balance += minted;
            account.updated_at = now;
            state.total_supply += minted;
            info!(
                "🎁 Distribution reward of {} sats paid to {}",
                minted, payload.address
            );
            Some(match outcome.reason {
                DistributionReason::DeveloperReward => NodeEvent::RewardDeveloper {
                    validator: payload.address.clone(),
                    amount: minted,
                },
                _ => NodeEvent::RewardEarlyValidator {
                    validator: payload.address.clone(),
                    amount: minted,
                },
            })
        } else {
            None
        };

        self.persist(&state);
        drop(state);
        if let Some(event) = event {
            self.events.emit(event);
        }
        Ok(())
    }
}
