//! Validator registry: collection, lifecycle transitions, stake totals,
//! reputation-weighted proposer selection and distribution-period
//! rewards.
//!
//! The registry persists every validator mutation to sled under
//! `validator:<address>` keys and reloads the set on startup. All chain
//! mutations flow through the state machine's single writer, so registry
//! writes never race with block application.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::block::genesis::GenesisConfig;
use crate::constants::consensus::*;
use crate::crypto::{self, DOMAIN_SELECTION};
use crate::events::{EventBus, NodeEvent};
use crate::types::Hash256;
use crate::validator::{Validator, ValidatorState};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Validator not found")]
    NotFound,
    #[error("Stake {0} sats is below the minimum of {MIN_STAKE_SATS}")]
    InsufficientStake(u64),
    #[error("Address is already registered")]
    AlreadyRegistered,
    #[error("Address is tombstoned and cannot be reused")]
    Tombstoned,
    #[error("Invalid validator address")]
    InvalidAddress,
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result of a distribution-period claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributionOutcome {
    pub success: bool,
    pub amount: u64,
    pub reason: DistributionReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionReason {
    DeveloperReward,
    EarlyValidatorReward,
    AlreadyClaimed,
    NotEligible,
}

const DB_PREFIX: &[u8] = b"validator:";

pub struct ValidatorRegistry {
    validators: RwLock<HashMap<String, Validator>>,
    db: Arc<sled::Db>,
    developer_address: Option<String>,
    distribution_start_ms: u64,
    distribution_period_ms: u64,
    events: EventBus,
}

impl ValidatorRegistry {
    /// Open the registry, reloading any validators persisted in `db`.
    pub fn open(db: Arc<sled::Db>, genesis: &GenesisConfig, events: EventBus) -> Self {
        let mut validators = HashMap::new();
        for item in db.scan_prefix(DB_PREFIX).flatten() {
            match bincode::deserialize::<Validator>(&item.1) {
                Ok(v) => {
                    validators.insert(v.address.clone(), v);
                }
                Err(e) => {
                    warn!("Skipping undecodable validator record: {e}");
                }
            }
        }
        if !validators.is_empty() {
            info!("📂 Loaded {} validator(s) from disk", validators.len());
        }

        Self {
            validators: RwLock::new(validators),
            db,
            developer_address: genesis.developer_node_address.clone(),
            distribution_start_ms: genesis.distribution_start_ms,
            distribution_period_ms: genesis.distribution_period_ms,
            events,
        }
    }

    fn store(&self, validator: &Validator) -> Result<(), RegistryError> {
        let key = [DB_PREFIX, validator.address.as_bytes()].concat();
        let value =
            bincode::serialize(validator).map_err(|e| RegistryError::Storage(e.to_string()))?;
        self.db
            .insert(key, value)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Register a new validator. The caller (state machine) has already
    /// verified the registration signature and escrowed the stake.
    pub async fn register(
        &self,
        address: String,
        public_key: Vec<u8>,
        stake: u64,
        moniker: String,
        now_ms: u64,
    ) -> Result<Validator, RegistryError> {
        if address.is_empty() || address == COINBASE_SENDER {
            return Err(RegistryError::InvalidAddress);
        }
        if stake < MIN_STAKE_SATS {
            return Err(RegistryError::InsufficientStake(stake));
        }

        let mut validators = self.validators.write().await;
        match validators.get(&address) {
            Some(v) if v.state == ValidatorState::Tombstoned => {
                return Err(RegistryError::Tombstoned)
            }
            Some(_) => return Err(RegistryError::AlreadyRegistered),
            None => {}
        }

        let in_window = now_ms < self.distribution_start_ms + self.distribution_period_ms;
        let mut validator = Validator::new(address.clone(), public_key, stake, moniker, now_ms, in_window);
        validator.is_first_validator = match &self.developer_address {
            Some(dev) => &address == dev,
            None => validators.is_empty(),
        };

        self.store(&validator)?;
        validators.insert(address.clone(), validator.clone());
        drop(validators);

        info!(
            "🪪 Registered validator {} (stake {} sats, first: {})",
            address, stake, validator.is_first_validator
        );
        self.events
            .emit(NodeEvent::ValidatorRegistered { address });
        Ok(validator)
    }

    /// Inactive → Active, guarded by the stake minimum.
    pub async fn activate(&self, address: &str) -> bool {
        self.transition(address, |v| {
            if v.state == ValidatorState::Inactive && v.stake >= MIN_STAKE_SATS {
                v.state = ValidatorState::Active;
                Some(NodeEvent::ValidatorActivated {
                    address: v.address.clone(),
                })
            } else {
                None
            }
        })
        .await
    }

    /// Active → Inactive.
    pub async fn deactivate(&self, address: &str) -> bool {
        self.transition(address, |v| {
            if v.state == ValidatorState::Active {
                v.state = ValidatorState::Inactive;
                Some(NodeEvent::ValidatorDeactivated {
                    address: v.address.clone(),
                })
            } else {
                None
            }
        })
        .await
    }

    /// Active → Jailed until `now_ms + duration_ms`.
    pub async fn jail(&self, address: &str, duration_ms: u64, now_ms: u64) -> bool {
        self.transition(address, |v| {
            if v.state == ValidatorState::Active {
                v.state = ValidatorState::Jailed;
                v.jailed_until = now_ms + duration_ms;
                Some(NodeEvent::ValidatorJailed {
                    address: v.address.clone(),
                    until_ms: v.jailed_until,
                })
            } else {
                None
            }
        })
        .await
    }

    /// Jailed → Inactive once the deadline has passed. The miss counter
    /// resets so the validator is not re-jailed on its next slot.
    pub async fn try_unjail(&self, address: &str, now_ms: u64) -> bool {
        self.transition(address, |v| {
            if v.state == ValidatorState::Jailed && now_ms > v.jailed_until {
                v.state = ValidatorState::Inactive;
                v.blocks_missed = 0;
                Some(NodeEvent::ValidatorUnjailed {
                    address: v.address.clone(),
                })
            } else {
                None
            }
        })
        .await
    }

    /// Terminal transition for double-signing evidence.
    pub async fn tombstone(&self, address: &str) -> bool {
        self.transition(address, |v| {
            if v.state != ValidatorState::Tombstoned {
                v.state = ValidatorState::Tombstoned;
                Some(NodeEvent::ValidatorTombstoned {
                    address: v.address.clone(),
                })
            } else {
                None
            }
        })
        .await
    }

    /// Replace the stake and flip Active/Inactive across the minimum.
    /// Returns false when the address is unknown.
    pub async fn update_stake(&self, address: &str, new_stake: u64) -> bool {
        let event = {
            let mut validators = self.validators.write().await;
            let Some(v) = validators.get_mut(address) else {
                return false;
            };
            v.stake = new_stake;
            let event = match v.state {
                ValidatorState::Active if new_stake < MIN_STAKE_SATS => {
                    v.state = ValidatorState::Inactive;
                    Some(NodeEvent::ValidatorDeactivated {
                        address: v.address.clone(),
                    })
                }
                ValidatorState::Inactive if new_stake >= MIN_STAKE_SATS => {
                    v.state = ValidatorState::Active;
                    Some(NodeEvent::ValidatorActivated {
                        address: v.address.clone(),
                    })
                }
                _ => None,
            };
            if let Err(e) = self.store(v) {
                warn!("Failed to persist validator {address}: {e}");
            }
            event
        };
        if let Some(event) = event {
            self.events.emit(event);
        }
        true
    }

    /// Apply a mutation under the write lock, persist the record, and
    /// emit any transition event. Returns true when a transition fired.
    async fn transition<F>(&self, address: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Validator) -> Option<NodeEvent>,
    {
        let (before, after, event) = {
            let mut validators = self.validators.write().await;
            let Some(v) = validators.get_mut(address) else {
                return false;
            };
            let before = v.state;
            let event = mutate(v);
            // Persist stake/counter changes even without a state flip.
            if let Err(e) = self.store(v) {
                warn!("Failed to persist validator {address}: {e}");
            }
            (before, v.state, event)
        };
        match event {
            Some(event) => {
                debug!("Validator {address} transition: {before:?} → {after:?}");
                self.events.emit(event);
                true
            }
            None => false,
        }
    }

    /// Deterministic reputation-weighted proposer selection.
    ///
    /// Eligible validators are walked in address order; each gets weight
    /// `(stake / total_stake) * reputation_multiplier`, normalized to a
    /// probability. The seed (previous block hash) maps to a uniform
    /// value via the top 32 bits of its selection-domain hash.
    pub async fn select_proposer(&self, seed: &Hash256, now_ms: u64) -> Option<Validator> {
        let validators = self.validators.read().await;
        let mut eligible: Vec<&Validator> = validators
            .values()
            .filter(|v| v.is_eligible(now_ms))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by(|a, b| a.address.cmp(&b.address));

        let total_stake: u64 = eligible.iter().map(|v| v.stake).sum();
        if total_stake == 0 {
            return None;
        }

        let weights: Vec<f64> = eligible
            .iter()
            .map(|v| v.stake as f64 / total_stake as f64 * v.reputation_multiplier())
            .collect();
        let weight_sum: f64 = weights.iter().sum();

        let digest = crypto::hash256(DOMAIN_SELECTION, seed);
        let draw = u32::from_be_bytes(digest[..4].try_into().expect("4 bytes")) as f64
            / (u32::MAX as f64 + 1.0);

        let mut cumulative = 0.0;
        for (validator, weight) in eligible.iter().zip(&weights) {
            cumulative += weight / weight_sum;
            if cumulative > draw {
                return Some((*validator).clone());
            }
        }
        // Float rounding can leave the final cumulative a hair under 1.0.
        eligible.last().map(|v| (*v).clone())
    }

    /// Record a produced block for the proposer.
    pub async fn record_produced(&self, address: &str, now_ms: u64) {
        self.transition(address, |v| {
            v.note_produced(now_ms);
            None
        })
        .await;
    }

    /// Record a missed slot; jails the validator past the threshold.
    pub async fn record_missed(&self, address: &str, now_ms: u64) {
        let jailed = {
            let mut validators = self.validators.write().await;
            let Some(v) = validators.get_mut(address) else {
                return;
            };
            let over_threshold = v.note_missed();
            let newly_jailed = over_threshold && v.state == ValidatorState::Active;
            if newly_jailed {
                v.state = ValidatorState::Jailed;
                v.jailed_until = now_ms + DEFAULT_JAIL_DURATION_MS;
            }
            if let Err(e) = self.store(v) {
                warn!("Failed to persist validator {address}: {e}");
            }
            newly_jailed.then_some(v.jailed_until)
        };

        if let Some(until_ms) = jailed {
            warn!("⛓️  Validator {address} jailed until {until_ms} (too many missed blocks)");
            self.events.emit(NodeEvent::ValidatorJailed {
                address: address.to_string(),
                until_ms,
            });
        }
    }

    /// Reputation update after an allotted slot; called by the consensus
    /// driver once per slot outcome.
    pub async fn apply_reputation(&self, address: &str, produced: bool) {
        self.transition(address, |v| {
            v.apply_reputation(produced);
            None
        })
        .await;
    }

    /// One-time distribution-window claim. The caller mints the returned
    /// amount; the registry only arbitrates eligibility.
    pub async fn process_distribution_reward(
        &self,
        address: &str,
        now_ms: u64,
    ) -> DistributionOutcome {
        let mut validators = self.validators.write().await;
        let Some(v) = validators.get_mut(address) else {
            return DistributionOutcome {
                success: false,
                amount: 0,
                reason: DistributionReason::NotEligible,
            };
        };

        let window_open = now_ms < self.distribution_start_ms + self.distribution_period_ms;
        if !window_open || !v.joined_during_distribution {
            return DistributionOutcome {
                success: false,
                amount: 0,
                reason: DistributionReason::NotEligible,
            };
        }
        if v.distribution_reward_claimed {
            return DistributionOutcome {
                success: false,
                amount: 0,
                reason: DistributionReason::AlreadyClaimed,
            };
        }

        v.distribution_reward_claimed = true;
        let (amount, reason) = if v.is_first_validator {
            (DEVELOPER_REWARD_SATS, DistributionReason::DeveloperReward)
        } else {
            (
                EARLY_VALIDATOR_REWARD_SATS,
                DistributionReason::EarlyValidatorReward,
            )
        };
        if let Err(e) = self.store(v) {
            warn!("Failed to persist validator {address}: {e}");
        }
        DistributionOutcome {
            success: true,
            amount,
            reason,
        }
    }

    pub async fn get(&self, address: &str) -> Option<Validator> {
        self.validators.read().await.get(address).cloned()
    }

    pub async fn all(&self) -> Vec<Validator> {
        let mut list: Vec<Validator> = self.validators.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        list
    }

    pub async fn eligible_count(&self, now_ms: u64) -> usize {
        self.validators
            .read()
            .await
            .values()
            .filter(|v| v.is_eligible(now_ms))
            .count()
    }

    pub async fn total_eligible_stake(&self, now_ms: u64) -> u64 {
        self.validators
            .read()
            .await
            .values()
            .filter(|v| v.is_eligible(now_ms))
            .map(|v| v.stake)
            .sum()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_HASH;

    fn test_registry() -> ValidatorRegistry {
        let db = Arc::new(
            sled::Config::new()
                .temporary(true)
                .open()
                .expect("temporary sled db"),
        );
        let genesis = GenesisConfig::create("bt2c-test".into(), "bt2c_dev".into(), 0);
        ValidatorRegistry::open(db, &genesis, EventBus::new())
    }

    async fn register_active(reg: &ValidatorRegistry, address: &str, stake: u64) {
        reg.register(address.into(), vec![0u8; 32], stake, "m".into(), 1_000)
            .await
            .unwrap();
        assert!(reg.activate(address).await);
    }

    #[tokio::test]
    async fn test_register_rejects_low_stake() {
        let reg = test_registry();
        let err = reg
            .register("bt2c_a".into(), vec![], MIN_STAKE_SATS - 1, "m".into(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InsufficientStake(_)));
    }

    #[tokio::test]
    async fn test_register_duplicate_and_tombstone() {
        let reg = test_registry();
        register_active(&reg, "bt2c_a", MIN_STAKE_SATS).await;

        let err = reg
            .register("bt2c_a".into(), vec![], MIN_STAKE_SATS, "m".into(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered));

        assert!(reg.tombstone("bt2c_a").await);
        let err = reg
            .register("bt2c_a".into(), vec![], MIN_STAKE_SATS, "m".into(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Tombstoned));
    }

    #[tokio::test]
    async fn test_first_validator_follows_developer_address() {
        let reg = test_registry();
        let other = reg
            .register("bt2c_b".into(), vec![], MIN_STAKE_SATS, "m".into(), 0)
            .await
            .unwrap();
        assert!(!other.is_first_validator);

        let dev = reg
            .register("bt2c_dev".into(), vec![], MIN_STAKE_SATS, "m".into(), 0)
            .await
            .unwrap();
        assert!(dev.is_first_validator);
    }

    #[tokio::test]
    async fn test_selection_is_deterministic() {
        let reg = test_registry();
        register_active(&reg, "bt2c_a", 9 * SATS_PER_BT2C).await;
        register_active(&reg, "bt2c_b", SATS_PER_BT2C).await;

        let seed = [0xDEu8; 32];
        let first = reg.select_proposer(&seed, 2_000).await.unwrap();
        for _ in 0..50 {
            let again = reg.select_proposer(&seed, 2_000).await.unwrap();
            assert_eq!(again.address, first.address);
        }
    }

    #[tokio::test]
    async fn test_selection_skips_ineligible() {
        let reg = test_registry();
        register_active(&reg, "bt2c_a", 9 * SATS_PER_BT2C).await;
        register_active(&reg, "bt2c_b", SATS_PER_BT2C).await;

        assert!(reg.jail("bt2c_a", 10_000, 2_000).await);
        for i in 0..100u8 {
            let seed = [i; 32];
            let chosen = reg.select_proposer(&seed, 2_000).await.unwrap();
            assert_eq!(chosen.address, "bt2c_b");
        }
    }

    #[tokio::test]
    async fn test_selection_empty_set() {
        let reg = test_registry();
        assert!(reg.select_proposer(&ZERO_HASH, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_missed_blocks_jail_and_unjail() {
        let reg = test_registry();
        register_active(&reg, "bt2c_a", MIN_STAKE_SATS).await;

        let now = 5_000;
        for _ in 0..=MAX_MISSED_BLOCKS {
            reg.record_missed("bt2c_a", now).await;
        }
        let v = reg.get("bt2c_a").await.unwrap();
        assert_eq!(v.state, ValidatorState::Jailed);
        assert_eq!(v.jailed_until, now + DEFAULT_JAIL_DURATION_MS);

        // Still jailed before the deadline
        assert!(!reg.try_unjail("bt2c_a", v.jailed_until).await);
        assert!(reg.try_unjail("bt2c_a", v.jailed_until + 1).await);

        let v = reg.get("bt2c_a").await.unwrap();
        assert_eq!(v.state, ValidatorState::Inactive);
        assert_eq!(v.blocks_missed, 0);
    }

    #[tokio::test]
    async fn test_update_stake_flips_state() {
        let reg = test_registry();
        register_active(&reg, "bt2c_a", 2 * MIN_STAKE_SATS).await;

        assert!(reg.update_stake("bt2c_a", MIN_STAKE_SATS / 2).await);
        assert_eq!(
            reg.get("bt2c_a").await.unwrap().state,
            ValidatorState::Inactive
        );

        assert!(reg.update_stake("bt2c_a", 3 * MIN_STAKE_SATS).await);
        assert_eq!(
            reg.get("bt2c_a").await.unwrap().state,
            ValidatorState::Active
        );
    }

    #[tokio::test]
    async fn test_distribution_claimed_once() {
        let reg = test_registry();
        register_active(&reg, "bt2c_dev", MIN_STAKE_SATS).await;
        register_active(&reg, "bt2c_early", MIN_STAKE_SATS).await;

        let dev = reg.process_distribution_reward("bt2c_dev", 1_000).await;
        assert!(dev.success);
        assert_eq!(dev.amount, DEVELOPER_REWARD_SATS);
        assert_eq!(dev.reason, DistributionReason::DeveloperReward);

        let early = reg.process_distribution_reward("bt2c_early", 1_000).await;
        assert!(early.success);
        assert_eq!(early.amount, EARLY_VALIDATOR_REWARD_SATS);

        let again = reg.process_distribution_reward("bt2c_dev", 1_000).await;
        assert!(!again.success);
        assert_eq!(again.reason, DistributionReason::AlreadyClaimed);
    }

    #[tokio::test]
    async fn test_distribution_closed_after_window() {
        let reg = test_registry();
        register_active(&reg, "bt2c_late", MIN_STAKE_SATS).await;

        let after = DISTRIBUTION_PERIOD_MS + 1;
        let outcome = reg.process_distribution_reward("bt2c_late", after).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, DistributionReason::NotEligible);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let db = Arc::new(
            sled::Config::new()
                .temporary(true)
                .open()
                .expect("temporary sled db"),
        );
        let genesis = GenesisConfig::create("bt2c-test".into(), "bt2c_dev".into(), 0);

        {
            let reg = ValidatorRegistry::open(db.clone(), &genesis, EventBus::new());
            reg.register("bt2c_a".into(), vec![1; 32], MIN_STAKE_SATS, "m".into(), 0)
                .await
                .unwrap();
            reg.activate("bt2c_a").await;
        }

        let reopened = ValidatorRegistry::open(db, &genesis, EventBus::new());
        let v = reopened.get("bt2c_a").await.unwrap();
        assert_eq!(v.state, ValidatorState::Active);
        assert_eq!(v.stake, MIN_STAKE_SATS);
    }
}
