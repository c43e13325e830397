//! Genesis document loading and genesis block assembly.
//!
//! The genesis document is a JSON file shared by every node on a
//! network. It fixes the economic parameters and embeds the canonical
//! genesis block so all nodes agree on height 0 byte-for-byte.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::block::Block;
use crate::constants::consensus;
use crate::error::{NodeError, NodeResult};
use crate::types::{Transaction, ZERO_HASH};

/// Genesis parameters. Amounts are satoshis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    pub initial_reward: u64,
    pub halving_interval: u64,
    pub max_supply: u64,
    pub min_stake: u64,
    pub distribution_period_ms: u64,
    /// Unix ms at which the distribution window opens (genesis time)
    pub distribution_start_ms: u64,
    /// Address marked as the developer node on registration. When unset,
    /// the first registration into an empty registry takes the flag.
    #[serde(default)]
    pub developer_node_address: Option<String>,
    pub genesis_block: Block,
}

impl GenesisConfig {
    /// Build a genesis document for a new chain. The genesis block holds
    /// a single coinbase crediting the developer address with the
    /// developer reward plus the early-validator reward.
    pub fn create(chain_id: String, developer_address: String, genesis_time_ms: u64) -> Self {
        let coinbase = Transaction::coinbase(
            developer_address.clone(),
            consensus::DEVELOPER_REWARD_SATS + consensus::EARLY_VALIDATOR_REWARD_SATS,
            genesis_time_ms,
        );
        let genesis_block = Block::new(
            0,
            ZERO_HASH,
            genesis_time_ms,
            vec![coinbase],
            developer_address.clone(),
            0,
        );

        Self {
            chain_id,
            initial_reward: consensus::INITIAL_REWARD_SATS,
            halving_interval: consensus::HALVING_INTERVAL_BLOCKS,
            max_supply: consensus::MAX_SUPPLY_SATS,
            min_stake: consensus::MIN_STAKE_SATS,
            distribution_period_ms: consensus::DISTRIBUTION_PERIOD_MS,
            distribution_start_ms: genesis_time_ms,
            developer_node_address: Some(developer_address),
            genesis_block,
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "cannot read genesis file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: GenesisConfig = serde_json::from_str(&raw)
            .map_err(|e| NodeError::Config(format!("malformed genesis document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> NodeResult<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("cannot serialize genesis: {e}")))?;
        std::fs::write(path.as_ref(), raw).map_err(|e| {
            NodeError::Config(format!(
                "cannot write genesis file {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Sanity checks on a loaded document.
    pub fn validate(&self) -> NodeResult<()> {
        if self.genesis_block.height != 0 {
            return Err(NodeError::Config("genesis block must be height 0".into()));
        }
        if self.genesis_block.previous_hash != ZERO_HASH {
            return Err(NodeError::Config(
                "genesis previous_hash must be all zeros".into(),
            ));
        }
        if self.genesis_block.hash != self.genesis_block.compute_hash() {
            return Err(NodeError::Config("genesis block hash mismatch".into()));
        }
        if self.max_supply == 0 || self.initial_reward == 0 || self.halving_interval == 0 {
            return Err(NodeError::Config(
                "economic parameters must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_embeds_developer_coinbase() {
        let g = GenesisConfig::create("bt2c-testnet-1".into(), "bt2c_DEV".into(), 1_700_000_000_000);
        assert_eq!(g.genesis_block.height, 0);
        assert_eq!(g.genesis_block.transactions.len(), 1);

        let cb = &g.genesis_block.transactions[0];
        assert!(cb.is_coinbase());
        assert_eq!(cb.recipient, "bt2c_DEV");
        // 100 developer + 1 early validator = 101 BT2C
        assert_eq!(cb.amount, 101 * consensus::SATS_PER_BT2C);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let g = GenesisConfig::create("bt2c-testnet-1".into(), "bt2c_DEV".into(), 1_700_000_000_000);
        let json = serde_json::to_string(&g).unwrap();
        let back: GenesisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.genesis_block, g.genesis_block);
        assert_eq!(back.chain_id, g.chain_id);
    }

    #[test]
    fn test_validate_rejects_bad_height() {
        let mut g =
            GenesisConfig::create("bt2c-testnet-1".into(), "bt2c_DEV".into(), 1_700_000_000_000);
        g.genesis_block.height = 1;
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        let g = GenesisConfig::create("bt2c-testnet-1".into(), "bt2c_DEV".into(), 1_700_000_000_000);
        g.save_to_file(&path).unwrap();
        let back = GenesisConfig::load_from_file(&path).unwrap();
        assert_eq!(back.genesis_block.hash, g.genesis_block.hash);
    }
}
