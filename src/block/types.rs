//! Block record: Merkle root, header hash, proposer signature.

use serde::{Deserialize, Serialize};

use crate::constants::consensus::TIMESTAMP_TOLERANCE_MS;
use crate::crypto::{self, Keypair, DOMAIN_BLOCK, DOMAIN_MERKLE};
use crate::error::{NodeError, NodeResult};
use crate::types::{Hash256, Transaction, ZERO_HASH};

/// Merkle root of the transaction hashes. Empty lists hash the empty
/// input; odd levels duplicate their tail hash.
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return crypto::hash256(DOMAIN_MERKLE, &[]);
    }

    let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.hash).collect();
    while hashes.len() > 1 {
        if hashes.len() % 2 == 1 {
            hashes.push(*hashes.last().expect("non-empty level"));
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                crypto::hash256(DOMAIN_MERKLE, &buf)
            })
            .collect();
    }
    hashes[0]
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub previous_hash: Hash256,
    /// Unix milliseconds; must exceed the parent's and not run more than
    /// 60 s ahead of the local clock
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub validator_address: String,
    /// Computed by the state machine, never trusted from the network
    pub reward: u64,
    pub merkle_root: Hash256,
    pub hash: Hash256,
    /// Proposer's signature over `hash`
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Block {
    /// Assemble an unsigned block; merkle root and hash are filled,
    /// signature is not.
    pub fn new(
        height: u64,
        previous_hash: Hash256,
        timestamp: u64,
        transactions: Vec<Transaction>,
        validator_address: String,
        reward: u64,
    ) -> Self {
        let merkle = merkle_root(&transactions);
        let mut block = Self {
            height,
            previous_hash,
            timestamp,
            transactions,
            validator_address,
            reward,
            merkle_root: merkle,
            hash: ZERO_HASH,
            signature: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Header bytes in canonical order: height, previous hash, merkle
    /// root, validator address, reward, timestamp.
    fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96 + self.validator_address.len());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.previous_hash);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&(self.validator_address.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.validator_address.as_bytes());
        buf.extend_from_slice(&self.reward.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn compute_hash(&self) -> Hash256 {
        crypto::hash256(DOMAIN_BLOCK, &self.header_bytes())
    }

    /// Sign the header hash as the proposer.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.hash = self.compute_hash();
        self.signature = keypair.sign(&self.hash);
    }

    /// Verify the proposer signature under the given public key.
    pub fn verify_signature(&self, proposer_public_key: &[u8]) -> bool {
        crypto::verify(proposer_public_key, &self.hash, &self.signature)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    /// Structural validation against the parent block: linkage, timestamp
    /// bounds, merkle and hash recomputation, coinbase placement.
    /// Proposer signature is checked separately because the public key
    /// lives in the validator registry.
    pub fn validate_against(&self, prev: &Block, now_ms: u64) -> NodeResult<()> {
        if self.height != prev.height + 1 {
            return Err(NodeError::InvalidHeight {
                expected: prev.height + 1,
                got: self.height,
            });
        }
        if self.previous_hash != prev.hash {
            return Err(NodeError::InvalidParent {
                height: self.height,
            });
        }
        if self.timestamp <= prev.timestamp {
            return Err(NodeError::InvalidTimestamp {
                height: self.height,
                reason: "not after parent".to_string(),
            });
        }
        self.validate_structure(now_ms)
    }

    /// Parent-independent checks shared by genesis and child blocks.
    pub fn validate_structure(&self, now_ms: u64) -> NodeResult<()> {
        if self.timestamp > now_ms + TIMESTAMP_TOLERANCE_MS {
            return Err(NodeError::InvalidTimestamp {
                height: self.height,
                reason: "too far in the future".to_string(),
            });
        }
        for (i, tx) in self.transactions.iter().enumerate() {
            if tx.is_coinbase() && i != 0 {
                return Err(NodeError::InvalidStructure(format!(
                    "coinbase at position {i}"
                )));
            }
            if tx.hash != tx.compute_hash() {
                return Err(NodeError::InvalidStructure(format!(
                    "transaction {} hash mismatch",
                    hex::encode(tx.hash)
                )));
            }
        }
        if self.merkle_root != merkle_root(&self.transactions) {
            return Err(NodeError::InvalidMerkle {
                height: self.height,
            });
        }
        if self.hash != self.compute_hash() {
            return Err(NodeError::InvalidStructure(
                "block hash mismatch".to_string(),
            ));
        }
        Ok(())
    }
}
