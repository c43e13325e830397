//! Core data types for the BT2C blockchain

use serde::{Deserialize, Serialize};

use crate::constants::consensus::COINBASE_SENDER;
use crate::crypto::{self, Keypair, DOMAIN_TX};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A value transfer. Amounts are integer satoshis.
///
/// Older tooling emitted `from`/`to` field names; they are accepted as
/// aliases at the serialization boundary only — internally there is one
/// canonical record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    #[serde(alias = "from")]
    pub sender: String,
    #[serde(alias = "to")]
    pub recipient: String,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    /// Unix milliseconds at creation
    pub timestamp: u64,
    /// Required for non-coinbase transactions
    #[serde(default)]
    pub sender_public_key: Option<Vec<u8>>,
    /// Detached ed25519 signature over the signable bytes
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
    /// Content hash of the signed record; pure function of the fields above
    #[serde(default)]
    pub hash: Hash256,
}

impl Transaction {
    /// Build an unsigned transaction. Call [`Transaction::sign`] before
    /// submitting it anywhere.
    pub fn new(sender: String, recipient: String, amount: u64, fee: u64, nonce: u64) -> Self {
        Self {
            sender,
            recipient,
            amount,
            fee,
            nonce,
            timestamp: now_ms(),
            sender_public_key: None,
            signature: None,
            hash: ZERO_HASH,
        }
    }

    /// A coinbase transaction minting `amount` to `recipient`. Only the
    /// state machine emits these; they carry no signature.
    pub fn coinbase(recipient: String, amount: u64, timestamp: u64) -> Self {
        let mut tx = Self {
            sender: COINBASE_SENDER.to_string(),
            recipient,
            amount,
            fee: 0,
            nonce: 0,
            timestamp,
            sender_public_key: None,
            signature: None,
            hash: ZERO_HASH,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE_SENDER
    }

    /// Canonical signable bytes: fixed field order, length-prefixed
    /// strings, little-endian integers. Signature and hash are excluded.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(40 + self.sender.len() + self.recipient.len());
        buf.extend_from_slice(&(self.sender.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(&(self.recipient.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.fee.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Content hash: H(signable_bytes || signature).
    pub fn compute_hash(&self) -> Hash256 {
        let mut bytes = self.signable_bytes();
        if let Some(sig) = &self.signature {
            bytes.extend_from_slice(sig);
        }
        crypto::hash256(DOMAIN_TX, &bytes)
    }

    /// Sign with the sender's keypair, filling public key, signature and hash.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.sender_public_key = Some(keypair.public_bytes().to_vec());
        self.signature = Some(keypair.sign(&self.signable_bytes()));
        self.hash = self.compute_hash();
    }

    /// Verify the signature and that the embedded public key matches the
    /// sender address. Coinbase transactions have nothing to verify here.
    pub fn verify_signature(&self) -> bool {
        if self.is_coinbase() {
            return true;
        }
        let (Some(pk), Some(sig)) = (&self.sender_public_key, &self.signature) else {
            return false;
        };
        if crate::address::derive_address(pk) != self.sender {
            return false;
        }
        crypto::verify(pk, &self.signable_bytes(), sig)
    }

    /// Serialized size used for mempool accounting.
    pub fn size_bytes(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

/// Account state tracked by the state machine. Created on first
/// reference, never destroyed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub address: String,
    pub balance: u64,
    pub nonce: u64,
    pub stake: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Account {
    pub fn new(address: String, now: u64) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            stake: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
