//! Node-wide error taxonomy
//!
//! Every rejection carries a machine-readable kind plus a human sentence.
//! Validation failures are recovered locally (the state machine restores
//! its snapshot); store I/O failures are fatal for the writer task.

use thiserror::Error;

/// Errors produced by consensus, state and storage operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// Malformed record (missing fields, misplaced coinbase, oversized block)
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    /// Signature did not verify under the claimed public key
    #[error("Invalid signature from {signer}")]
    InvalidSignature { signer: String },

    /// Transaction nonce is not exactly one past the account nonce
    #[error("Invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: String,
        expected: u64,
        got: u64,
    },

    /// Sender balance cannot cover amount + fee
    #[error("Insufficient funds for {address}: need {needed} sats, have {available}")]
    InsufficientFunds {
        address: String,
        needed: u64,
        available: u64,
    },

    /// Block height is not current_height + 1
    #[error("Invalid height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },

    /// previous_hash does not match the chain tip
    #[error("Invalid parent at height {height}")]
    InvalidParent { height: u64 },

    /// Block timestamp not after its parent or too far in the future
    #[error("Invalid timestamp in block {height}: {reason}")]
    InvalidTimestamp { height: u64, reason: String },

    /// Merkle root does not recompute from the transaction list
    #[error("Merkle root mismatch in block {height}")]
    InvalidMerkle { height: u64 },

    /// Block reward differs from the state machine's computation
    #[error("Invalid reward in block {height}: expected {expected} sats, got {got}")]
    InvalidReward {
        height: u64,
        expected: u64,
        got: u64,
    },

    /// Proposer is not in the eligible set
    #[error("Validator {address} is not eligible")]
    ValidatorIneligible { address: String },

    /// Distribution reward already claimed by this address
    #[error("Distribution reward already claimed by {address}")]
    AlreadyClaimed { address: String },

    /// Mempool at capacity and the entry does not outbid the floor
    #[error("Mempool is full")]
    MempoolFull,

    /// Same transaction hash already pending
    #[error("Duplicate transaction {hash}")]
    DuplicateTransaction { hash: String },

    /// Block store I/O failure; fatal for the writer
    #[error("Store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    /// Block (de)serialization failure in the store path
    #[error("Store serialization error: {0}")]
    StoreCodec(#[from] bincode::Error),

    /// Key or signature material could not be used
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Startup configuration problem
    #[error("Config error: {0}")]
    Config(String),
}

/// Result alias used across the node
pub type NodeResult<T> = Result<T, NodeError>;

impl NodeError {
    /// True for errors that must halt the writer task rather than risk a
    /// corrupted chain.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::StoreIo(_) | NodeError::StoreCodec(_))
    }

    /// Process exit code: 1 user error, 2 transient failure, 3 fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::StoreIo(_) | NodeError::StoreCodec(_) => 3,
            NodeError::MempoolFull => 2,
            _ => 1,
        }
    }

    /// Stable machine-readable kind for logs and API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::InvalidStructure(_) => "invalid_structure",
            NodeError::InvalidSignature { .. } => "invalid_signature",
            NodeError::InvalidNonce { .. } => "invalid_nonce",
            NodeError::InsufficientFunds { .. } => "insufficient_funds",
            NodeError::InvalidHeight { .. } => "invalid_height",
            NodeError::InvalidParent { .. } => "invalid_parent",
            NodeError::InvalidTimestamp { .. } => "invalid_timestamp",
            NodeError::InvalidMerkle { .. } => "invalid_merkle",
            NodeError::InvalidReward { .. } => "invalid_reward",
            NodeError::ValidatorIneligible { .. } => "validator_ineligible",
            NodeError::AlreadyClaimed { .. } => "already_claimed",
            NodeError::MempoolFull => "mempool_full",
            NodeError::DuplicateTransaction { .. } => "duplicate_transaction",
            NodeError::StoreIo(_) => "store_io",
            NodeError::StoreCodec(_) => "store_codec",
            NodeError::Crypto(_) => "crypto",
            NodeError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let io = NodeError::StoreIo(std::io::Error::other("disk gone"));
        assert!(io.is_fatal());
        assert_eq!(io.exit_code(), 3);

        let nonce = NodeError::InvalidNonce {
            address: "bt2c_x".into(),
            expected: 5,
            got: 7,
        };
        assert!(!nonce.is_fatal());
        assert_eq!(nonce.exit_code(), 1);
        assert_eq!(nonce.kind(), "invalid_nonce");
    }

    #[test]
    fn test_mempool_full_is_transient() {
        assert_eq!(NodeError::MempoolFull.exit_code(), 2);
    }
}
