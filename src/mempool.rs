//! Transaction mempool.
//!
//! Admission validates structure and signature immediately and applies a
//! light nonce/balance policy against the best-known chain state; the
//! authoritative checks happen again inside `apply_block`. Capacity is
//! bounded by count and bytes with lowest-(fee, oldest) eviction, stale
//! entries are pruned by a periodic sweeper, and the pool can mirror
//! itself into sled so a restart does not forget pending transactions.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EventBus, NodeEvent};
use crate::state::ChainState;
use crate::types::{Hash256, Transaction};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Transaction pool is full")]
    PoolFull,
    #[error("Transaction already in pool")]
    AlreadyExists,
    #[error("Invalid transaction structure: {0}")]
    InvalidStructure(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Nonce {got} is not ahead of account nonce {current}")]
    StaleNonce { current: u64, got: u64 },
    #[error("Insufficient funds: need {needed} sats, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("Pool is shutting down")]
    ShuttingDown,
    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Clone)]
struct PoolEntry {
    tx: Transaction,
    size: usize,
    /// Unix ms when the entry was admitted
    received_at: u64,
}

/// Capacity and expiry knobs, normally sourced from [`crate::config`].
#[derive(Clone, Debug)]
pub struct MempoolLimits {
    pub max_count: usize,
    pub max_size_bytes: usize,
    pub expiration_ms: u64,
}

impl Default for MempoolLimits {
    fn default() -> Self {
        use crate::constants::mempool::*;
        Self {
            max_count: MAX_COUNT,
            max_size_bytes: MAX_SIZE_BYTES,
            expiration_ms: EXPIRATION_MS,
        }
    }
}

const MIRROR_KEY: &[u8] = b"mempool:pending";

pub struct Mempool {
    entries: DashMap<Hash256, PoolEntry>,
    /// address -> hashes of its pending transactions
    by_sender: DashMap<String, Vec<Hash256>>,
    count: AtomicUsize,
    bytes: AtomicUsize,
    limits: MempoolLimits,
    accepting: AtomicBool,
    events: EventBus,
}

impl Mempool {
    pub fn new(limits: MempoolLimits, events: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            by_sender: DashMap::new(),
            count: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            limits,
            accepting: AtomicBool::new(true),
            events,
        }
    }

    /// Admit a transaction. `state` is the best-known chain state used
    /// for the light nonce/balance policy.
    pub fn add(&self, tx: Transaction, state: &ChainState, now_ms: u64) -> Result<Hash256, PoolError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(PoolError::ShuttingDown);
        }

        let hash = tx.hash;
        let outcome = self.admit(tx, state, now_ms);
        match &outcome {
            Ok(hash) => self.events.emit(NodeEvent::TransactionAccepted { hash: *hash }),
            Err(e) => {
                // Duplicates are rejected idempotently and quietly; every
                // other rejection is surfaced as an event.
                if !matches!(e, PoolError::AlreadyExists) {
                    debug!("Mempool rejected transaction {}: {e}", hex::encode(hash));
                    self.events.emit(NodeEvent::TransactionRejected {
                        hash,
                        reason: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    fn admit(&self, tx: Transaction, state: &ChainState, now_ms: u64) -> Result<Hash256, PoolError> {
        let hash = tx.hash;

        if self.entries.contains_key(&hash) {
            return Err(PoolError::AlreadyExists);
        }

        if tx.is_coinbase() {
            return Err(PoolError::InvalidStructure(
                "coinbase transactions are not relayed".to_string(),
            ));
        }
        if tx.amount == 0 {
            return Err(PoolError::InvalidStructure("zero amount".to_string()));
        }
        if tx.sender.is_empty() || tx.recipient.is_empty() {
            return Err(PoolError::InvalidStructure("empty address".to_string()));
        }
        if hash != tx.compute_hash() {
            return Err(PoolError::InvalidStructure("hash mismatch".to_string()));
        }
        if !tx.verify_signature() {
            return Err(PoolError::InvalidSignature);
        }

        // Light admission policy; apply_block re-checks authoritatively.
        let current_nonce = state.nonce(&tx.sender);
        if tx.nonce <= current_nonce {
            return Err(PoolError::StaleNonce {
                current: current_nonce,
                got: tx.nonce,
            });
        }
        let needed = tx.amount.saturating_add(tx.fee);
        let available = state.balance(&tx.sender);
        if available < needed {
            return Err(PoolError::InsufficientFunds { needed, available });
        }

        let size = tx.size_bytes();
        self.make_room(&tx, size)?;

        let entry = PoolEntry {
            tx,
            size,
            received_at: now_ms,
        };
        self.by_sender
            .entry(entry.tx.sender.clone())
            .or_default()
            .push(hash);
        self.entries.insert(hash, entry);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        Ok(hash)
    }

    /// Evict the lowest-priority entry when at capacity. The incoming
    /// transaction must outbid the floor or the pool reports full.
    fn make_room(&self, incoming: &Transaction, incoming_size: usize) -> Result<(), PoolError> {
        loop {
            let count = self.count.load(Ordering::Relaxed);
            let bytes = self.bytes.load(Ordering::Relaxed);
            if count < self.limits.max_count && bytes + incoming_size <= self.limits.max_size_bytes
            {
                return Ok(());
            }

            // Floor = lowest fee, oldest first among equals.
            let floor = self
                .entries
                .iter()
                .min_by(|a, b| {
                    a.value()
                        .tx
                        .fee
                        .cmp(&b.value().tx.fee)
                        .then(a.value().received_at.cmp(&b.value().received_at))
                })
                .map(|e| (*e.key(), e.value().tx.fee));

            let Some((victim, floor_fee)) = floor else {
                // Pool is empty yet over limits: the incoming entry alone
                // exceeds max_size_bytes.
                return Err(PoolError::PoolFull);
            };
            if incoming.fee <= floor_fee {
                return Err(PoolError::PoolFull);
            }
            if self.remove_entry(&victim).is_some() {
                info!("🗑️  Evicted transaction {} (fee floor)", hex::encode(victim));
                self.events.emit(NodeEvent::TransactionEvicted { hash: victim });
            }
        }
    }

    fn remove_entry(&self, hash: &Hash256) -> Option<Transaction> {
        let (_, entry) = self.entries.remove(hash)?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
        if let Some(mut hashes) = self.by_sender.get_mut(&entry.tx.sender) {
            hashes.retain(|h| h != hash);
        }
        self.by_sender
            .remove_if(&entry.tx.sender, |_, hashes| hashes.is_empty());
        Some(entry.tx)
    }

    /// Drain up to `max_count`/`max_bytes` of the best transactions for a
    /// block: fee descending, timestamp ascending among equal fees, and
    /// strictly ascending nonces within a sender. The pool keeps the
    /// entries; the producer removes them once the block is applied.
    pub fn take(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        // Per-sender queues keyed by nonce; candidates are each sender's
        // lowest pending nonce so nonce order can never be violated.
        let mut queues: BTreeMap<String, BTreeMap<u64, (Transaction, usize, u64)>> =
            BTreeMap::new();
        for entry in self.entries.iter() {
            let e = entry.value();
            queues
                .entry(e.tx.sender.clone())
                .or_default()
                .insert(e.tx.nonce, (e.tx.clone(), e.size, e.received_at));
        }

        let mut selected = Vec::new();
        let mut total_bytes = 0usize;
        while selected.len() < max_count {
            let best_sender = queues
                .iter()
                .filter_map(|(sender, q)| q.first_key_value().map(|(_, v)| (sender, v)))
                .max_by(|(_, a), (_, b)| {
                    a.0.fee
                        .cmp(&b.0.fee)
                        .then(b.0.timestamp.cmp(&a.0.timestamp))
                })
                .map(|(sender, _)| sender.clone());
            let Some(sender) = best_sender else { break };

            let queue = queues.get_mut(&sender).expect("sender queue exists");
            let (_, (tx, size, _)) = queue.pop_first().expect("non-empty queue");
            if queue.is_empty() {
                queues.remove(&sender);
            }
            if total_bytes + size > max_bytes {
                // Entry does not fit; skip this sender's chain entirely
                // (later nonces cannot jump the queue).
                queues.remove(&sender);
                continue;
            }
            total_bytes += size;
            selected.push(tx);
        }
        selected
    }

    /// Remove transactions included in an applied block.
    pub fn remove_included(&self, hashes: &[Hash256]) {
        let mut removed = 0;
        for hash in hashes {
            if self.remove_entry(hash).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("🧹 Removed {removed} included transaction(s) from mempool");
        }
    }

    /// Prune entries older than the configured expiry. Returns the
    /// number pruned.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let stale: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|e| now_ms.saturating_sub(e.value().received_at) > self.limits.expiration_ms)
            .map(|e| *e.key())
            .collect();

        let mut pruned = 0;
        for hash in stale {
            if self.remove_entry(&hash).is_some() {
                self.events.emit(NodeEvent::TransactionExpired { hash });
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!("🧹 Pruned {pruned} expired transaction(s) from mempool");
        }
        pruned
    }

    /// Pending transactions of one address, nonce ascending.
    pub fn pending_for(&self, address: &str) -> Vec<Transaction> {
        let Some(hashes) = self.by_sender.get(address) else {
            return Vec::new();
        };
        let mut txs: Vec<Transaction> = hashes
            .iter()
            .filter_map(|h| self.entries.get(h).map(|e| e.tx.clone()))
            .collect();
        txs.sort_by_key(|tx| tx.nonce);
        txs
    }

    pub fn get(&self, hash: &Hash256) -> Option<Transaction> {
        self.entries.get(hash).map(|e| e.tx.clone())
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Stop admitting new entries (shutdown sequencing).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Persist the pending set into the durable mirror. Best-effort:
    /// losing the mirror is not a consensus failure.
    pub fn persist_mirror(&self, db: &sled::Db) -> Result<(), PoolError> {
        let pending: Vec<Transaction> = self.entries.iter().map(|e| e.value().tx.clone()).collect();
        let bytes = bincode::serialize(&pending).map_err(|e| PoolError::Storage(e.to_string()))?;
        db.insert(MIRROR_KEY, bytes)
            .map_err(|e| PoolError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Replay the mirror through full admission, dropping anything the
    /// current state no longer accepts.
    pub fn load_mirror(&self, db: &sled::Db, state: &ChainState, now_ms: u64) -> usize {
        let Ok(Some(bytes)) = db.get(MIRROR_KEY) else {
            return 0;
        };
        let pending: Vec<Transaction> = match bincode::deserialize(&bytes) {
            Ok(txs) => txs,
            Err(e) => {
                warn!("Mempool mirror is unreadable, starting empty: {e}");
                return 0;
            }
        };

        let mut restored = 0;
        for tx in pending {
            if self.admit(tx, state, now_ms).is_ok() {
                restored += 1;
            }
        }
        if restored > 0 {
            info!("📂 Restored {restored} transaction(s) from mempool mirror");
        }
        restored
    }
}
