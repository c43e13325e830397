//! Mempool integration: ordering for block inclusion, idempotent
//! duplicates, capacity eviction, expiry and the durable mirror.

use std::collections::HashMap;
use std::sync::Arc;

use bt2c::constants::consensus::SATS_PER_BT2C;
use bt2c::crypto::Keypair;
use bt2c::events::{EventBus, NodeEvent};
use bt2c::mempool::{Mempool, MempoolLimits, PoolError};
use bt2c::state::ChainState;
use bt2c::types::{now_ms, Account, Transaction, ZERO_HASH};

fn funded_state(keys: &[&Keypair]) -> ChainState {
    let mut accounts = HashMap::new();
    for kp in keys {
        let mut account = Account::new(kp.address(), 0);
        account.balance = 10_000 * SATS_PER_BT2C;
        accounts.insert(kp.address(), account);
    }
    ChainState {
        accounts,
        current_height: 0,
        genesis_applied: true,
        last_block_hash: ZERO_HASH,
        total_supply: 0,
        developer_node_set: false,
    }
}

fn transfer(kp: &Keypair, nonce: u64, fee: u64) -> Transaction {
    let mut tx = Transaction::new(kp.address(), "bt2c_sink".into(), SATS_PER_BT2C, fee, nonce);
    tx.sign(kp);
    tx
}

#[test]
fn fee_ordering_for_block_inclusion() {
    // Three senders with fees 0.1 / 0.5 / 0.2 BT2C: take(2) must return
    // the 0.5 then the 0.2 transaction.
    let a = Keypair::generate();
    let b = Keypair::generate();
    let c = Keypair::generate();
    let state = funded_state(&[&a, &b, &c]);
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());

    pool.add(transfer(&a, 1, SATS_PER_BT2C / 10), &state, 1_000)
        .unwrap();
    pool.add(transfer(&b, 1, SATS_PER_BT2C / 2), &state, 2_000)
        .unwrap();
    pool.add(transfer(&c, 1, SATS_PER_BT2C / 5), &state, 3_000)
        .unwrap();

    let picked = pool.take(2, usize::MAX);
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0].fee, SATS_PER_BT2C / 2);
    assert_eq!(picked[1].fee, SATS_PER_BT2C / 5);
}

#[test]
fn equal_fees_break_ties_by_age() {
    let a = Keypair::generate();
    let b = Keypair::generate();
    let state = funded_state(&[&a, &b]);
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());

    // Same fee; `b` carries the older creation timestamp.
    let mut old = Transaction::new(b.address(), "bt2c_sink".into(), SATS_PER_BT2C, 100, 1);
    old.timestamp -= 60_000;
    old.sign(&b);
    let young = transfer(&a, 1, 100);

    pool.add(young, &state, 1_000).unwrap();
    pool.add(old.clone(), &state, 1_000).unwrap();

    let picked = pool.take(1, usize::MAX);
    assert_eq!(picked[0].hash, old.hash);
}

#[test]
fn duplicate_submission_keeps_one_entry() {
    let kp = Keypair::generate();
    let state = funded_state(&[&kp]);
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());

    let tx = transfer(&kp, 1, 50);
    pool.add(tx.clone(), &state, now_ms()).unwrap();
    let err = pool.add(tx.clone(), &state, now_ms()).unwrap_err();
    assert!(matches!(err, PoolError::AlreadyExists));

    assert_eq!(pool.len(), 1);
    assert_eq!(pool.get(&tx.hash).unwrap().hash, tx.hash);
}

#[test]
fn per_sender_nonce_chain_survives_take() {
    let kp = Keypair::generate();
    let rich = Keypair::generate();
    let state = funded_state(&[&kp, &rich]);
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());

    // kp's nonce 2 pays more than its nonce 1; rich pays most of all.
    pool.add(transfer(&kp, 2, 10_000), &state, 1_000).unwrap();
    pool.add(transfer(&kp, 1, 10), &state, 1_000).unwrap();
    pool.add(transfer(&rich, 1, 50_000), &state, 1_000).unwrap();

    let picked = pool.take(3, usize::MAX);
    let kp_nonces: Vec<u64> = picked
        .iter()
        .filter(|tx| tx.sender == kp.address())
        .map(|tx| tx.nonce)
        .collect();
    assert_eq!(kp_nonces, vec![1, 2], "nonces must come out ascending");
    assert_eq!(picked[0].sender, rich.address(), "highest fee head first");
}

#[test]
fn eviction_drops_cheapest_and_reports() {
    let limits = MempoolLimits {
        max_count: 2,
        ..MempoolLimits::default()
    };
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let pool = Mempool::new(limits, events);

    let keys: Vec<Keypair> = (0..3).map(|_| Keypair::generate()).collect();
    let refs: Vec<&Keypair> = keys.iter().collect();
    let state = funded_state(&refs);

    let cheap = transfer(&keys[0], 1, 10);
    pool.add(cheap.clone(), &state, 1_000).unwrap();
    pool.add(transfer(&keys[1], 1, 100), &state, 1_000).unwrap();
    pool.add(transfer(&keys[2], 1, 1_000), &state, 2_000).unwrap();

    assert_eq!(pool.len(), 2);
    assert!(!pool.contains(&cheap.hash));

    // Accept, accept, evict, accept — the eviction event names the victim.
    let mut saw_eviction = false;
    while let Ok(event) = rx.try_recv() {
        if let NodeEvent::TransactionEvicted { hash } = event {
            assert_eq!(hash, cheap.hash);
            saw_eviction = true;
        }
    }
    assert!(saw_eviction);
}

#[test]
fn expired_entries_are_swept() {
    let kp = Keypair::generate();
    let state = funded_state(&[&kp]);
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());

    pool.add(transfer(&kp, 1, 10), &state, 1_000).unwrap();
    pool.add(transfer(&kp, 2, 10), &state, 7_200_000).unwrap();

    let cutoff = 1_000 + bt2c::constants::mempool::EXPIRATION_MS + 1;
    assert_eq!(pool.sweep_expired(cutoff), 1);
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.pending_for(&kp.address())[0].nonce, 2);
}

#[test]
fn mirror_restores_pending_set_across_restart() {
    let kp = Keypair::generate();
    let state = funded_state(&[&kp]);
    let db = sled::Config::new().temporary(true).open().unwrap();

    let tx1 = transfer(&kp, 1, 10);
    let tx2 = transfer(&kp, 2, 20);
    {
        let pool = Mempool::new(MempoolLimits::default(), EventBus::new());
        pool.add(tx1.clone(), &state, 1_000).unwrap();
        pool.add(tx2.clone(), &state, 1_000).unwrap();
        pool.persist_mirror(&db).unwrap();
    }

    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());
    assert_eq!(pool.load_mirror(&db, &state, 2_000), 2);
    assert!(pool.contains(&tx1.hash));
    assert!(pool.contains(&tx2.hash));

    // A second submit of a mirrored tx is still the same single entry.
    assert!(matches!(
        pool.add(tx1, &state, 2_000).unwrap_err(),
        PoolError::AlreadyExists
    ));
    assert_eq!(pool.len(), 2);
}

#[test]
fn mirror_drops_entries_the_chain_outran() {
    let kp = Keypair::generate();
    let mut state = funded_state(&[&kp]);
    let db = sled::Config::new().temporary(true).open().unwrap();

    {
        let pool = Mempool::new(MempoolLimits::default(), EventBus::new());
        pool.add(transfer(&kp, 1, 10), &state, 1_000).unwrap();
        pool.add(transfer(&kp, 2, 10), &state, 1_000).unwrap();
        pool.persist_mirror(&db).unwrap();
    }

    // Nonce 1 landed in a block while the node was down.
    state.accounts.get_mut(&kp.address()).unwrap().nonce = 1;
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());
    assert_eq!(pool.load_mirror(&db, &state, 2_000), 1);
    assert_eq!(pool.pending_for(&kp.address())[0].nonce, 2);
}

#[test]
fn byte_budget_respected_by_take() {
    let keys: Vec<Keypair> = (0..5).map(|_| Keypair::generate()).collect();
    let refs: Vec<&Keypair> = keys.iter().collect();
    let state = funded_state(&refs);
    let pool = Mempool::new(MempoolLimits::default(), EventBus::new());

    let mut sizes = Vec::new();
    for (i, kp) in keys.iter().enumerate() {
        let tx = transfer(kp, 1, 1_000 - i as u64);
        sizes.push(tx.size_bytes());
        pool.add(tx, &state, 1_000).unwrap();
    }

    let budget = sizes[0] + sizes[1];
    let picked = pool.take(10, budget);
    let total: usize = picked.iter().map(|tx| tx.size_bytes()).sum();
    assert!(total <= budget);
    assert_eq!(picked.len(), 2);
}

#[test]
fn shared_pool_is_send_sync() {
    // The pool is shared between the producer, sweeper and persistence
    // tasks; it must be usable behind an Arc across threads.
    fn assert_shareable<T: Send + Sync>(_: &T) {}
    let pool = Arc::new(Mempool::new(MempoolLimits::default(), EventBus::new()));
    assert_shareable(&pool);
}
