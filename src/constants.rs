//! Global constants for the BT2C blockchain
//!
//! Centralizes all protocol constants. The reputation and selection
//! numbers are consensus-critical: every node must compute them
//! identically, so they live here and nowhere else.

/// Consensus protocol constants
pub mod consensus {
    /// 1 BT2C = 10^8 satoshis. All balances, stakes, fees and rewards are
    /// integer satoshi amounts; floating point never touches the supply path.
    pub const SATS_PER_BT2C: u64 = 100_000_000;

    /// Initial block reward (21 BT2C)
    pub const INITIAL_REWARD_SATS: u64 = 21 * SATS_PER_BT2C;

    /// Reward floor after halvings (1 satoshi)
    pub const MIN_REWARD_SATS: u64 = 1;

    /// Blocks between reward halvings
    pub const HALVING_INTERVAL_BLOCKS: u64 = 210_000;

    /// Hard supply cap (21,000,000 BT2C)
    pub const MAX_SUPPLY_SATS: u64 = 21_000_000 * SATS_PER_BT2C;

    /// Minimum stake to register and stay eligible (1 BT2C)
    pub const MIN_STAKE_SATS: u64 = SATS_PER_BT2C;

    /// Misses beyond this threshold jail a validator
    pub const MAX_MISSED_BLOCKS: u64 = 50;

    /// How long a jailed validator stays ineligible (1 day)
    pub const DEFAULT_JAIL_DURATION_MS: u64 = 86_400_000;

    /// Reputation starts at 100 and is clamped to [0, 200]
    pub const REPUTATION_START: f64 = 100.0;
    pub const REPUTATION_MIN: f64 = 0.0;
    pub const REPUTATION_MAX: f64 = 200.0;

    /// Selection weight multiplier = 0.5 + reputation / 133.33,
    /// clamped to [0.5, 2.0]. The divisor is consensus-critical and must
    /// not be "simplified" to a nicer number.
    pub const REPUTATION_MULTIPLIER_DIVISOR: f64 = 133.33;
    pub const REPUTATION_MULTIPLIER_MIN: f64 = 0.5;
    pub const REPUTATION_MULTIPLIER_MAX: f64 = 2.0;

    /// Per-slot reputation deltas
    pub const PRODUCED_REPUTATION_DELTA: f64 = 1.0;
    pub const MISSED_REPUTATION_DELTA: f64 = -5.0;

    /// Accuracy/uptime terms: (value_percent - PIVOT) / DIVISOR
    pub const PERFORMANCE_PIVOT_PERCENT: f64 = 95.0;
    pub const PERFORMANCE_DIVISOR: f64 = 5.0;

    /// Distribution window: 14 days from genesis
    pub const DISTRIBUTION_PERIOD_MS: u64 = 14 * 24 * 3_600_000;

    /// One-time developer-node reward (100 BT2C)
    pub const DEVELOPER_REWARD_SATS: u64 = 100 * SATS_PER_BT2C;

    /// One-time early-validator reward (1 BT2C)
    pub const EARLY_VALIDATOR_REWARD_SATS: u64 = SATS_PER_BT2C;

    /// Target block time (5 minutes)
    pub const TARGET_BLOCK_TIME_MS: u64 = 300_000;

    /// A selected proposer forfeits its slot after this long
    pub const PROPOSER_TIMEOUT_MS: u64 = 30_000;

    /// Voting timeout (advisory; the core protocol is single-proposer)
    pub const VOTING_TIMEOUT_MS: u64 = 15_000;

    /// Depth after which observers treat a block as final (advisory only)
    pub const FINALITY_DEPTH: u64 = 6;

    /// Maximum clock drift accepted on incoming block timestamps
    pub const TIMESTAMP_TOLERANCE_MS: u64 = 60_000;

    /// Sentinel sender address of coinbase transactions
    pub const COINBASE_SENDER: &str = "0";

    /// Maximum serialized block size (1 MB)
    pub const MAX_BLOCK_BYTES: usize = 1_000_000;

    /// Maximum transactions drained into one block
    pub const MAX_BLOCK_TXS: usize = 1_000;
}

/// Mempool limits and housekeeping intervals
pub mod mempool {
    /// Maximum pending transactions
    pub const MAX_COUNT: usize = 10_000;

    /// Maximum pending bytes (100 MB)
    pub const MAX_SIZE_BYTES: usize = 100 * 1024 * 1024;

    /// Entries older than this are pruned (24 hours)
    pub const EXPIRATION_MS: u64 = 24 * 3_600_000;

    /// How often the sweeper task runs
    pub const SWEEP_INTERVAL_MS: u64 = 60_000;

    /// How often the durable mirror is rewritten
    pub const PERSISTENCE_INTERVAL_MS: u64 = 30_000;
}

/// Block store layout
pub mod storage {
    /// Append-only log of `{length(u32 LE) || bincode block}` records
    pub const DATA_FILE: &str = "blocks.dat";

    /// Index of `{height(u64 LE) || offset(u64 LE) || hash(32B)}` records
    pub const INDEX_FILE: &str = "blocks.idx";

    /// Bytes per index record
    pub const INDEX_RECORD_BYTES: usize = 48;

    /// Range queries are bounded to this many blocks
    pub const MAX_RANGE: u64 = 100;
}
