//! Validator record, lifecycle states and reputation math.

use serde::{Deserialize, Serialize};

use crate::constants::consensus::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorState {
    Active,
    Inactive,
    Jailed,
    /// Terminal. A tombstoned address can never validate again.
    Tombstoned,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Validator {
    pub address: String,
    pub public_key: Vec<u8>,
    /// Satoshis escrowed from the owner's account
    pub stake: u64,
    pub moniker: String,
    pub state: ValidatorState,
    /// Bounded to [0, 200]; starts at 100
    pub reputation: f64,
    pub blocks_produced: u64,
    pub blocks_missed: u64,
    /// Percentage of allotted slots actually produced
    pub uptime: f64,
    /// Unix ms of the last produced block
    pub last_active: u64,
    /// Unix ms until which a jailed validator stays ineligible
    pub jailed_until: u64,
    pub is_first_validator: bool,
    pub joined_during_distribution: bool,
    pub distribution_reward_claimed: bool,
}

impl Validator {
    pub fn new(
        address: String,
        public_key: Vec<u8>,
        stake: u64,
        moniker: String,
        now_ms: u64,
        joined_during_distribution: bool,
    ) -> Self {
        Self {
            address,
            public_key,
            stake,
            moniker,
            state: ValidatorState::Inactive,
            reputation: REPUTATION_START,
            blocks_produced: 0,
            blocks_missed: 0,
            uptime: 100.0,
            last_active: now_ms,
            jailed_until: 0,
            is_first_validator: false,
            joined_during_distribution,
            distribution_reward_claimed: false,
        }
    }

    /// Active, sufficiently staked, and past any jail deadline.
    pub fn is_eligible(&self, now_ms: u64) -> bool {
        self.state == ValidatorState::Active
            && self.stake >= MIN_STAKE_SATS
            && now_ms >= self.jailed_until
    }

    /// Selection weight multiplier: 0.5 + reputation / 133.33, clamped.
    pub fn reputation_multiplier(&self) -> f64 {
        (REPUTATION_MULTIPLIER_MIN + self.reputation / REPUTATION_MULTIPLIER_DIVISOR)
            .clamp(REPUTATION_MULTIPLIER_MIN, REPUTATION_MULTIPLIER_MAX)
    }

    /// Produced / allotted slots, in percent. 100 with no history.
    pub fn accuracy(&self) -> f64 {
        let total = self.blocks_produced + self.blocks_missed;
        if total == 0 {
            100.0
        } else {
            self.blocks_produced as f64 / total as f64 * 100.0
        }
    }

    fn refresh_uptime(&mut self) {
        self.uptime = self.accuracy();
    }

    pub(crate) fn note_produced(&mut self, now_ms: u64) {
        self.blocks_produced += 1;
        self.last_active = now_ms;
        self.refresh_uptime();
    }

    /// Returns true when this miss pushed the validator over the jail
    /// threshold.
    pub(crate) fn note_missed(&mut self) -> bool {
        self.blocks_missed += 1;
        self.refresh_uptime();
        self.blocks_missed > MAX_MISSED_BLOCKS
    }

    /// Reputation update after a slot:
    /// `R' = clamp(R + delta + (accuracy-95)/5 + (uptime-95)/5, 0, 200)`.
    /// The constants are consensus-critical; see `constants::consensus`.
    pub fn apply_reputation(&mut self, produced: bool) {
        let delta = if produced {
            PRODUCED_REPUTATION_DELTA
        } else {
            MISSED_REPUTATION_DELTA
        };
        let accuracy_term =
            (self.accuracy() - PERFORMANCE_PIVOT_PERCENT) / PERFORMANCE_DIVISOR;
        let uptime_term = (self.uptime - PERFORMANCE_PIVOT_PERCENT) / PERFORMANCE_DIVISOR;
        self.reputation = (self.reputation + delta + accuracy_term + uptime_term)
            .clamp(REPUTATION_MIN, REPUTATION_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(
            "bt2c_v1".into(),
            vec![0u8; 32],
            2 * SATS_PER_BT2C,
            "node-1".into(),
            1_000,
            false,
        )
    }

    #[test]
    fn test_new_validator_defaults() {
        let v = validator();
        assert_eq!(v.state, ValidatorState::Inactive);
        assert_eq!(v.reputation, REPUTATION_START);
        assert_eq!(v.uptime, 100.0);
        assert!(!v.distribution_reward_claimed);
    }

    #[test]
    fn test_eligibility() {
        let mut v = validator();
        assert!(!v.is_eligible(2_000));

        v.state = ValidatorState::Active;
        assert!(v.is_eligible(2_000));

        v.stake = MIN_STAKE_SATS - 1;
        assert!(!v.is_eligible(2_000));

        v.stake = MIN_STAKE_SATS;
        v.jailed_until = 10_000;
        assert!(!v.is_eligible(2_000));
        assert!(v.is_eligible(10_000));
    }

    #[test]
    fn test_reputation_multiplier_bounds() {
        let mut v = validator();
        v.reputation = 0.0;
        assert_eq!(v.reputation_multiplier(), 0.5);

        v.reputation = 200.0;
        assert_eq!(v.reputation_multiplier(), 2.0);

        v.reputation = 100.0;
        let mid = v.reputation_multiplier();
        assert!(mid > 1.24 && mid < 1.26, "got {mid}");
    }

    #[test]
    fn test_reputation_stays_bounded() {
        let mut v = validator();
        for _ in 0..500 {
            v.note_produced(1_000);
            v.apply_reputation(true);
            assert!(v.reputation <= REPUTATION_MAX);
        }
        for _ in 0..500 {
            v.note_missed();
            v.apply_reputation(false);
            assert!(v.reputation >= REPUTATION_MIN);
        }
    }

    #[test]
    fn test_miss_threshold() {
        let mut v = validator();
        for _ in 0..MAX_MISSED_BLOCKS {
            assert!(!v.note_missed());
        }
        assert!(v.note_missed());
    }

    #[test]
    fn test_uptime_tracks_counters() {
        let mut v = validator();
        v.note_produced(1_000);
        v.note_produced(1_000);
        v.note_missed();
        assert!((v.uptime - 66.666).abs() < 0.01);
    }
}
