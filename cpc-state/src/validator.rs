use cpc_core::{AccountAddress, Amount, ConsensusAddress, ValidatorMetadata, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};

/// Default commission applied when a STAKE creates a new validator.
pub const DEFAULT_COMMISSION_BPS: u64 = 1_000;

/// Weight of the uptime term in the performance score, in bps.
const UPTIME_WEIGHT_BPS: u64 = 6_000;
const STAKE_WEIGHT_BPS: u64 = 2_000;
const PENALTY_WEIGHT_BPS: u64 = 2_000;
/// Cap on the penalty ratio term.
const PENALTY_RATIO_CAP_BPS: u64 = 5_000;

/// An individually tracked delegation inside a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub delegator: AccountAddress,
    pub amount: Amount,
    pub created_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub consensus_addr: ConsensusAddress,
    pub operator: AccountAddress,
    pub pubkey: String,
    pub self_stake: Amount,
    pub total_delegated: Amount,
    /// Always `self_stake + total_delegated`.
    pub power: Amount,
    pub commission_rate_bps: u64,
    pub metadata: ValidatorMetadata,
    pub delegations_in: Vec<Delegation>,
    // Performance tracking.
    pub blocks_proposed: u64,
    pub blocks_expected: u64,
    /// Consecutive misses; reset on proposing and on unjail.
    pub missed_blocks: u64,
    pub last_seen_height: u64,
    pub uptime_score_bps: u64,
    pub performance_score_bps: u64,
    // Penalties and status.
    pub total_penalties: Amount,
    pub jail_count: u32,
    pub jailed_until_height: u64,
    pub is_active: bool,
    pub joined_height: u64,
}

impl Validator {
    pub fn new(
        consensus_addr: ConsensusAddress,
        operator: AccountAddress,
        pubkey: String,
        self_stake: Amount,
        joined_height: u64,
    ) -> Self {
        Self {
            consensus_addr,
            operator,
            pubkey,
            self_stake,
            total_delegated: Amount::zero(),
            power: self_stake,
            commission_rate_bps: DEFAULT_COMMISSION_BPS,
            metadata: ValidatorMetadata::default(),
            delegations_in: Vec::new(),
            blocks_proposed: 0,
            blocks_expected: 0,
            missed_blocks: 0,
            last_seen_height: joined_height,
            uptime_score_bps: 0,
            performance_score_bps: 0,
            total_penalties: Amount::zero(),
            jail_count: 0,
            jailed_until_height: 0,
            is_active: false,
            joined_height,
        }
    }

    pub fn is_jailed(&self, current_height: u64) -> bool {
        self.jailed_until_height > current_height
    }

    pub fn is_ejected(&self, ejection_threshold: u32) -> bool {
        self.jail_count >= ejection_threshold
    }

    /// Aggregate delegation position for one delegator, if any.
    pub fn delegation_of(&self, delegator: &AccountAddress) -> Option<&Delegation> {
        self.delegations_in.iter().find(|d| &d.delegator == delegator)
    }

    pub fn delegation_of_mut(&mut self, delegator: &AccountAddress) -> Option<&mut Delegation> {
        self.delegations_in.iter_mut().find(|d| &d.delegator == delegator)
    }

    /// `blocks_proposed / max(blocks_expected, 1)` in bps, clamped.
    pub fn compute_uptime_bps(&self) -> u64 {
        let expected = self.blocks_expected.max(1);
        ((self.blocks_proposed.saturating_mul(BPS_DENOMINATOR)) / expected).min(BPS_DENOMINATOR)
    }

    /// `0.6*uptime + 0.2*stake_ratio + 0.2*(1 − penalty_ratio)`, all terms
    /// integer basis points.
    pub fn compute_performance_bps(&self, total_staked_power: Amount) -> u64 {
        let uptime = self.compute_uptime_bps();
        let stake_ratio = if total_staked_power.is_zero() {
            0
        } else {
            // power and total fit the bps product in U256; narrow at the end.
            (self.power * cpc_core::Amount::from(BPS_DENOMINATOR) / total_staked_power)
                .min(cpc_core::Amount::from(BPS_DENOMINATOR))
                .as_u64()
        };
        let penalty_ratio = if self.power.is_zero() {
            PENALTY_RATIO_CAP_BPS
        } else {
            (self.total_penalties * cpc_core::Amount::from(BPS_DENOMINATOR) / self.power)
                .min(cpc_core::Amount::from(PENALTY_RATIO_CAP_BPS))
                .as_u64()
        };
        (UPTIME_WEIGHT_BPS * uptime
            + STAKE_WEIGHT_BPS * stake_ratio
            + PENALTY_WEIGHT_BPS * (BPS_DENOMINATOR - penalty_ratio))
            / BPS_DENOMINATOR
    }

    /// Refresh the stored scores; called at epoch boundaries.
    pub fn update_scores(&mut self, total_staked_power: Amount) {
        self.uptime_score_bps = self.compute_uptime_bps();
        self.performance_score_bps = self.compute_performance_bps(total_staked_power);
    }
}
