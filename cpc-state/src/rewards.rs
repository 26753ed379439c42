//! Block reward minting and proportional distribution.
//!
//! Every block mints `block_reward`. The miner fraction accrues to the
//! treasury account, which holds the compute-miner pool until the
//! out-of-process payout subsystem drains it. The rest is split across the
//! active validators proportionally to power; within a validator's share
//! the operator keeps the commission plus the self-stake portion, and
//! delegators receive the remainder pro-rata. All division floors;
//! residuals are burned.

use crate::account::RewardRecord;
use crate::ChainState;
use cpc_core::{mul_bps, AccountAddress, Amount, ConsensusAddress};

impl ChainState {
    pub(crate) fn distribute_block_rewards(&mut self, height: u64) {
        let reward = self.params.block_reward;
        if reward.is_zero() {
            return;
        }
        self.total_minted += reward;
        let miner_share = mul_bps(reward, self.params.miner_reward_bps);
        let validator_pool = reward - miner_share;
        if !miner_share.is_zero() {
            self.account_mut(&AccountAddress::treasury()).balance += miner_share;
        }

        let eligible: Vec<ConsensusAddress> = self
            .active_set
            .iter()
            .filter(|addr| {
                self.validators
                    .get(addr)
                    .map(|v| v.is_active && !v.power.is_zero())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let total_power: Amount = eligible
            .iter()
            .fold(Amount::zero(), |acc, a| acc + self.validators[a].power);
        if total_power.is_zero() {
            // Nobody to pay; the pool burns rather than silently vanishing.
            self.burn(validator_pool);
            return;
        }

        let epoch = if self.params.epoch_length_blocks == 0 {
            0
        } else {
            height / self.params.epoch_length_blocks
        };

        let mut credits: Vec<(AccountAddress, Amount)> = Vec::new();
        let mut distributed = Amount::zero();
        for addr in &eligible {
            let v = &self.validators[addr];
            let share = validator_pool * v.power / total_power;
            let commission = mul_bps(share, v.commission_rate_bps);
            let pool = share - commission;
            let operator_part = pool * v.self_stake / v.power;
            distributed += commission + operator_part;
            credits.push((v.operator.clone(), commission + operator_part));
            for d in &v.delegations_in {
                let part = pool * d.amount / v.power;
                distributed += part;
                credits.push((d.delegator.clone(), part));
            }
        }
        // Floor residue from every division above.
        self.burn(validator_pool - distributed);

        for (addr, amount) in credits {
            if amount.is_zero() {
                continue;
            }
            let account = self.account_mut(&addr);
            account.balance += amount;
            account.reward_history.push(RewardRecord { epoch, amount });
        }
    }
}
