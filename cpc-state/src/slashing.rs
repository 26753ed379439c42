//! Jailing and graduated slashing: 5% on the first jail, 10% on the
//! second, full ejection on the third.
//!
//! Ejection policy (documented decision): the validator's remaining
//! self-stake burns in full and every delegation is returned to its
//! delegator through an immediate-maturity unbonding entry. Unbonding
//! entries created before the ejection are untouched.

use crate::account::UnbondingEntry;
use crate::ChainState;
use cpc_core::{mul_bps, AccountAddress, Amount, ConsensusAddress, BPS_DENOMINATOR};
use tracing::warn;

impl ChainState {
    /// Jail `addr` after it crossed the sequential-miss threshold.
    pub(crate) fn jail_validator(&mut self, addr: &ConsensusAddress, current_height: u64) {
        let threshold = self.params.ejection_threshold_jails;
        let base_bps = self.params.slashing_base_rate_bps;
        let jail_duration = self.params.jail_duration_blocks;

        let (rate_bps, ejecting) = match self.validators.get(addr) {
            Some(v) if !v.is_ejected(threshold) => {
                let rate = match v.jail_count {
                    0 => base_bps,
                    1 => 2 * base_bps,
                    _ => BPS_DENOMINATOR,
                };
                (rate, v.jail_count + 1 >= threshold)
            }
            _ => return,
        };
        if ejecting {
            self.eject_validator(addr, current_height);
            return;
        }

        let mut emptied_delegators: Vec<AccountAddress> = Vec::new();
        let (penalty, jail_count) = {
            let Some(v) = self.validators.get_mut(addr) else {
                return;
            };
            let penalty = mul_bps(v.power, rate_bps).min(v.power);
            // Self-stake absorbs the penalty first; any shortfall is
            // prorated across delegations, largest first.
            let from_self = penalty.min(v.self_stake);
            v.self_stake -= from_self;
            let shortfall = penalty - from_self;
            if !shortfall.is_zero() {
                let total_delegated = v.total_delegated;
                let mut order: Vec<usize> = (0..v.delegations_in.len()).collect();
                order.sort_by(|&a, &b| {
                    v.delegations_in[b]
                        .amount
                        .cmp(&v.delegations_in[a].amount)
                        .then(v.delegations_in[a].delegator.cmp(&v.delegations_in[b].delegator))
                });
                let mut cuts: Vec<Amount> = v
                    .delegations_in
                    .iter()
                    .map(|d| d.amount * shortfall / total_delegated)
                    .collect();
                let mut remaining = shortfall - cuts.iter().fold(Amount::zero(), |a, c| a + *c);
                for &i in &order {
                    if remaining.is_zero() {
                        break;
                    }
                    let capacity = v.delegations_in[i].amount - cuts[i];
                    let extra = remaining.min(capacity);
                    cuts[i] += extra;
                    remaining -= extra;
                }
                for (i, cut) in cuts.iter().enumerate() {
                    v.delegations_in[i].amount -= *cut;
                }
                v.total_delegated -= shortfall;
                emptied_delegators = v
                    .delegations_in
                    .iter()
                    .filter(|d| d.amount.is_zero())
                    .map(|d| d.delegator.clone())
                    .collect();
                v.delegations_in.retain(|d| !d.amount.is_zero());
            }
            v.power -= penalty;
            v.total_penalties += penalty;
            v.jail_count += 1;
            v.jailed_until_height = current_height + jail_duration;
            v.missed_blocks = 0;
            v.is_active = false;
            (penalty, v.jail_count)
        };
        for delegator in emptied_delegators {
            self.account_mut(&delegator).delegations_out.remove(addr);
        }
        self.burn(penalty);
        warn!(
            validator = %addr,
            %penalty,
            jail_count,
            height = current_height,
            "validator jailed"
        );
    }

    /// Third jail: burn the remaining self-stake, refund every delegation
    /// via immediate-maturity unbonding, latch the validator inactive.
    fn eject_validator(&mut self, addr: &ConsensusAddress, current_height: u64) {
        let (burned, refunds) = {
            let Some(v) = self.validators.get_mut(addr) else {
                return;
            };
            let burned = v.self_stake;
            v.self_stake = Amount::zero();
            let refunds: Vec<(AccountAddress, Amount)> = v
                .delegations_in
                .drain(..)
                .map(|d| (d.delegator, d.amount))
                .collect();
            v.total_delegated = Amount::zero();
            v.power = Amount::zero();
            v.total_penalties += burned;
            v.jail_count += 1;
            v.jailed_until_height = u64::MAX;
            v.missed_blocks = 0;
            v.is_active = false;
            (burned, refunds)
        };
        self.burn(burned);
        for (delegator, amount) in refunds {
            let account = self.account_mut(&delegator);
            account.delegations_out.remove(addr);
            account.push_unbonding(UnbondingEntry {
                validator: addr.clone(),
                amount,
                completion_height: current_height,
            });
        }
        warn!(validator = %addr, %burned, height = current_height, "validator ejected");
    }
}
