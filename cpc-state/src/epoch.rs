//! Epoch transitions: refresh uptime/performance scores and recompute the
//! active validator set.

use crate::ChainState;
use cpc_core::ConsensusAddress;
use std::collections::BTreeSet;
use tracing::info;

impl ChainState {
    /// Runs at every epoch boundary (`height % epoch_length_blocks == 0`).
    pub(crate) fn epoch_transition(&mut self, current_height: u64) {
        let total_power = self.total_staked_power();
        for v in self.validators.values_mut() {
            v.update_scores(total_power);
        }

        let params = &self.params;
        let mut candidates: Vec<(&ConsensusAddress, u64, cpc_core::Amount)> = self
            .validators
            .values()
            .filter(|v| {
                v.power >= params.min_validator_stake
                    && v.jailed_until_height <= current_height
                    && v.jail_count < params.ejection_threshold_jails
                    // Inclusive lower bound: a validator sitting exactly on
                    // the minimum uptime is retained.
                    && !(v.blocks_expected > 0 && v.uptime_score_bps < params.min_uptime_score_bps)
            })
            .map(|v| (&v.consensus_addr, v.performance_score_bps, v.power))
            .collect();
        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(b.0))
        });
        let selected: BTreeSet<ConsensusAddress> = candidates
            .into_iter()
            .take(params.max_validators)
            .map(|(addr, _, _)| addr.clone())
            .collect();

        for v in self.validators.values_mut() {
            v.is_active = selected.contains(&v.consensus_addr);
        }
        // BTreeSet iteration gives the canonical (ascending) order the
        // slot → proposer mapping relies on.
        self.active_set = selected.into_iter().collect();
        self.epoch = if self.params.epoch_length_blocks == 0 {
            0
        } else {
            current_height / self.params.epoch_length_blocks
        };
        info!(
            epoch = self.epoch,
            height = current_height,
            active = self.active_set.len(),
            "epoch transition"
        );
    }
}
