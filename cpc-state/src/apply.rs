//! Whole-block application in the strict order: unbonding maturation,
//! reward distribution, transactions, performance update, epoch
//! transition, root computation.

use crate::ChainState;
use cpc_core::{Block, BlockError, ConsensusAddress, Hash32, Transaction, TxError, TxKind};
use tracing::debug;

/// The result of executing a block body against a state.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Ids of transactions that applied, in block order.
    pub confirmed: Vec<Hash32>,
    /// Skipped transactions with the reason; the block itself stays valid.
    pub failed: Vec<(Hash32, TxError)>,
    pub gas_used: u64,
    pub tx_root: Hash32,
    pub state_root: Hash32,
    pub compute_root: Hash32,
}

impl ChainState {
    /// Execute a block body. Used by the proposer against a working copy
    /// and by `apply_block` during validation; both paths run the exact
    /// same code so replicas converge.
    pub fn execute_block(
        &mut self,
        height: u64,
        slot: u64,
        proposer: &ConsensusAddress,
        txs: &[Transaction],
    ) -> ApplyOutcome {
        // 1. Mature unbonding entries due at this height.
        for account in self.accounts.values_mut() {
            account.mature_unbonding(height);
        }

        // 2. Mint and distribute the block reward.
        self.distribute_block_rewards(height);

        // 3. Transactions, sequentially; failures skip, never unwind.
        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        let mut compute_leaves = Vec::new();
        let mut gas_used = 0u64;
        for tx in txs {
            let id = tx.id();
            match self.apply_transaction(tx, height) {
                Ok(gas) => {
                    gas_used += gas;
                    if tx.kind == TxKind::SubmitResult {
                        if let Ok(commitment) = tx.decode_compute_commitment() {
                            compute_leaves.push(commitment.result_hash);
                        }
                    }
                    confirmed.push(id);
                }
                Err(reason) => {
                    debug!(tx_id = %id, %reason, "transaction skipped");
                    failed.push((id, reason));
                }
            }
        }

        // 4. Performance bookkeeping over the covered slot range.
        self.update_performance(height, slot, proposer);

        // 5. Epoch boundary.
        if self.params.epoch_length_blocks > 0 && height % self.params.epoch_length_blocks == 0 {
            self.epoch_transition(height);
        }

        let tx_root = cpc_crypto::merkle_root(&txs.iter().map(|t| t.id()).collect::<Vec<_>>());
        let compute_root = cpc_crypto::merkle_root(&compute_leaves);
        let state_root = self.state_root();
        ApplyOutcome {
            confirmed,
            failed,
            gas_used,
            tx_root,
            state_root,
            compute_root,
        }
    }

    /// Validate and commit a complete block. The body executes against a
    /// working copy; on any root mismatch the local state is untouched.
    pub fn apply_block(&mut self, block: &Block) -> Result<ApplyOutcome, BlockError> {
        let header = &block.header;
        if header.height != self.height + 1 {
            return Err(BlockError::HeightMismatch {
                expected: self.height + 1,
                got: header.height,
            });
        }
        if header.prev_hash != self.last_block_hash {
            return Err(BlockError::PrevHashMismatch);
        }

        let mut next = self.clone();
        let outcome = next.execute_block(header.height, header.slot, &header.proposer, &block.transactions);
        if outcome.tx_root != header.tx_root {
            return Err(BlockError::TxRootMismatch);
        }
        if outcome.state_root != header.state_root || outcome.compute_root != header.compute_root {
            return Err(BlockError::StateRootMismatch);
        }
        next.height = header.height;
        next.last_block_hash = block.hash();
        next.last_slot = header.slot;
        next.last_block_time = header.timestamp;
        *self = next;
        Ok(outcome)
    }

    /// Performance bookkeeping: credit the proposer, charge every absentee
    /// whose slot fell inside `(last_slot, slot)`, jail on threshold.
    fn update_performance(&mut self, height: u64, slot: u64, proposer: &ConsensusAddress) {
        let set = self.active_set.clone();
        let n = set.len() as u64;
        if n == 0 {
            return;
        }
        let from = self.last_slot;
        for (idx, addr) in set.iter().enumerate() {
            if addr == proposer {
                continue;
            }
            let Some(v) = self.validators.get_mut(addr) else {
                continue;
            };
            if !v.is_active {
                continue;
            }
            let misses = slots_for_index(from + 1, slot.saturating_sub(1), n, idx as u64);
            if misses > 0 {
                v.blocks_expected += misses;
                v.missed_blocks += misses;
            }
        }
        if let Some(v) = self.validators.get_mut(proposer) {
            v.blocks_expected += 1;
            v.blocks_proposed += 1;
            v.missed_blocks = 0;
            v.last_seen_height = height;
        }

        let threshold = self.params.max_missed_blocks_sequential;
        let to_jail: Vec<ConsensusAddress> = set
            .iter()
            .filter(|addr| {
                self.validators
                    .get(addr)
                    .map(|v| v.is_active && v.missed_blocks >= threshold)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for addr in to_jail {
            self.jail_validator(&addr, height);
        }
    }
}

/// Count of `s` in `[from, to]` with `s % n == idx`. Closed range; returns
/// 0 when the range is empty.
fn slots_for_index(from: u64, to: u64, n: u64, idx: u64) -> u64 {
    if to < from {
        return 0;
    }
    let upto = |x: u64| -> u64 {
        if x < idx {
            0
        } else {
            (x - idx) / n + 1
        }
    };
    upto(to) - if from == 0 { 0 } else { upto(from - 1) }
}

#[cfg(test)]
mod tests {
    use super::slots_for_index;

    #[test]
    fn counts_residues_in_closed_range() {
        // s in [1, 9], n = 3: residue 0 → {3, 6, 9}.
        assert_eq!(slots_for_index(1, 9, 3, 0), 3);
        // residue 1 → {1, 4, 7}.
        assert_eq!(slots_for_index(1, 9, 3, 1), 3);
        assert_eq!(slots_for_index(5, 4, 3, 0), 0);
        assert_eq!(slots_for_index(0, 0, 3, 0), 1);
    }
}
