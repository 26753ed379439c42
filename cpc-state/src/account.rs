use cpc_core::{Amount, ConsensusAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tokens released from a delegation, locked until `completion_height`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingEntry {
    pub validator: ConsensusAddress,
    pub amount: Amount,
    pub completion_height: u64,
}

/// One reward distribution received by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub epoch: u64,
    pub amount: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: Amount,
    /// Next expected sequence number; strictly monotonic across applied
    /// transactions.
    pub nonce: u64,
    /// Cached on the first applied signature from this account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    /// Validators this account currently delegates to.
    pub delegations_out: BTreeSet<ConsensusAddress>,
    /// Ordered by completion height.
    pub unbonding: Vec<UnbondingEntry>,
    pub reward_history: Vec<RewardRecord>,
}

impl Account {
    pub fn with_balance(balance: Amount) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }

    /// Insert keeping the list ordered by completion height.
    pub fn push_unbonding(&mut self, entry: UnbondingEntry) {
        let pos = self
            .unbonding
            .partition_point(|e| e.completion_height <= entry.completion_height);
        self.unbonding.insert(pos, entry);
    }

    /// Credit every entry that matured at or before `height`. Returns the
    /// total released.
    pub fn mature_unbonding(&mut self, height: u64) -> Amount {
        let mut released = Amount::zero();
        self.unbonding.retain(|entry| {
            if entry.completion_height <= height {
                released += entry.amount;
                false
            } else {
                true
            }
        });
        self.balance += released;
        released
    }

    pub fn total_unbonding(&self) -> Amount {
        self.unbonding
            .iter()
            .fold(Amount::zero(), |acc, e| acc + e.amount)
    }
}
