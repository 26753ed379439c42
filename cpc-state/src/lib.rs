//! The deterministic state machine: accounts, validators, delegations,
//! unbonding queues, rewards, graduated slashing, epoch transitions and
//! the canonical state root. One instance exists per process, owned by the
//! node's single writer task; everything in this crate is synchronous and
//! free of I/O.

pub mod account;
pub mod apply;
pub mod epoch;
pub mod machine;
pub mod rewards;
pub mod slashing;
pub mod validator;


pub use account::{Account, RewardRecord, UnbondingEntry};
pub use apply::ApplyOutcome;
pub use validator::{Delegation, Validator, DEFAULT_COMMISSION_BPS};

use cpc_core::{
    codec, hash_bytes, AccountAddress, Amount, ComputeCommitment, ConsensusAddress, Genesis,
    GenesisParams, Hash32,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The replicated world state. Maps are `BTreeMap` so every canonical
/// encoding and iteration is in lexicographic address order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    pub accounts: BTreeMap<AccountAddress, Account>,
    pub validators: BTreeMap<ConsensusAddress, Validator>,
    /// Validators selected at the last epoch boundary, sorted by consensus
    /// address; this order anchors the slot → proposer mapping.
    pub active_set: Vec<ConsensusAddress>,
    /// Log of compute-result commitments recorded by SUBMIT_RESULT.
    pub compute_results: Vec<ComputeCommitment>,
    pub total_minted: Amount,
    pub total_burned: Amount,
    pub genesis_supply: Amount,
    pub params: GenesisParams,
    /// Height of the last applied block; 0 before any block.
    pub height: u64,
    pub last_block_hash: Hash32,
    /// Slot of the last applied block.
    pub last_slot: u64,
    /// Timestamp of the last applied block; genesis time before any block.
    pub last_block_time: u64,
    pub epoch: u64,
}

/// The exact material the state root commits to, in the canonical order:
/// validators, accounts, economic counters.
#[derive(Serialize)]
struct StateDigest<'a> {
    validators: &'a BTreeMap<ConsensusAddress, Validator>,
    accounts: &'a BTreeMap<AccountAddress, Account>,
    total_minted: Amount,
    total_burned: Amount,
}

impl ChainState {
    pub fn from_genesis(genesis: &Genesis) -> Result<Self, cpc_core::CodecError> {
        let genesis_hash = genesis.hash()?;
        let mut accounts: BTreeMap<AccountAddress, Account> = BTreeMap::new();
        for acct in &genesis.initial_accounts {
            let mut account = Account::with_balance(acct.balance);
            account.pubkey = acct.pubkey.as_ref().map(hex::encode);
            accounts.insert(acct.address.clone(), account);
        }
        accounts.entry(AccountAddress::treasury()).or_default();

        let mut validators: BTreeMap<ConsensusAddress, Validator> = BTreeMap::new();
        for v in &genesis.initial_validators {
            let mut validator = Validator::new(
                v.consensus_addr.clone(),
                v.operator_addr.clone(),
                hex::encode(&v.pubkey),
                v.self_stake,
                0,
            );
            validator.metadata = v.metadata.clone();
            validator.is_active = v.self_stake >= genesis.params.min_validator_stake;
            accounts.entry(v.operator_addr.clone()).or_default();
            validators.insert(v.consensus_addr.clone(), validator);
        }

        let active_set: Vec<ConsensusAddress> = validators
            .values()
            .filter(|v| v.is_active)
            .map(|v| v.consensus_addr.clone())
            .collect();

        Ok(Self {
            accounts,
            validators,
            active_set,
            compute_results: Vec::new(),
            total_minted: Amount::zero(),
            total_burned: Amount::zero(),
            genesis_supply: genesis.total_supply(),
            params: genesis.params.clone(),
            height: 0,
            last_block_hash: genesis_hash,
            last_slot: 0,
            last_block_time: genesis.genesis_time,
            epoch: 0,
        })
    }

    /// Canonical hash over the committed state.
    pub fn state_root(&self) -> Hash32 {
        let digest = StateDigest {
            validators: &self.validators,
            accounts: &self.accounts,
            total_minted: self.total_minted,
            total_burned: self.total_burned,
        };
        match codec::to_canonical(&digest) {
            Ok(bytes) => hash_bytes(&bytes),
            Err(_) => Hash32::zero(),
        }
    }

    pub fn account(&self, addr: &AccountAddress) -> Option<&Account> {
        self.accounts.get(addr)
    }

    pub fn account_mut(&mut self, addr: &AccountAddress) -> &mut Account {
        self.accounts.entry(addr.clone()).or_default()
    }

    /// Next expected nonce for a sender; 0 for unknown accounts.
    pub fn nonce_of(&self, addr: &AccountAddress) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn validator(&self, addr: &ConsensusAddress) -> Option<&Validator> {
        self.validators.get(addr)
    }

    /// The validator operated by `operator`, if one exists. Each account
    /// operates at most one validator.
    pub fn validator_by_operator(&self, operator: &AccountAddress) -> Option<&Validator> {
        self.validators.values().find(|v| &v.operator == operator)
    }

    pub fn validator_addr_by_operator(&self, operator: &AccountAddress) -> Option<ConsensusAddress> {
        self.validator_by_operator(operator)
            .map(|v| v.consensus_addr.clone())
    }

    /// Sum of `power` over every validator.
    pub fn total_staked_power(&self) -> Amount {
        self.validators
            .values()
            .fold(Amount::zero(), |acc, v| acc + v.power)
    }

    pub fn treasury_balance(&self) -> Amount {
        self.accounts
            .get(&AccountAddress::treasury())
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    /// Burn into the economic counter. Pairs with every penalty, fee-burn
    /// and rounding residual.
    pub(crate) fn burn(&mut self, amount: Amount) {
        self.total_burned += amount;
    }

    /// Total locked in unbonding queues across all accounts.
    pub fn total_unbonding(&self) -> Amount {
        self.accounts
            .values()
            .fold(Amount::zero(), |acc, a| acc + a.total_unbonding())
    }

    /// The supply identity that must hold after every applied block:
    /// balances + staked power + unbonding + burned == minted + genesis supply.
    pub fn supply_identity_holds(&self) -> bool {
        let balances = self
            .accounts
            .values()
            .fold(Amount::zero(), |acc, a| acc + a.balance);
        let staked = self.total_staked_power();
        balances + staked + self.total_unbonding() + self.total_burned
            == self.total_minted + self.genesis_supply
    }
}
