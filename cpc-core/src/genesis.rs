use crate::address::{AccountAddress, ConsensusAddress};
use crate::amount::{cpc, Amount};
use crate::codec::{self, serde_hex};
use crate::error::CodecError;
use crate::hash::{hash_bytes, Hash32};
use crate::tx::ValidatorMetadata;
use serde::{Deserialize, Serialize};

/// Network parameters fixed at genesis. All rates are basis points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisParams {
    pub block_time_seconds: u64,
    pub epoch_length_blocks: u64,
    pub max_validators: usize,
    pub min_validator_stake: Amount,
    pub min_delegation: Amount,
    pub max_commission_rate_bps: u64,
    pub unjail_fee: Amount,
    pub jail_duration_blocks: u64,
    pub slashing_base_rate_bps: u64,
    pub ejection_threshold_jails: u32,
    pub max_missed_blocks_sequential: u64,
    pub min_uptime_score_bps: u64,
    pub unbonding_blocks: u64,
    pub block_reward: Amount,
    pub miner_reward_bps: u64,
    pub max_tx_per_block: usize,
    pub block_gas_limit: u64,
    pub mempool_tx_ttl_seconds: u64,
    pub snapshot_interval_blocks: u64,
    pub snapshot_keep: usize,
    pub max_validators_per_delegator: usize,
    pub max_validator_power_share_bps: u64,
    pub fee_burn_bps: u64,
    pub jail_unstake_penalty_bps: u64,
    pub max_timestamp_skew_seconds: u64,
}

impl Default for GenesisParams {
    fn default() -> Self {
        Self {
            block_time_seconds: 5,
            epoch_length_blocks: 100,
            max_validators: 25,
            min_validator_stake: cpc(10_000),
            min_delegation: cpc(10),
            max_commission_rate_bps: 2_000,
            unjail_fee: cpc(1_000),
            jail_duration_blocks: 100,
            slashing_base_rate_bps: 500,
            ejection_threshold_jails: 3,
            max_missed_blocks_sequential: 20,
            min_uptime_score_bps: 5_000,
            unbonding_blocks: 1_000,
            block_reward: cpc(10),
            miner_reward_bps: 3_000,
            max_tx_per_block: 500,
            block_gas_limit: 30_000_000,
            mempool_tx_ttl_seconds: 3_600,
            snapshot_interval_blocks: 500,
            snapshot_keep: 10,
            max_validators_per_delegator: 10,
            max_validator_power_share_bps: 2_000,
            fee_burn_bps: 10_000,
            jail_unstake_penalty_bps: 1_000,
            max_timestamp_skew_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub consensus_addr: ConsensusAddress,
    pub operator_addr: AccountAddress,
    #[serde(with = "serde_hex")]
    pub pubkey: Vec<u8>,
    pub self_stake: Amount,
    pub metadata: ValidatorMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: AccountAddress,
    pub balance: Amount,
    #[serde(default, with = "opt_hex")]
    pub pubkey: Option<Vec<u8>>,
}

/// The genesis document. All nodes of a network start from a
/// byte-identical copy; the hash of its canonical encoding is the network
/// identity that gates peer sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub network_id: String,
    pub genesis_time: u64,
    pub params: GenesisParams,
    pub initial_validators: Vec<GenesisValidator>,
    pub initial_accounts: Vec<GenesisAccount>,
}

impl Genesis {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::to_canonical(self)
    }

    /// Network identity hash.
    pub fn hash(&self) -> Result<Hash32, CodecError> {
        Ok(hash_bytes(&self.canonical_bytes()?))
    }

    /// Sum of all balances and stakes present at genesis; the base term of
    /// the supply identity.
    pub fn total_supply(&self) -> Amount {
        let accounts: Amount = self
            .initial_accounts
            .iter()
            .fold(Amount::zero(), |acc, a| acc + a.balance);
        let stakes: Amount = self
            .initial_validators
            .iter()
            .fold(Amount::zero(), |acc, v| acc + v.self_stake);
        accounts + stakes
    }
}

mod opt_hex {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| hex::decode(&s).map_err(de::Error::custom)).transpose()
    }
}
