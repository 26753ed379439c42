use crate::address::AccountAddress;
use crate::amount::Amount;
use crate::codec::{self, serde_hex};
use crate::error::{CodecError, TxError};
use crate::hash::{hash_bytes, Hash32};
use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_WEBSITE_LEN: usize = 128;
pub const MAX_DESCRIPTION_LEN: usize = 256;
/// Upper bound on the free-form payload carried by a transaction.
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// The closed set of transaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Transfer,
    Stake,
    Unstake,
    UpdateValidator,
    Delegate,
    Undelegate,
    Unjail,
    SubmitResult,
}

impl TxKind {
    /// Base gas charged per kind. There is no metered execution beyond this.
    pub fn base_gas(&self) -> u64 {
        match self {
            TxKind::Transfer => 21_000,
            TxKind::Stake => 40_000,
            TxKind::Unstake => 40_000,
            TxKind::UpdateValidator => 30_000,
            TxKind::Delegate => 35_000,
            TxKind::Undelegate => 35_000,
            TxKind::Unjail => 50_000,
            TxKind::SubmitResult => 80_000,
        }
    }
}

/// Validator display metadata, length-bounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorMetadata {
    pub name: String,
    pub website: String,
    pub description: String,
}

impl ValidatorMetadata {
    pub fn validate(&self) -> Result<(), TxError> {
        if self.name.len() > MAX_NAME_LEN
            || self.website.len() > MAX_WEBSITE_LEN
            || self.description.len() > MAX_DESCRIPTION_LEN
        {
            return Err(TxError::MetadataTooLong);
        }
        Ok(())
    }
}

/// Payload of an UPDATE_VALIDATOR transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub metadata: ValidatorMetadata,
    pub commission_rate_bps: u64,
}

/// Payload of a SUBMIT_RESULT transaction: the on-chain commitment to a
/// compute result delivered through the miner pool. The worker subsystem
/// that produces it is outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCommitment {
    pub task_id: String,
    pub result_hash: Hash32,
}

/// Payload of DELEGATE / UNDELEGATE: the validator the position targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationTarget {
    pub validator: crate::address::ConsensusAddress,
}

/// Signed transaction envelope. The canonical encoding of the unsigned
/// fields (everything but `signature`) hashes to the signing message,
/// which doubles as the transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    pub sender: AccountAddress,
    pub recipient: Option<AccountAddress>,
    pub amount: Amount,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Amount,
    #[serde(with = "serde_hex")]
    pub payload: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub pubkey: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Canonical bytes of the unsigned envelope.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        codec::to_canonical(&unsigned)
    }

    /// Transaction id: hash of the unsigned canonical encoding.
    pub fn id(&self) -> Hash32 {
        match self.signing_bytes() {
            Ok(bytes) => hash_bytes(&bytes),
            // Unreachable for well-formed envelopes; a zero id keeps the
            // failure observable without panicking.
            Err(_) => Hash32::zero(),
        }
    }

    pub fn fee(&self) -> Amount {
        Amount::from(self.kind.base_gas()) * self.gas_price
    }

    /// Structural checks that do not need chain state.
    pub fn validate_shape(&self) -> Result<(), TxError> {
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(TxError::Malformed("payload too large".into()));
        }
        if self.gas_limit < self.kind.base_gas() {
            return Err(TxError::Malformed("gas limit below base gas".into()));
        }
        if self.kind == TxKind::Transfer && self.recipient.is_none() {
            return Err(TxError::Malformed("transfer without recipient".into()));
        }
        Ok(())
    }

    pub fn decode_validator_update(&self) -> Result<ValidatorUpdate, TxError> {
        codec::from_canonical(&self.payload).map_err(|_| TxError::Malformed("bad validator update payload".into()))
    }

    pub fn decode_compute_commitment(&self) -> Result<ComputeCommitment, TxError> {
        codec::from_canonical(&self.payload).map_err(|_| TxError::Malformed("bad compute payload".into()))
    }

    pub fn decode_delegation_target(&self) -> Result<DelegationTarget, TxError> {
        codec::from_canonical(&self.payload).map_err(|_| TxError::Malformed("bad delegation payload".into()))
    }
}
