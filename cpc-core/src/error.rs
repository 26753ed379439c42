use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural failures: a payload that cannot be decoded or is outside
/// size bounds.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CodecError {
    #[error("malformed input")]
    Malformed,
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("payload too large")]
    TooLarge,
}

/// Per-transaction failures. A transaction that fails with one of these is
/// skipped during block apply (never block-fatal) and surfaced to
/// subscribers through a `tx_failed` event, so the enum is serializable
/// and carried by value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TxError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unknown key")]
    UnknownKey,
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("unknown validator")]
    UnknownValidator,
    #[error("validator already exists")]
    ValidatorExists,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("invalid commission rate")]
    InvalidCommission,
    #[error("metadata too long")]
    MetadataTooLong,
    #[error("delegation below minimum")]
    MinDelegationNotMet,
    #[error("delegator participates in too many validators")]
    MaxValidatorsPerDelegatorExceeded,
    #[error("delegation would exceed validator power share cap")]
    MaxValidatorPowerShareExceeded,
    #[error("validator is jailed")]
    Jailed,
    #[error("validator is permanently ejected")]
    EjectionPermanent,
    #[error("sender is not the validator operator")]
    NotOwner,
    // Mempool-side outcomes, surfaced through the same tx_failed channel.
    #[error("duplicate nonce without sufficient fee bump")]
    DuplicateNonce,
    #[error("evicted from mempool")]
    Evicted,
    #[error("expired in mempool")]
    Expired,
    #[error("mempool full")]
    MempoolFull,
    #[error("malformed transaction: {0}")]
    Malformed(String),
}

/// Block-level failures. Any of these rejects the whole block; local state
/// is never mutated by a rejected block.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum BlockError {
    #[error("height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("previous hash mismatch")]
    PrevHashMismatch,
    #[error("proposer mismatch for slot {slot}")]
    ProposerMismatch { slot: u64 },
    #[error("state root mismatch")]
    StateRootMismatch,
    #[error("transaction root mismatch")]
    TxRootMismatch,
    #[error("invalid block timestamp")]
    TimestampInvalid,
    #[error("invalid proposer signature")]
    InvalidSignature,
    #[error("no active validator set")]
    NoActiveSet,
}

/// Peer/network failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NetError {
    #[error("genesis hash mismatch")]
    GenesisMismatch,
    #[error("network error: {0}")]
    Network(String),
    #[error("peer timed out")]
    Timeout,
}

/// Storage failures are fatal: the node refuses to run over corrupted
/// state and exits non-zero.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage corrupt: {0}")]
    Corrupt(String),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}
