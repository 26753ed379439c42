//! Core types for the ComputeChain node: amounts, hashes, addresses,
//! transactions, blocks, genesis, the canonical codec, the error taxonomy
//! and the in-process event bus. Every other crate builds on this one.

pub mod address;
pub mod amount;
pub mod block;
pub mod codec;
pub mod error;
pub mod events;
pub mod genesis;
pub mod hash;
pub mod tx;

pub use address::{AccountAddress, ConsensusAddress, ACCOUNT_PREFIX, CONSENSUS_PREFIX, TREASURY_ADDRESS};
pub use amount::{cpc, mul_bps, Amount, BPS_DENOMINATOR, WEI_PER_CPC};
pub use block::{Block, BlockHeader, PROTOCOL_VERSION};
pub use error::{BlockError, CodecError, NetError, StoreError, TxError};
pub use events::{ChainEvent, EventBus};
pub use genesis::{Genesis, GenesisAccount, GenesisParams, GenesisValidator};
pub use hash::{hash_bytes, Hash32};
pub use tx::{ComputeCommitment, DelegationTarget, Transaction, TxKind, ValidatorMetadata, ValidatorUpdate};
