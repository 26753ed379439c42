//! Slot-based proposer consensus: the deterministic slot clock, the
//! slot → proposer mapping over the active set, block assembly and
//! signing, and the validation ladder for received blocks.
//!
//! There is no fork choice: one authorized proposer per slot, and a block
//! is final as soon as it applies locally.

use cpc_core::{Block, BlockError, BlockHeader, ConsensusAddress, Transaction, PROTOCOL_VERSION};
use cpc_crypto::KeyMaterial;
use cpc_state::ChainState;
use tracing::debug;

/// Wall-clock to slot mapping anchored at genesis time.
#[derive(Debug, Clone, Copy)]
pub struct SlotClock {
    pub genesis_time: u64,
    pub block_time_seconds: u64,
}

impl SlotClock {
    pub fn new(genesis_time: u64, block_time_seconds: u64) -> Self {
        Self {
            genesis_time,
            block_time_seconds: block_time_seconds.max(1),
        }
    }

    /// `floor((now − genesis_time) / block_time)`; slot 0 before genesis.
    pub fn slot_at(&self, now: u64) -> u64 {
        now.saturating_sub(self.genesis_time) / self.block_time_seconds
    }

    pub fn slot_start(&self, slot: u64) -> u64 {
        self.genesis_time + slot * self.block_time_seconds
    }

    /// Seconds from `now` until the next slot boundary.
    pub fn until_next_slot(&self, now: u64) -> u64 {
        let next = self.slot_start(self.slot_at(now) + 1);
        next.saturating_sub(now)
    }
}

/// `active_set[slot mod len]`; the set is kept in canonical order by
/// consensus address.
pub fn proposer_for_slot(active_set: &[ConsensusAddress], slot: u64) -> Option<&ConsensusAddress> {
    if active_set.is_empty() {
        return None;
    }
    active_set.get((slot % active_set.len() as u64) as usize)
}

/// Assemble and sign a block at `slot` on top of `state`. The body is
/// executed against a working copy to learn the roots; committing is the
/// caller's `apply_block` on the canonical state, which re-runs the exact
/// same code path every replica runs.
pub fn build_block(
    state: &ChainState,
    txs: &[Transaction],
    slot: u64,
    timestamp: u64,
    key: &KeyMaterial,
) -> Result<Block, BlockError> {
    let proposer =
        cpc_crypto::consensus_address(&key.public_key).map_err(|_| BlockError::InvalidSignature)?;
    let height = state.height + 1;
    let mut working = state.clone();
    let outcome = working.execute_block(height, slot, &proposer, txs);
    let header = BlockHeader {
        height,
        prev_hash: state.last_block_hash,
        timestamp,
        slot,
        proposer,
        tx_root: outcome.tx_root,
        state_root: outcome.state_root,
        compute_root: outcome.compute_root,
        version: PROTOCOL_VERSION,
    };
    let signature = cpc_crypto::sign(&key.secret_key, header.hash().as_bytes())
        .map_err(|_| BlockError::InvalidSignature)?;
    debug!(height, slot, txs = txs.len(), "block assembled");
    Ok(Block {
        header,
        transactions: txs.to_vec(),
        signature,
    })
}

/// Validation ladder for a received block, run before re-execution.
/// `now` is the local wall clock in unix seconds.
pub fn validate_block(
    state: &ChainState,
    clock: &SlotClock,
    block: &Block,
    now: u64,
    max_timestamp_skew: u64,
) -> Result<(), BlockError> {
    let header = &block.header;
    if header.prev_hash != state.last_block_hash {
        return Err(BlockError::PrevHashMismatch);
    }
    let expected_height = state.height + 1;
    if header.height != expected_height {
        return Err(BlockError::HeightMismatch {
            expected: expected_height,
            got: header.height,
        });
    }
    // Not from the future beyond tolerance, never older than the parent,
    // and slots only move forward.
    if header.timestamp > now + max_timestamp_skew
        || header.timestamp < state.last_block_time
        || (state.height > 0 && header.slot <= state.last_slot)
    {
        return Err(BlockError::TimestampInvalid);
    }
    // Slot and proposer must agree with the mapping at the header time.
    if header.slot != clock.slot_at(header.timestamp) {
        return Err(BlockError::TimestampInvalid);
    }
    let Some(expected_proposer) = proposer_for_slot(&state.active_set, header.slot) else {
        return Err(BlockError::NoActiveSet);
    };
    if expected_proposer != &header.proposer {
        return Err(BlockError::ProposerMismatch { slot: header.slot });
    }
    // Proposer signature over the header hash.
    let validator = state
        .validator(&header.proposer)
        .ok_or(BlockError::ProposerMismatch { slot: header.slot })?;
    let pubkey = hex::decode(&validator.pubkey).map_err(|_| BlockError::InvalidSignature)?;
    let valid = cpc_crypto::verify(&pubkey, header.hash().as_bytes(), &block.signature)
        .map_err(|_| BlockError::InvalidSignature)?;
    if !valid {
        return Err(BlockError::InvalidSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpc_core::{
        cpc, AccountAddress, Genesis, GenesisAccount, GenesisParams, GenesisValidator,
        ValidatorMetadata,
    };

    fn actor() -> (KeyMaterial, AccountAddress) {
        let key = cpc_crypto::generate_keypair();
        let addr = cpc_crypto::account_address(&key.public_key).unwrap();
        (key, addr)
    }

    fn single_validator_genesis(key: &KeyMaterial, operator: &AccountAddress) -> Genesis {
        Genesis {
            network_id: "computechain-test".into(),
            genesis_time: 1_700_000_000,
            params: GenesisParams::default(),
            initial_validators: vec![GenesisValidator {
                consensus_addr: cpc_crypto::consensus_address(&key.public_key).unwrap(),
                operator_addr: operator.clone(),
                pubkey: key.public_key.clone(),
                self_stake: cpc(10_000),
                metadata: ValidatorMetadata::default(),
            }],
            initial_accounts: vec![GenesisAccount {
                address: operator.clone(),
                balance: cpc(100),
                pubkey: None,
            }],
        }
    }

    #[test]
    fn slot_clock_is_anchored_at_genesis() {
        let clock = SlotClock::new(1_000, 5);
        assert_eq!(clock.slot_at(999), 0);
        assert_eq!(clock.slot_at(1_000), 0);
        assert_eq!(clock.slot_at(1_004), 0);
        assert_eq!(clock.slot_at(1_005), 1);
        assert_eq!(clock.slot_start(3), 1_015);
        assert_eq!(clock.until_next_slot(1_004), 1);
    }

    #[test]
    fn proposer_rotates_round_robin() {
        let set = vec![
            ConsensusAddress("cpcvalconsa".into()),
            ConsensusAddress("cpcvalconsb".into()),
            ConsensusAddress("cpcvalconsc".into()),
        ];
        assert_eq!(proposer_for_slot(&set, 0), Some(&set[0]));
        assert_eq!(proposer_for_slot(&set, 4), Some(&set[1]));
        assert_eq!(proposer_for_slot(&set, 5), Some(&set[2]));
        assert_eq!(proposer_for_slot(&[], 5), None);
    }

    #[test]
    fn built_blocks_validate_and_apply() {
        let (key, operator) = actor();
        let genesis = single_validator_genesis(&key, &operator);
        let mut state = ChainState::from_genesis(&genesis).unwrap();
        let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);

        let slot = 3;
        let timestamp = clock.slot_start(slot);
        let block = build_block(&state, &[], slot, timestamp, &key).unwrap();

        validate_block(&state, &clock, &block, timestamp, 10).unwrap();
        state.apply_block(&block).unwrap();
        assert_eq!(state.height, 1);
        assert_eq!(state.last_block_hash, block.hash());
    }

    #[test]
    fn foreign_proposer_is_rejected() {
        let (key, operator) = actor();
        let (other_key, _) = actor();
        let genesis = single_validator_genesis(&key, &operator);
        let state = ChainState::from_genesis(&genesis).unwrap();
        let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);

        let slot = 1;
        let timestamp = clock.slot_start(slot);
        // Signed by a key that is not in the active set.
        let block = build_block(&state, &[], slot, timestamp, &other_key).unwrap();
        assert!(matches!(
            validate_block(&state, &clock, &block, timestamp, 10),
            Err(BlockError::ProposerMismatch { .. })
        ));
    }

    #[test]
    fn future_timestamps_are_rejected() {
        let (key, operator) = actor();
        let genesis = single_validator_genesis(&key, &operator);
        let state = ChainState::from_genesis(&genesis).unwrap();
        let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);

        let slot = 100;
        let timestamp = clock.slot_start(slot);
        let block = build_block(&state, &[], slot, timestamp, &key).unwrap();
        // Local clock far behind the header time.
        assert!(matches!(
            validate_block(&state, &clock, &block, clock.slot_start(1), 10),
            Err(BlockError::TimestampInvalid)
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (key, operator) = actor();
        let genesis = single_validator_genesis(&key, &operator);
        let state = ChainState::from_genesis(&genesis).unwrap();
        let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);

        let slot = 2;
        let timestamp = clock.slot_start(slot);
        let mut block = build_block(&state, &[], slot, timestamp, &key).unwrap();
        block.signature[0] ^= 0xff;
        assert!(matches!(
            validate_block(&state, &clock, &block, timestamp, 10),
            Err(BlockError::InvalidSignature)
        ));
    }

    #[test]
    fn height_gaps_are_rejected() {
        let (key, operator) = actor();
        let genesis = single_validator_genesis(&key, &operator);
        let state = ChainState::from_genesis(&genesis).unwrap();
        let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);

        let slot = 2;
        let timestamp = clock.slot_start(slot);
        let mut block = build_block(&state, &[], slot, timestamp, &key).unwrap();
        block.header.height = 5;
        let err = validate_block(&state, &clock, &block, timestamp, 10);
        assert!(matches!(err, Err(BlockError::HeightMismatch { expected: 1, got: 5 })));
    }
}
