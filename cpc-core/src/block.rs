use crate::address::ConsensusAddress;
use crate::codec::{self, serde_hex};
use crate::error::CodecError;
use crate::hash::{hash_bytes, Hash32};
use crate::tx::Transaction;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Block header. The block hash is the hash of this header's canonical
/// encoding; the proposer signature covers the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: Hash32,
    pub timestamp: u64,
    pub slot: u64,
    pub proposer: ConsensusAddress,
    pub tx_root: Hash32,
    pub state_root: Hash32,
    pub compute_root: Hash32,
    pub version: u32,
}

impl BlockHeader {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::to_canonical(self)
    }

    pub fn hash(&self) -> Hash32 {
        match self.canonical_bytes() {
            Ok(bytes) => hash_bytes(&bytes),
            Err(_) => Hash32::zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash32 {
        self.header.hash()
    }

    pub fn tx_ids(&self) -> Vec<Hash32> {
        self.transactions.iter().map(|tx| tx.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            height: 1,
            prev_hash: Hash32::zero(),
            timestamp: 1_700_000_000,
            slot: 42,
            proposer: ConsensusAddress("cpcvalconsxyz".into()),
            tx_root: Hash32::zero(),
            state_root: Hash32::zero(),
            compute_root: Hash32::zero(),
            version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn header_hash_is_stable() {
        let header = sample_header();
        assert_eq!(header.hash(), header.hash());
    }

    #[test]
    fn header_hash_tracks_contents() {
        let header = sample_header();
        let mut other = header.clone();
        other.height = 2;
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn block_round_trip() {
        let block = Block {
            header: sample_header(),
            transactions: vec![],
            signature: vec![7; 64],
        };
        let bytes = codec::to_canonical(&block).unwrap();
        let back: Block = codec::from_canonical(&bytes).unwrap();
        assert_eq!(block, back);
    }
}
