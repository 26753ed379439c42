//! Compressed state snapshots for fast sync.
//!
//! A snapshot is the canonical encoding of the full state, gzip-compressed
//! into `snapshots/snapshot-<height>.json.gz` with a SHA-256 digest
//! sidecar. Loading verifies the digest before anything is installed.

use cpc_core::codec;
use cpc_state::ChainState;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot digest mismatch for height {0}")]
    DigestMismatch(u64),
    #[error("snapshot codec: {0}")]
    Codec(#[from] cpc_core::CodecError),
    #[error("no snapshot at height {0}")]
    NotFound(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub height: u64,
    pub path: PathBuf,
    pub digest: String,
    pub size_bytes: u64,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Result<Self, SnapshotError> {
        let dir = data_dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn data_path(&self, height: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{height:010}.json.gz"))
    }

    fn digest_path(&self, height: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{height:010}.sha256"))
    }

    /// Serialize, compress and persist `state`, then write the digest
    /// sidecar over the compressed bytes.
    pub fn write(&self, state: &ChainState) -> Result<SnapshotInfo, SnapshotError> {
        let height = state.height;
        let bytes = codec::to_canonical(state)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        let compressed = encoder.finish()?;
        let digest = hex::encode(Sha256::digest(&compressed));

        let data_path = self.data_path(height);
        let mut file = File::create(&data_path)?;
        file.write_all(&compressed)?;
        file.sync_all()?;
        fs::write(self.digest_path(height), &digest)?;
        info!(height, size = compressed.len(), "snapshot written");
        Ok(SnapshotInfo {
            height,
            path: data_path,
            digest,
            size_bytes: compressed.len() as u64,
        })
    }

    /// Verify the sidecar digest and deserialize the snapshot. The caller
    /// installs the returned state atomically and resumes sync at
    /// `height + 1`.
    pub fn load(&self, height: u64) -> Result<ChainState, SnapshotError> {
        let data_path = self.data_path(height);
        if !data_path.exists() {
            return Err(SnapshotError::NotFound(height));
        }
        let mut compressed = Vec::new();
        File::open(&data_path)?.read_to_end(&mut compressed)?;
        let expected = fs::read_to_string(self.digest_path(height))
            .map_err(|_| SnapshotError::DigestMismatch(height))?;
        let actual = hex::encode(Sha256::digest(&compressed));
        if actual != expected.trim() {
            return Err(SnapshotError::DigestMismatch(height));
        }
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        Ok(codec::from_canonical(&bytes)?)
    }

    /// All snapshots on disk, ascending by height.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, SnapshotError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(height) = name
                .strip_prefix("snapshot-")
                .and_then(|s| s.strip_suffix(".json.gz"))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let digest = fs::read_to_string(self.digest_path(height)).unwrap_or_default();
            out.push(SnapshotInfo {
                height,
                path: entry.path(),
                digest: digest.trim().to_string(),
                size_bytes: entry.metadata()?.len(),
            });
        }
        out.sort_by_key(|s| s.height);
        Ok(out)
    }

    pub fn latest_height(&self) -> Result<Option<u64>, SnapshotError> {
        Ok(self.list()?.last().map(|s| s.height))
    }

    /// Keep the newest `keep` snapshots; delete the rest with their
    /// sidecars.
    pub fn prune(&self, keep: usize) -> Result<(), SnapshotError> {
        let snapshots = self.list()?;
        if snapshots.len() <= keep {
            return Ok(());
        }
        for snapshot in &snapshots[..snapshots.len() - keep] {
            fs::remove_file(&snapshot.path)?;
            let _ = fs::remove_file(self.digest_path(snapshot.height));
            info!(height = snapshot.height, "snapshot pruned");
        }
        Ok(())
    }
}

/// Snapshots are taken at every interval boundary and at every epoch
/// boundary.
pub fn should_snapshot(height: u64, snapshot_interval: u64, epoch_length: u64) -> bool {
    if height == 0 {
        return false;
    }
    (snapshot_interval > 0 && height % snapshot_interval == 0)
        || (epoch_length > 0 && height % epoch_length == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpc_core::{cpc, AccountAddress, Genesis, GenesisAccount, GenesisParams};

    fn state_at(height: u64) -> ChainState {
        let genesis = Genesis {
            network_id: "computechain-test".into(),
            genesis_time: 1_700_000_000,
            params: GenesisParams::default(),
            initial_validators: vec![],
            initial_accounts: vec![GenesisAccount {
                address: AccountAddress("cpcalice".into()),
                balance: cpc(100),
                pubkey: None,
            }],
        };
        let mut state = ChainState::from_genesis(&genesis).unwrap();
        state.height = height;
        state
    }

    #[test]
    fn write_then_load_preserves_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let state = state_at(500);
        let info = store.write(&state).unwrap();
        assert_eq!(info.height, 500);

        let loaded = store.load(500).unwrap();
        assert_eq!(loaded.state_root(), state.state_root());
        assert_eq!(loaded.height, 500);
    }

    #[test]
    fn tampering_fails_the_digest_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let info = store.write(&state_at(100)).unwrap();

        let mut bytes = fs::read(&info.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&info.path, bytes).unwrap();

        assert!(matches!(
            store.load(100),
            Err(SnapshotError::DigestMismatch(100))
        ));
    }

    #[test]
    fn prune_keeps_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        for height in [100, 200, 300, 400] {
            store.write(&state_at(height)).unwrap();
        }
        store.prune(2).unwrap();
        let remaining: Vec<u64> = store.list().unwrap().iter().map(|s| s.height).collect();
        assert_eq!(remaining, vec![300, 400]);
        assert_eq!(store.latest_height().unwrap(), Some(400));
    }

    #[test]
    fn snapshot_cadence() {
        assert!(should_snapshot(500, 500, 100));
        assert!(should_snapshot(300, 500, 100)); // epoch boundary
        assert!(!should_snapshot(301, 500, 100));
        assert!(!should_snapshot(0, 500, 100));
    }

    /// Resuming from a snapshot and applying the remaining blocks must
    /// land on the same state as replaying the whole chain from genesis.
    #[test]
    fn snapshot_plus_replay_equals_full_replay() {
        let key = cpc_crypto::generate_keypair();
        let operator = cpc_crypto::account_address(&key.public_key).unwrap();
        let genesis = Genesis {
            network_id: "computechain-test".into(),
            genesis_time: 1_700_000_000,
            params: GenesisParams::default(),
            initial_validators: vec![cpc_core::GenesisValidator {
                consensus_addr: cpc_crypto::consensus_address(&key.public_key).unwrap(),
                operator_addr: operator.clone(),
                pubkey: key.public_key.clone(),
                self_stake: cpc(10_000),
                metadata: cpc_core::ValidatorMetadata::default(),
            }],
            initial_accounts: vec![GenesisAccount {
                address: operator,
                balance: cpc(100),
                pubkey: None,
            }],
        };
        let clock = cpc_consensus::SlotClock::new(
            genesis.genesis_time,
            genesis.params.block_time_seconds,
        );

        let mut full = ChainState::from_genesis(&genesis).unwrap();
        let mut blocks = Vec::new();
        for slot in 1..=4u64 {
            let block = cpc_consensus::build_block(&full, &[], slot, clock.slot_start(slot), &key)
                .unwrap();
            full.apply_block(&block).unwrap();
            blocks.push(block);
        }

        // Snapshot the state as of height 2, then resume from it.
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let mut resumed = ChainState::from_genesis(&genesis).unwrap();
        resumed.apply_block(&blocks[0]).unwrap();
        resumed.apply_block(&blocks[1]).unwrap();
        store.write(&resumed).unwrap();

        let mut from_snapshot = store.load(2).unwrap();
        from_snapshot.apply_block(&blocks[2]).unwrap();
        from_snapshot.apply_block(&blocks[3]).unwrap();

        assert_eq!(from_snapshot.state_root(), full.state_root());
        assert_eq!(from_snapshot.height, full.height);
        assert_eq!(from_snapshot.last_block_hash, full.last_block_hash);
    }
}
