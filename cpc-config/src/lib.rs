//! Node configuration, the genesis document on disk and the validator key
//! file. Config loads from a TOML file layered with `CPC__`-prefixed
//! environment overrides.

use cpc_core::{cpc, Genesis, GenesisAccount, GenesisParams, GenesisValidator, ValidatorMetadata};
use cpc_crypto::KeyMaterial;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const GENESIS_FILE: &str = "genesis.json";
pub const CONFIG_FILE: &str = "config.toml";
pub const VALIDATOR_KEY_FILE: &str = "keys/validator_key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad genesis: {0}")]
    BadGenesis(String),
    #[error("bad key file: {0}")]
    BadKey(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    pub listen_addr: String,
    pub seed_peers: Vec<String>,
    pub peer_io_timeout_secs: u64,
    pub blacklist_secs: u64,
    pub max_sync_batch: u64,
    /// Fall back to snapshot bootstrap when this many blocks behind.
    pub snapshot_sync_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfigSection {
    pub max_size: usize,
    pub price_bump_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub node_id: String,
    pub p2p: P2pConfig,
    pub rpc: RpcConfig,
    pub mempool: MempoolConfigSection,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("CPC").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            node_id: "cpc-node-1".into(),
            p2p: P2pConfig {
                listen_addr: "0.0.0.0:7800".into(),
                seed_peers: vec![],
                peer_io_timeout_secs: 30,
                blacklist_secs: 300,
                max_sync_batch: 128,
                snapshot_sync_threshold: 1_000,
            },
            rpc: RpcConfig {
                listen_addr: "127.0.0.1:8800".into(),
            },
            mempool: MempoolConfigSection {
                max_size: 5_000,
                price_bump_bps: 1_000,
            },
        }
    }

    pub fn write_example(path: &Path, data_dir: PathBuf) -> Result<(), ConfigError> {
        let cfg = Self::example(data_dir);
        let text = toml::to_string_pretty(&cfg)
            .map_err(|e| ConfigError::BadGenesis(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.data_dir.join(GENESIS_FILE)
    }

    pub fn validator_key_path(&self) -> PathBuf {
        self.data_dir.join(VALIDATOR_KEY_FILE)
    }
}

/// Read and sanity-check the genesis document. All nodes of one network
/// must load byte-identical copies.
pub fn load_genesis(path: &Path) -> Result<Genesis, ConfigError> {
    let bytes = fs::read(path)?;
    let genesis: Genesis = serde_json::from_slice(&bytes)
        .map_err(|e| ConfigError::BadGenesis(e.to_string()))?;
    validate_genesis(&genesis)?;
    Ok(genesis)
}

pub fn save_genesis(path: &Path, genesis: &Genesis) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(genesis)
        .map_err(|e| ConfigError::BadGenesis(e.to_string()))?;
    fs::write(path, bytes)?;
    Ok(())
}

fn validate_genesis(genesis: &Genesis) -> Result<(), ConfigError> {
    if genesis.network_id.is_empty() {
        return Err(ConfigError::BadGenesis("empty network id".into()));
    }
    if genesis.params.block_time_seconds == 0 {
        return Err(ConfigError::BadGenesis("zero block time".into()));
    }
    if genesis.params.epoch_length_blocks == 0 {
        return Err(ConfigError::BadGenesis("zero epoch length".into()));
    }
    let mut seen = std::collections::BTreeSet::new();
    for v in &genesis.initial_validators {
        if !seen.insert(&v.consensus_addr) {
            return Err(ConfigError::BadGenesis(format!(
                "duplicate validator {}",
                v.consensus_addr
            )));
        }
    }
    Ok(())
}

/// Load the validator key from `keys/validator_key`.
pub fn load_validator_key(path: &Path) -> Result<KeyMaterial, ConfigError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| ConfigError::BadKey(e.to_string()))
}

pub fn save_validator_key(path: &Path, key: &KeyMaterial) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes =
        serde_json::to_vec_pretty(key).map_err(|e| ConfigError::BadKey(e.to_string()))?;
    fs::write(path, bytes)?;
    Ok(())
}

/// A deterministic single-validator development genesis: the key's account
/// operates the validator and holds a funded balance.
pub fn dev_genesis(network_id: &str, genesis_time: u64, key: &KeyMaterial) -> Genesis {
    let operator = cpc_crypto::account_address(&key.public_key)
        .unwrap_or_else(|_| cpc_core::AccountAddress("cpcdev".into()));
    let consensus = cpc_crypto::consensus_address(&key.public_key)
        .unwrap_or_else(|_| cpc_core::ConsensusAddress("cpcvalconsdev".into()));
    Genesis {
        network_id: network_id.to_string(),
        genesis_time,
        params: GenesisParams::default(),
        initial_validators: vec![GenesisValidator {
            consensus_addr: consensus,
            operator_addr: operator.clone(),
            pubkey: key.public_key.clone(),
            self_stake: cpc(100_000),
            metadata: ValidatorMetadata {
                name: "dev-validator".into(),
                website: String::new(),
                description: String::new(),
            },
        }],
        initial_accounts: vec![GenesisAccount {
            address: operator,
            balance: cpc(1_000_000),
            pubkey: Some(key.public_key.clone()),
        }],
    }
}

/// Create a fresh data directory: config, dev genesis and validator key.
/// Existing files are left untouched.
pub fn init_data_dir(data_dir: &Path, network_id: &str, genesis_time: u64) -> Result<(), ConfigError> {
    fs::create_dir_all(data_dir)?;
    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        NodeConfig::write_example(&config_path, data_dir.to_path_buf())?;
    }
    let key_path = data_dir.join(VALIDATOR_KEY_FILE);
    let key = if key_path.exists() {
        load_validator_key(&key_path)?
    } else {
        let key = cpc_crypto::generate_keypair();
        save_validator_key(&key_path, &key)?;
        key
    };
    let genesis_path = data_dir.join(GENESIS_FILE);
    if !genesis_path.exists() {
        save_genesis(&genesis_path, &dev_genesis(network_id, genesis_time, &key))?;
    }
    info!(dir = %data_dir.display(), "data directory initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_loadable_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        init_data_dir(dir.path(), "computechain-dev", 1_700_000_000).unwrap();

        let cfg = NodeConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(cfg.mempool.max_size, 5_000);

        let genesis = load_genesis(&dir.path().join(GENESIS_FILE)).unwrap();
        assert_eq!(genesis.network_id, "computechain-dev");
        assert_eq!(genesis.initial_validators.len(), 1);

        let key = load_validator_key(&dir.path().join(VALIDATOR_KEY_FILE)).unwrap();
        let derived = cpc_crypto::consensus_address(&key.public_key).unwrap();
        assert_eq!(genesis.initial_validators[0].consensus_addr, derived);
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_data_dir(dir.path(), "computechain-dev", 1_700_000_000).unwrap();
        let first = load_genesis(&dir.path().join(GENESIS_FILE)).unwrap();
        init_data_dir(dir.path(), "computechain-dev", 1_800_000_000).unwrap();
        let second = load_genesis(&dir.path().join(GENESIS_FILE)).unwrap();
        // Re-running init must not regenerate network identity.
        assert_eq!(first.hash().unwrap(), second.hash().unwrap());
    }

    #[test]
    fn genesis_validation_rejects_duplicates() {
        let key = cpc_crypto::generate_keypair();
        let mut genesis = dev_genesis("net", 1, &key);
        genesis
            .initial_validators
            .push(genesis.initial_validators[0].clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GENESIS_FILE);
        save_genesis(&path, &genesis).unwrap();
        assert!(load_genesis(&path).is_err());
    }
}
