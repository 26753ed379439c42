//! Persistence for the node's data directory:
//!
//! - `blocks.db` — append-only chain of canonically encoded blocks, one
//!   per line, heights strictly consecutive from 1.
//! - `state.db` — the current state, rewritten atomically.
//! - `peers.json` — last known good peer addresses.
//!
//! The block store is multi-reader single-writer; all writes append.

use cpc_core::{codec, Block, Hash32, StoreError};
use cpc_state::ChainState;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const BLOCKS_FILE: &str = "blocks.db";
pub const STATE_FILE: &str = "state.db";
pub const PEERS_FILE: &str = "peers.json";

/// Read surface shared by the RPC layer and the sync responder.
pub trait BlockStore: Send + Sync {
    fn tip_height(&self) -> u64;
    fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError>;
    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, StoreError>;
    /// Inclusive range, capped at the tip.
    fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<Block>, StoreError>;
}

/// Append-only file-backed chain store.
pub struct FileBlockStore {
    path: PathBuf,
    file: Mutex<File>,
    index: RwLock<BlockIndex>,
}

#[derive(Default)]
struct BlockIndex {
    /// Byte offset of the line for height `i + 1`.
    offsets: Vec<u64>,
    by_hash: HashMap<Hash32, u64>,
}

impl FileBlockStore {
    /// Open (or create) `blocks.db` under `dir` and rebuild the height
    /// index. A gap or an unparsable line is corruption and is fatal.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(BLOCKS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut index = BlockIndex::default();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut offset = 0u64;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            let block: Block = codec::from_canonical(line.trim_end().as_bytes())
                .map_err(|_| StoreError::Corrupt(format!("bad block line at offset {offset}")))?;
            let expected = index.offsets.len() as u64 + 1;
            if block.header.height != expected {
                return Err(StoreError::Corrupt(format!(
                    "non-consecutive height {} (expected {expected})",
                    block.header.height
                )));
            }
            index.by_hash.insert(block.hash(), block.header.height);
            index.offsets.push(offset);
            offset += read as u64;
        }
        info!(tip = index.offsets.len(), path = %path.display(), "block store opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            index: RwLock::new(index),
        })
    }

    /// Append the next block. Heights must be strictly consecutive.
    pub fn append(&self, block: &Block) -> Result<(), StoreError> {
        let mut index = self.index.write();
        let expected = index.offsets.len() as u64 + 1;
        if block.header.height != expected {
            return Err(StoreError::Corrupt(format!(
                "append out of order: height {} (expected {expected})",
                block.header.height
            )));
        }
        let mut bytes = codec::to_canonical(block)?;
        bytes.push(b'\n');
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        file.flush()?;
        index.by_hash.insert(block.hash(), block.header.height);
        index.offsets.push(offset);
        Ok(())
    }

    /// Flush file buffers to disk; called on shutdown.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn read_at(&self, offset: u64) -> Result<Block, StoreError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        codec::from_canonical(line.trim_end().as_bytes())
            .map_err(|_| StoreError::Corrupt(format!("bad block line at offset {offset}")))
    }
}

impl BlockStore for FileBlockStore {
    fn tip_height(&self) -> u64 {
        self.index.read().offsets.len() as u64
    }

    fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let offset = {
            let index = self.index.read();
            if height == 0 || height > index.offsets.len() as u64 {
                return Ok(None);
            }
            index.offsets[height as usize - 1]
        };
        Ok(Some(self.read_at(offset)?))
    }

    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, StoreError> {
        let height = match self.index.read().by_hash.get(hash) {
            Some(h) => *h,
            None => return Ok(None),
        };
        self.block_by_height(height)
    }

    fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<Block>, StoreError> {
        let tip = self.tip_height();
        let mut out = Vec::new();
        for height in from..=to.min(tip) {
            if let Some(block) = self.block_by_height(height)? {
                out.push(block);
            }
        }
        Ok(out)
    }
}

/// Current-state persistence: whole-file rewrite through a temp file so a
/// crash never leaves a torn `state.db`.
pub struct StateDb {
    path: PathBuf,
}

impl StateDb {
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(STATE_FILE),
        })
    }

    pub fn save(&self, state: &ChainState) -> Result<(), StoreError> {
        let bytes = codec::to_canonical(state)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<ChainState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        let state = codec::from_canonical(&bytes)
            .map_err(|_| StoreError::Corrupt("unreadable state.db".into()))?;
        Ok(Some(state))
    }
}

/// Known-good peer addresses, persisted across restarts.
pub struct PeerStore {
    path: PathBuf,
}

impl PeerStore {
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(PEERS_FILE),
        })
    }

    pub fn save(&self, peers: &[String]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(peers)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<String>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}
