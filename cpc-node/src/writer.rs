//! The single-writer task. It exclusively owns the state machine and the
//! block store; every other task talks to it through `NodeCommand`. No
//! other module in the process mutates chain state.

use crate::metrics::EconomicMetrics;
use cpc_consensus::{proposer_for_slot, SlotClock};
use cpc_core::{Block, ChainEvent, EventBus, Transaction};
use cpc_crypto::KeyMaterial;
use cpc_mempool::Mempool;
use cpc_network::NetworkHandle;
use cpc_rpc::NodeInfo;
use cpc_snapshot::{should_snapshot, SnapshotStore};
use cpc_state::ChainState;
use cpc_storage::{FileBlockStore, PeerStore, StateDb};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub enum NodeCommand {
    /// The slot timer fired and this node may be the designated proposer.
    ProposeSlot { slot: u64, timestamp: u64 },
    PeerBlock { from: String, block: Box<Block> },
    PeerBlocks { from: String, blocks: Vec<Block> },
    PeerTx { from: String, tx: Box<Transaction> },
    PeerConnected { addr: String, tip_height: u64 },
    /// A transaction the RPC surface already admitted; relay it.
    RelayTx { tx: Box<Transaction> },
    MempoolTick { now: u64 },
    Shutdown { done: oneshot::Sender<()> },
}

pub struct Writer {
    pub state: ChainState,
    pub view: Arc<RwLock<ChainState>>,
    pub store: Arc<FileBlockStore>,
    pub state_db: StateDb,
    pub snapshots: Arc<SnapshotStore>,
    pub peer_store: PeerStore,
    pub mempool: Arc<Mempool>,
    pub events: EventBus,
    pub network: NetworkHandle,
    pub clock: SlotClock,
    pub validator_key: Option<KeyMaterial>,
    pub metrics: EconomicMetrics,
    pub info: Arc<RwLock<NodeInfo>>,
    pub snapshot_sync_threshold: u64,
    pub max_sync_batch: u64,
}

impl Writer {
    pub async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                NodeCommand::ProposeSlot { slot, timestamp } => self.propose(slot, timestamp).await,
                NodeCommand::PeerBlock { from, block } => self.on_peer_block(from, *block).await,
                NodeCommand::PeerBlocks { from, blocks } => self.on_peer_blocks(from, blocks).await,
                NodeCommand::PeerTx { from, tx } => self.on_peer_tx(from, *tx).await,
                NodeCommand::PeerConnected { addr, tip_height } => {
                    self.on_peer_connected(addr, tip_height).await
                }
                NodeCommand::RelayTx { tx } => {
                    self.network.mark_seen(tx.id());
                    self.network.broadcast_tx(&tx, None).await;
                }
                NodeCommand::MempoolTick { now } => self.mempool.tick(now),
                NodeCommand::Shutdown { done } => {
                    self.shutdown();
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    /// Build, commit and broadcast a block if this node is the designated
    /// proposer for `slot`.
    async fn propose(&mut self, slot: u64, timestamp: u64) {
        let Some(key) = self.validator_key.clone() else {
            return;
        };
        let Ok(our_addr) = cpc_crypto::consensus_address(&key.public_key) else {
            return;
        };
        if slot <= self.state.last_slot && self.state.height > 0 {
            return;
        }
        match proposer_for_slot(&self.state.active_set, slot) {
            Some(designated) if designated == &our_addr => {}
            _ => return,
        }

        let state = &self.state;
        let txs = self.mempool.drain_for_block(
            |sender| state.nonce_of(sender),
            state.params.block_gas_limit,
            state.params.max_tx_per_block,
        );
        let block = match cpc_consensus::build_block(&self.state, &txs, slot, timestamp, &key) {
            Ok(block) => block,
            Err(e) => {
                error!(%e, slot, "block assembly failed");
                return;
            }
        };
        match self.state.apply_block(&block) {
            Ok(outcome) => {
                info!(
                    height = block.header.height,
                    slot,
                    txs = outcome.confirmed.len(),
                    skipped = outcome.failed.len(),
                    "block proposed"
                );
                self.commit(&block, outcome, None).await;
            }
            Err(e) => error!(%e, "self-built block failed to apply"),
        }
    }

    async fn on_peer_block(&mut self, from: String, block: Block) {
        let height = block.header.height;
        if height <= self.state.height {
            return;
        }
        if height > self.state.height + 1 {
            self.catch_up(&from, height).await;
            return;
        }
        let now = crate::unix_now();
        if let Err(e) = cpc_consensus::validate_block(
            &self.state,
            &self.clock,
            &block,
            now,
            self.state.params.max_timestamp_skew_seconds,
        ) {
            warn!(%from, %e, height, "rejected peer block");
            return;
        }
        match self.state.apply_block(&block) {
            Ok(outcome) => {
                debug!(height, %from, "peer block applied");
                self.commit(&block, outcome, Some(&from)).await;
            }
            Err(e) => warn!(%from, %e, height, "peer block failed to apply"),
        }
    }

    async fn on_peer_blocks(&mut self, from: String, blocks: Vec<Block>) {
        let now = crate::unix_now();
        for block in blocks {
            if block.header.height <= self.state.height {
                continue;
            }
            if let Err(e) = cpc_consensus::validate_block(
                &self.state,
                &self.clock,
                &block,
                now,
                self.state.params.max_timestamp_skew_seconds,
            ) {
                warn!(%from, %e, height = block.header.height, "sync block invalid");
                return;
            }
            match self.state.apply_block(&block) {
                Ok(outcome) => self.commit_quiet(&block, outcome).await,
                Err(e) => {
                    warn!(%from, %e, height = block.header.height, "sync block failed");
                    return;
                }
            }
        }
        // Still behind the best peer? Ask for the next range.
        if let Some((peer, tip)) = self.network.best_peer() {
            if tip > self.state.height {
                let from_height = self.state.height + 1;
                let to = tip.min(from_height + self.max_sync_batch.saturating_sub(1));
                self.network.request_blocks(&peer, from_height, to).await;
            }
        }
    }

    async fn on_peer_tx(&mut self, from: String, tx: Transaction) {
        let state_nonce = self.state.nonce_of(&tx.sender);
        let now = crate::unix_now();
        match self.mempool.insert(tx.clone(), state_nonce, now) {
            cpc_mempool::InsertOutcome::Accepted | cpc_mempool::InsertOutcome::Replaced { .. } => {
                // Relay once, skipping the peer that sent it.
                self.network.broadcast_tx(&tx, Some(&from)).await;
            }
            cpc_mempool::InsertOutcome::Rejected(reason) => {
                debug!(%from, %reason, "peer tx rejected");
            }
        }
    }

    async fn on_peer_connected(&mut self, addr: String, tip_height: u64) {
        if tip_height <= self.state.height {
            return;
        }
        let behind = tip_height - self.state.height;
        if behind > self.snapshot_sync_threshold {
            self.bootstrap_from_snapshot();
        }
        let from = self.state.height + 1;
        let to = tip_height.min(from + self.max_sync_batch.saturating_sub(1));
        self.network.request_blocks(&addr, from, to).await;
    }

    /// Install the newest local snapshot ahead of the current height, then
    /// continue range sync from there.
    fn bootstrap_from_snapshot(&mut self) {
        let Ok(Some(height)) = self.snapshots.latest_height() else {
            return;
        };
        if height <= self.state.height {
            return;
        }
        match self.snapshots.load(height) {
            Ok(state) => {
                info!(height, "installed snapshot for fast sync");
                self.state = state;
                *self.view.write() = self.state.clone();
                self.network.set_tip_height(self.state.height);
            }
            Err(e) => warn!(%e, height, "snapshot bootstrap failed"),
        }
    }

    /// Ask a peer for the blocks between our tip and theirs.
    async fn catch_up(&mut self, peer: &str, their_height: u64) {
        let from = self.state.height + 1;
        let to = their_height.min(from + self.max_sync_batch.saturating_sub(1));
        self.network.request_blocks(peer, from, to).await;
    }

    /// Persistence, events, mempool maintenance, metrics and gossip for a
    /// freshly applied block.
    async fn commit(
        &mut self,
        block: &Block,
        outcome: cpc_state::ApplyOutcome,
        relay_except: Option<&str>,
    ) {
        self.commit_quiet(block, outcome).await;
        self.network.mark_seen(block.hash());
        self.network.broadcast_block(block, relay_except).await;
    }

    async fn commit_quiet(&mut self, block: &Block, outcome: cpc_state::ApplyOutcome) {
        if let Err(e) = self.store.append(block) {
            // A broken block store is not survivable.
            error!(%e, "block store append failed");
            std::process::exit(1);
        }
        if let Err(e) = self.state_db.save(&self.state) {
            error!(%e, "state persistence failed");
            std::process::exit(1);
        }
        *self.view.write() = self.state.clone();
        self.network.set_tip_height(self.state.height);

        let block_hash = block.hash();
        self.events.publish(ChainEvent::BlockCreated {
            block_hash,
            height: block.header.height,
        });
        for tx_id in &outcome.confirmed {
            self.events.publish(ChainEvent::TxConfirmed {
                tx_id: *tx_id,
                block_height: block.header.height,
                block_hash,
            });
        }
        for (tx_id, reason) in &outcome.failed {
            self.events.publish(ChainEvent::TxFailed {
                tx_id: *tx_id,
                reason: reason.clone(),
            });
        }

        let included: Vec<_> = block.transactions.iter().map(|tx| tx.id()).collect();
        let state = &self.state;
        self.mempool
            .on_block_applied(&included, |sender| state.nonce_of(sender));

        self.metrics.record_block(
            block.header.timestamp,
            outcome.confirmed.len() as u64,
            outcome.gas_used,
        );
        {
            let mut info = self.info.write();
            info.peer_count = self.network.peer_count();
            info.total_transactions = self.metrics.total_transactions();
            info.total_gas_used = self.metrics.total_gas_used();
            info.rolling_tps = self.metrics.rolling_tps();
        }

        let params = &self.state.params;
        if should_snapshot(
            self.state.height,
            params.snapshot_interval_blocks,
            params.epoch_length_blocks,
        ) {
            if let Err(e) = self.snapshots.write(&self.state) {
                warn!(%e, "snapshot write failed");
            }
            if let Err(e) = self.snapshots.prune(params.snapshot_keep) {
                warn!(%e, "snapshot prune failed");
            }
        }
    }

    /// Cooperative shutdown: final snapshot, state flush, store fsync,
    /// peer list persist.
    pub(crate) fn shutdown(&mut self) {
        info!(height = self.state.height, "shutting down");
        if self.state.height > 0 {
            if let Err(e) = self.snapshots.write(&self.state) {
                warn!(%e, "final snapshot failed");
            }
        }
        if let Err(e) = self.state_db.save(&self.state) {
            warn!(%e, "final state save failed");
        }
        if let Err(e) = self.store.sync() {
            warn!(%e, "block store sync failed");
        }
        if let Err(e) = self.peer_store.save(&self.network.peers()) {
            warn!(%e, "peer list save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpc_core::{codec, cpc, Amount, GenesisAccount, TxKind};
    use cpc_mempool::MempoolConfig;
    use cpc_network::NetworkConfig;
    use cpc_storage::BlockStore;

    #[tokio::test]
    async fn proposer_commits_mempool_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let key = cpc_crypto::generate_keypair();
        let operator = cpc_crypto::account_address(&key.public_key).unwrap();
        let user_key = cpc_crypto::generate_keypair();
        let user = cpc_crypto::account_address(&user_key.public_key).unwrap();

        let mut genesis = cpc_config::dev_genesis("computechain-test", 1_700_000_000, &key);
        genesis.initial_accounts.push(GenesisAccount {
            address: user.clone(),
            balance: cpc(100),
            pubkey: None,
        });
        let genesis_hash = genesis.hash().unwrap();
        let state = ChainState::from_genesis(&genesis).unwrap();

        let events = EventBus::new(64);
        let mempool = Arc::new(Mempool::new(MempoolConfig::default(), events.clone()));
        let mut tx = cpc_core::Transaction {
            kind: TxKind::Transfer,
            sender: user.clone(),
            recipient: Some(operator.clone()),
            amount: cpc(5),
            nonce: 0,
            gas_limit: TxKind::Transfer.base_gas(),
            gas_price: Amount::from(1_000u64),
            payload: vec![],
            pubkey: user_key.public_key.clone(),
            signature: vec![],
        };
        let signing = tx.signing_bytes().unwrap();
        tx.signature = cpc_crypto::sign(&user_key.secret_key, &signing).unwrap();
        assert_eq!(
            mempool.insert(tx.clone(), 0, 0),
            cpc_mempool::InsertOutcome::Accepted
        );

        let store = Arc::new(FileBlockStore::open(dir.path()).unwrap());
        let (net_tx, _net_rx) = mpsc::channel(16);
        let network = cpc_network::spawn(
            NetworkConfig::for_tests(genesis_hash, "writer-test"),
            store.clone(),
            net_tx,
        )
        .await
        .unwrap();

        let view = Arc::new(RwLock::new(state.clone()));
        let writer = Writer {
            state,
            view: view.clone(),
            store: store.clone(),
            state_db: StateDb::new(dir.path()).unwrap(),
            snapshots: Arc::new(SnapshotStore::new(dir.path()).unwrap()),
            peer_store: PeerStore::new(dir.path()).unwrap(),
            mempool: mempool.clone(),
            events: events.clone(),
            network,
            clock: SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds),
            validator_key: Some(key),
            metrics: EconomicMetrics::new(60),
            info: Arc::new(RwLock::new(NodeInfo::default())),
            snapshot_sync_threshold: 1_000,
            max_sync_batch: 128,
        };

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let mut event_rx = events.subscribe();
        let task = tokio::spawn(writer.run(commands_rx));

        commands_tx
            .send(NodeCommand::ProposeSlot {
                slot: 5,
                timestamp: genesis.genesis_time + 25,
            })
            .await
            .unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        commands_tx
            .send(NodeCommand::Shutdown { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();
        task.await.unwrap();

        assert_eq!(store.tip_height(), 1);
        let committed = view.read().clone();
        assert_eq!(committed.height, 1);
        assert_eq!(committed.nonce_of(&user), 1);
        assert!(mempool.is_empty());

        // Round trip through the persisted state file.
        let reloaded = StateDb::new(dir.path()).unwrap().load().unwrap().unwrap();
        assert_eq!(reloaded.state_root(), committed.state_root());
        let _ = codec::to_canonical(&reloaded).unwrap();

        // The block confirmation reached subscribers.
        let mut saw_confirm = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, ChainEvent::TxConfirmed { .. }) {
                saw_confirm = true;
            }
        }
        assert!(saw_confirm);
    }

    /// Two nodes sharing a genesis converge through gossip: the proposer
    /// commits locally, the peer validates, re-executes and lands on the
    /// same tip.
    #[tokio::test]
    async fn two_nodes_converge_via_gossip() {
        let key = cpc_crypto::generate_keypair();
        let genesis = cpc_config::dev_genesis("computechain-test", 1_700_000_000, &key);
        let genesis_hash = genesis.hash().unwrap();
        let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);

        let make_node = |dir: std::path::PathBuf,
                         validator_key: Option<KeyMaterial>,
                         node_id: String| {
            let genesis = genesis.clone();
            async move {
                let state = ChainState::from_genesis(&genesis).unwrap();
                let events = EventBus::new(64);
                let store = Arc::new(FileBlockStore::open(&dir).unwrap());
                let (net_tx, mut net_rx) = mpsc::channel(64);
                let network = cpc_network::spawn(
                    NetworkConfig::for_tests(genesis_hash, &node_id),
                    store.clone(),
                    net_tx,
                )
                .await
                .unwrap();
                let view = Arc::new(RwLock::new(state.clone()));
                let writer = Writer {
                    state,
                    view: view.clone(),
                    store: store.clone(),
                    state_db: StateDb::new(&dir).unwrap(),
                    snapshots: Arc::new(SnapshotStore::new(&dir).unwrap()),
                    peer_store: PeerStore::new(&dir).unwrap(),
                    mempool: Arc::new(Mempool::new(MempoolConfig::default(), events.clone())),
                    events,
                    network: network.clone(),
                    clock,
                    validator_key,
                    metrics: EconomicMetrics::new(60),
                    info: Arc::new(RwLock::new(cpc_rpc::NodeInfo::default())),
                    snapshot_sync_threshold: 1_000,
                    max_sync_batch: 128,
                };
                let (commands_tx, commands_rx) = mpsc::channel(64);
                tokio::spawn(writer.run(commands_rx));
                let forward = commands_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = net_rx.recv().await {
                        let command = match event {
                            cpc_network::NetEvent::PeerConnected { addr, tip_height } => {
                                NodeCommand::PeerConnected { addr, tip_height }
                            }
                            cpc_network::NetEvent::PeerDisconnected { .. } => continue,
                            cpc_network::NetEvent::BlockReceived { from, block } => {
                                NodeCommand::PeerBlock { from, block }
                            }
                            cpc_network::NetEvent::BlocksReceived { from, blocks } => {
                                NodeCommand::PeerBlocks { from, blocks }
                            }
                            cpc_network::NetEvent::TxReceived { from, tx } => {
                                NodeCommand::PeerTx { from, tx }
                            }
                        };
                        if forward.send(command).await.is_err() {
                            return;
                        }
                    }
                });
                (network, view, store, commands_tx)
            }
        };

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (net_a, _view_a, store_a, cmds_a) =
            make_node(dir_a.path().to_path_buf(), Some(key.clone()), "a".into()).await;
        let (net_b, view_b, store_b, _cmds_b) =
            make_node(dir_b.path().to_path_buf(), None, "b".into()).await;

        net_b.connect_with_retry(net_a.local_addr().to_string());
        for _ in 0..100 {
            if net_a.peer_count() == 1 && net_b.peer_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(net_b.peer_count(), 1);

        // A proposes at slot 5; the block must reach and apply on B.
        cmds_a
            .send(NodeCommand::ProposeSlot {
                slot: 5,
                timestamp: clock.slot_start(5),
            })
            .await
            .unwrap();

        let mut converged = false;
        for _ in 0..200 {
            if view_b.read().height == 1 {
                converged = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(converged, "peer never applied the gossiped block");
        assert_eq!(store_a.tip_height(), 1);
        assert_eq!(store_b.tip_height(), 1);
        assert_eq!(view_b.read().last_block_hash, store_a.block_by_height(1).unwrap().unwrap().hash());
    }
}
