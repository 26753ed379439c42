//! Node orchestration: wiring the state machine, stores, mempool,
//! consensus timer, P2P and RPC together around a single-writer task, plus
//! bootstrap (state.db / snapshot / replay) and cooperative shutdown.

pub mod metrics;
pub mod writer;

use anyhow::{Context, Result};
use cpc_config::NodeConfig;
use cpc_consensus::SlotClock;
use cpc_core::EventBus;
use cpc_mempool::{Mempool, MempoolConfig};
use cpc_network::{NetEvent, NetworkConfig};
use cpc_rpc::{NodeInfo, RpcState};
use cpc_snapshot::SnapshotStore;
use cpc_state::ChainState;
use cpc_storage::{BlockStore, FileBlockStore, PeerStore, StateDb};
use metrics::EconomicMetrics;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use writer::{NodeCommand, Writer};

pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Rebuild the working state: prefer `state.db`, fall back to the newest
/// snapshot, else genesis; then replay any blocks the store has beyond it.
fn bootstrap_state(
    genesis: &cpc_core::Genesis,
    state_db: &StateDb,
    snapshots: &SnapshotStore,
    store: &FileBlockStore,
) -> Result<ChainState> {
    let mut state = match state_db.load()? {
        Some(state) => state,
        None => match snapshots.latest_height()? {
            Some(height) => snapshots.load(height)?,
            None => ChainState::from_genesis(genesis)?,
        },
    };
    let tip = store.tip_height();
    if state.height < tip {
        info!(from = state.height + 1, to = tip, "replaying stored blocks");
        for height in state.height + 1..=tip {
            let block = store
                .block_by_height(height)?
                .with_context(|| format!("missing block {height} during replay"))?;
            state
                .apply_block(&block)
                .with_context(|| format!("stored block {height} failed to re-apply"))?;
        }
    }
    Ok(state)
}

/// Run the node until a shutdown signal arrives.
pub async fn run_node(config: NodeConfig) -> Result<()> {
    let genesis = cpc_config::load_genesis(&config.genesis_path())?;
    let genesis_hash = genesis.hash()?;
    info!(
        network = %genesis.network_id,
        genesis = %genesis_hash,
        "starting computechain node"
    );

    let data_dir = config.data_dir.clone();
    let store = Arc::new(FileBlockStore::open(&data_dir)?);
    let state_db = StateDb::new(&data_dir)?;
    let snapshots = Arc::new(SnapshotStore::new(&data_dir)?);
    let peer_store = PeerStore::new(&data_dir)?;

    let state = bootstrap_state(&genesis, &state_db, &snapshots, &store)?;
    info!(height = state.height, "state ready");
    let view = Arc::new(RwLock::new(state.clone()));

    let validator_key = match cpc_config::load_validator_key(&config.validator_key_path()) {
        Ok(key) => {
            let addr = cpc_crypto::consensus_address(&key.public_key)?;
            info!(validator = %addr, "validator key loaded");
            Some(key)
        }
        Err(e) => {
            info!(%e, "no validator key; running as a non-proposing node");
            None
        }
    };
    let our_validator = validator_key
        .as_ref()
        .and_then(|k| cpc_crypto::consensus_address(&k.public_key).ok());

    let events = EventBus::new(1024);
    let mempool = Arc::new(Mempool::new(
        MempoolConfig {
            max_size: config.mempool.max_size,
            tx_ttl_seconds: genesis.params.mempool_tx_ttl_seconds,
            price_bump_bps: config.mempool.price_bump_bps,
        },
        events.clone(),
    ));

    let (net_events_tx, mut net_events_rx) = mpsc::channel::<NetEvent>(256);
    let network = cpc_network::spawn(
        NetworkConfig {
            listen_addr: config.p2p.listen_addr.clone(),
            seed_peers: config.p2p.seed_peers.clone(),
            node_id: config.node_id.clone(),
            genesis_hash,
            validator: our_validator,
            peer_io_timeout_secs: config.p2p.peer_io_timeout_secs,
            blacklist_secs: config.p2p.blacklist_secs,
            max_sync_batch: config.p2p.max_sync_batch,
        },
        store.clone(),
        net_events_tx,
    )
    .await?;
    network.set_tip_height(state.height);
    // Redial peers remembered from the previous run.
    for peer in peer_store.load()? {
        if !config.p2p.seed_peers.contains(&peer) {
            network.connect_with_retry(peer);
        }
    }

    let info_handle = Arc::new(RwLock::new(NodeInfo::default()));
    let (relay_tx, mut relay_rx) = mpsc::channel(256);
    let rpc_state = RpcState {
        view: view.clone(),
        store: store.clone(),
        snapshots: snapshots.clone(),
        mempool: mempool.clone(),
        events: events.clone(),
        relay: relay_tx,
        info: info_handle.clone(),
    };
    let rpc_addr = config.rpc.listen_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = cpc_rpc::serve(&rpc_addr, rpc_state).await {
            warn!(%e, "rpc server stopped");
        }
    });

    let clock = SlotClock::new(genesis.genesis_time, genesis.params.block_time_seconds);
    let (commands_tx, commands_rx) = mpsc::channel::<NodeCommand>(256);

    let writer = Writer {
        state,
        view,
        store,
        state_db,
        snapshots,
        peer_store,
        mempool,
        events,
        network: network.clone(),
        clock,
        validator_key,
        metrics: EconomicMetrics::new(60),
        info: info_handle,
        snapshot_sync_threshold: config.p2p.snapshot_sync_threshold,
        max_sync_batch: config.p2p.max_sync_batch,
    };
    let writer_task = tokio::spawn(writer.run(commands_rx));

    // Network events feed the writer.
    let net_forward = commands_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = net_events_rx.recv().await {
            let command = match event {
                NetEvent::PeerConnected { addr, tip_height } => {
                    NodeCommand::PeerConnected { addr, tip_height }
                }
                NetEvent::PeerDisconnected { .. } => continue,
                NetEvent::BlockReceived { from, block } => NodeCommand::PeerBlock { from, block },
                NetEvent::BlocksReceived { from, blocks } => {
                    NodeCommand::PeerBlocks { from, blocks }
                }
                NetEvent::TxReceived { from, tx } => NodeCommand::PeerTx { from, tx },
            };
            if net_forward.send(command).await.is_err() {
                return;
            }
        }
    });

    // RPC-accepted transactions are relayed to peers.
    let relay_forward = commands_tx.clone();
    tokio::spawn(async move {
        while let Some(tx) = relay_rx.recv().await {
            if relay_forward
                .send(NodeCommand::RelayTx { tx: Box::new(tx) })
                .await
                .is_err()
            {
                return;
            }
        }
    });

    // Proposer timer: wake at every slot boundary.
    let proposer_commands = commands_tx.clone();
    tokio::spawn(async move {
        loop {
            let now = unix_now();
            let wait = clock.until_next_slot(now).max(1);
            tokio::time::sleep(Duration::from_secs(wait)).await;
            let now = unix_now();
            let slot = clock.slot_at(now);
            if proposer_commands
                .send(NodeCommand::ProposeSlot {
                    slot,
                    timestamp: now,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    });

    // Mempool TTL sweeper.
    let sweeper_commands = commands_tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if sweeper_commands
                .send(NodeCommand::MempoolTick { now: unix_now() })
                .await
                .is_err()
            {
                return;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let (done_tx, done_rx) = oneshot::channel();
    commands_tx
        .send(NodeCommand::Shutdown { done: done_tx })
        .await
        .ok();
    let _ = done_rx.await;
    writer_task.await.ok();
    Ok(())
}
