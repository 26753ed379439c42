//! Peer-to-peer networking: persistent TCP sessions speaking the
//! length-framed wire protocol, genesis-hash gating with a temporary
//! blacklist, gossip relay with a short-term dedup cache, and block-range
//! sync for peers that fall behind.

pub mod wire;

use cpc_core::{Block, ConsensusAddress, Hash32, NetError, Transaction};
use cpc_storage::BlockStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use wire::{read_frame, write_frame, Hello, Message};

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub seed_peers: Vec<String>,
    pub node_id: String,
    pub genesis_hash: Hash32,
    pub validator: Option<ConsensusAddress>,
    pub peer_io_timeout_secs: u64,
    pub blacklist_secs: u64,
    /// Largest number of blocks served per GetBlocks request.
    pub max_sync_batch: u64,
}

impl NetworkConfig {
    pub fn for_tests(genesis_hash: Hash32, node_id: &str) -> Self {
        Self {
            listen_addr: "127.0.0.1:0".into(),
            seed_peers: vec![],
            node_id: node_id.into(),
            genesis_hash,
            validator: None,
            peer_io_timeout_secs: 30,
            blacklist_secs: 300,
            max_sync_batch: 128,
        }
    }
}

/// Network happenings delivered to the node loop.
#[derive(Debug)]
pub enum NetEvent {
    PeerConnected { addr: String, tip_height: u64 },
    PeerDisconnected { addr: String },
    BlockReceived { from: String, block: Box<Block> },
    BlocksReceived { from: String, blocks: Vec<Block> },
    TxReceived { from: String, tx: Box<Transaction> },
}

struct PeerHandle {
    outbound: mpsc::Sender<Message>,
    tip_height: u64,
}

/// Bounded recently-seen cache breaking gossip loops.
struct SeenCache {
    set: HashSet<Hash32>,
    order: VecDeque<Hash32>,
    cap: usize,
}

impl SeenCache {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// True when the hash was not seen before.
    fn insert(&mut self, hash: Hash32) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

struct Shared {
    config: NetworkConfig,
    peers: Mutex<HashMap<String, PeerHandle>>,
    blacklist: Mutex<HashMap<String, Instant>>,
    seen: Mutex<SeenCache>,
    store: Arc<dyn BlockStore>,
    events: mpsc::Sender<NetEvent>,
    tip_height: Mutex<u64>,
}

/// Clonable surface the node uses to talk to the network.
#[derive(Clone)]
pub struct NetworkHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

/// Bind the listener, start dialing seeds, and return the handle.
pub async fn spawn(
    config: NetworkConfig,
    store: Arc<dyn BlockStore>,
    events: mpsc::Sender<NetEvent>,
) -> Result<NetworkHandle, NetError> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| NetError::Network(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| NetError::Network(e.to_string()))?;
    let shared = Arc::new(Shared {
        seen: Mutex::new(SeenCache::new(4096)),
        peers: Mutex::new(HashMap::new()),
        blacklist: Mutex::new(HashMap::new()),
        store,
        events,
        tip_height: Mutex::new(0),
        config,
    });
    info!(%local_addr, "p2p listening");

    let accept_shared = shared.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let shared = accept_shared.clone();
                    tokio::spawn(async move {
                        let addr = remote.to_string();
                        if let Err(e) = run_session(shared, stream, addr.clone()).await {
                            debug!(%addr, %e, "inbound session ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(%e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let handle = NetworkHandle {
        shared: shared.clone(),
        local_addr,
    };
    for seed in shared.config.seed_peers.clone() {
        handle.connect_with_retry(seed);
    }
    Ok(handle)
}

impl NetworkHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    pub fn peers(&self) -> Vec<String> {
        self.shared.peers.lock().keys().cloned().collect()
    }

    /// The connected peer with the highest advertised tip.
    pub fn best_peer(&self) -> Option<(String, u64)> {
        self.shared
            .peers
            .lock()
            .iter()
            .max_by_key(|(_, p)| p.tip_height)
            .map(|(addr, p)| (addr.clone(), p.tip_height))
    }

    /// Keep the advertised tip in Hello frames current.
    pub fn set_tip_height(&self, height: u64) {
        *self.shared.tip_height.lock() = height;
    }

    pub fn is_blacklisted(&self, addr: &str) -> bool {
        self.shared.is_blacklisted(addr)
    }

    /// Mark a gossip payload as seen; true when it was new. The node calls
    /// this for self-originated payloads so they are not re-delivered.
    pub fn mark_seen(&self, hash: Hash32) -> bool {
        self.shared.seen.lock().insert(hash)
    }

    /// Re-broadcast a validated block once, skipping the peer it came from.
    pub async fn broadcast_block(&self, block: &Block, except: Option<&str>) {
        self.broadcast(Message::Block(Box::new(block.clone())), except).await;
    }

    pub async fn broadcast_tx(&self, tx: &Transaction, except: Option<&str>) {
        self.broadcast(Message::Tx(Box::new(tx.clone())), except).await;
    }

    pub async fn request_blocks(&self, peer: &str, from: u64, to: u64) {
        let sender = self.shared.peers.lock().get(peer).map(|p| p.outbound.clone());
        if let Some(sender) = sender {
            let _ = sender
                .send(Message::GetBlocks(wire::BlockRange { from, to }))
                .await;
        }
    }

    async fn broadcast(&self, message: Message, except: Option<&str>) {
        let targets: Vec<(String, mpsc::Sender<Message>)> = self
            .shared
            .peers
            .lock()
            .iter()
            .filter(|(addr, _)| Some(addr.as_str()) != except)
            .map(|(addr, p)| (addr.clone(), p.outbound.clone()))
            .collect();
        for (addr, sender) in targets {
            if sender.send(message.clone()).await.is_err() {
                debug!(%addr, "peer outbound closed during broadcast");
            }
        }
    }

    /// Dial `addr` and keep redialing with backoff until connected or
    /// blacklisted.
    pub fn connect_with_retry(&self, addr: String) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if shared.is_blacklisted(&addr) {
                    debug!(%addr, "not dialing blacklisted peer");
                    return;
                }
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        if let Err(e) = run_session(shared.clone(), stream, addr.clone()).await {
                            debug!(%addr, %e, "outbound session ended");
                        }
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        debug!(%addr, %e, "dial failed");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        });
    }
}

impl Shared {
    fn is_blacklisted(&self, addr: &str) -> bool {
        let mut blacklist = self.blacklist.lock();
        match blacklist.get(addr) {
            Some(since) if since.elapsed() < Duration::from_secs(self.config.blacklist_secs) => true,
            Some(_) => {
                blacklist.remove(addr);
                false
            }
            None => false,
        }
    }

    fn blacklist(&self, addr: &str) {
        self.blacklist.lock().insert(addr.to_string(), Instant::now());
    }

    fn hello(&self) -> Hello {
        Hello {
            genesis_hash: self.config.genesis_hash,
            tip_height: *self.tip_height.lock(),
            node_id: self.config.node_id.clone(),
            validator: self.config.validator.clone(),
        }
    }
}

/// One full peer session: handshake, genesis gate, then the frame loop.
async fn run_session(shared: Arc<Shared>, stream: TcpStream, addr: String) -> Result<(), NetError> {
    let io_timeout = Duration::from_secs(shared.config.peer_io_timeout_secs);
    let (mut reader, mut writer) = stream.into_split();

    write_frame(&mut writer, &Message::Hello(shared.hello())).await?;
    let hello = match timeout(io_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Message::Hello(hello))) => hello,
        Ok(Ok(_)) => return Err(NetError::Network("expected Hello".into())),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(NetError::Timeout),
    };
    // The hard precondition: one byte-identical genesis per network.
    if hello.genesis_hash != shared.config.genesis_hash {
        warn!(%addr, "peer has a different genesis; closing and blacklisting");
        shared.blacklist(&addr);
        return Err(NetError::GenesisMismatch);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
    shared.peers.lock().insert(
        addr.clone(),
        PeerHandle {
            outbound: outbound_tx.clone(),
            tip_height: hello.tip_height,
        },
    );
    let _ = shared
        .events
        .send(NetEvent::PeerConnected {
            addr: addr.clone(),
            tip_height: hello.tip_height,
        })
        .await;
    info!(%addr, node_id = %hello.node_id, tip = hello.tip_height, "peer session established");

    let result = session_loop(&shared, &addr, &mut reader, &mut writer, &mut outbound_rx, io_timeout).await;

    shared.peers.lock().remove(&addr);
    let _ = shared
        .events
        .send(NetEvent::PeerDisconnected { addr: addr.clone() })
        .await;
    result
}

async fn session_loop<R, W>(
    shared: &Arc<Shared>,
    addr: &str,
    reader: &mut R,
    writer: &mut W,
    outbound: &mut mpsc::Receiver<Message>,
    io_timeout: Duration,
) -> Result<(), NetError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut keepalive = tokio::time::interval(io_timeout / 2);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(message) = outgoing else {
                    return Ok(());
                };
                write_frame(writer, &message).await?;
            }
            _ = keepalive.tick() => {
                write_frame(writer, &Message::Ping).await?;
            }
            incoming = timeout(io_timeout, read_frame(reader)) => {
                let message = match incoming {
                    Ok(Ok(message)) => message,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(NetError::Timeout),
                };
                handle_message(shared, addr, message, writer).await?;
            }
        }
    }
}

async fn handle_message<W: AsyncWrite + Unpin>(
    shared: &Arc<Shared>,
    addr: &str,
    message: Message,
    writer: &mut W,
) -> Result<(), NetError> {
    match message {
        Message::Ping => write_frame(writer, &Message::Pong).await?,
        Message::Pong => {}
        Message::Hello(hello) => {
            if let Some(peer) = shared.peers.lock().get_mut(addr) {
                peer.tip_height = hello.tip_height;
            }
        }
        Message::Block(block) => {
            if shared.seen.lock().insert(block.hash()) {
                let _ = shared
                    .events
                    .send(NetEvent::BlockReceived {
                        from: addr.to_string(),
                        block,
                    })
                    .await;
            }
        }
        Message::Tx(tx) => {
            if shared.seen.lock().insert(tx.id()) {
                let _ = shared
                    .events
                    .send(NetEvent::TxReceived {
                        from: addr.to_string(),
                        tx,
                    })
                    .await;
            }
        }
        Message::GetBlocks(range) => {
            let to = range
                .to
                .min(range.from.saturating_add(shared.config.max_sync_batch.saturating_sub(1)));
            let blocks = shared
                .store
                .blocks_in_range(range.from, to)
                .map_err(|e| NetError::Network(e.to_string()))?;
            write_frame(writer, &Message::Blocks(blocks)).await?;
        }
        Message::Blocks(blocks) => {
            let _ = shared
                .events
                .send(NetEvent::BlocksReceived {
                    from: addr.to_string(),
                    blocks,
                })
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpc_core::{hash_bytes, BlockHeader, PROTOCOL_VERSION};
    use cpc_storage::FileBlockStore;

    fn test_block(height: u64, prev: Hash32) -> Block {
        Block {
            header: BlockHeader {
                height,
                prev_hash: prev,
                timestamp: 1_700_000_000 + height,
                slot: height,
                proposer: ConsensusAddress("cpcvalconsabc".into()),
                tx_root: Hash32::zero(),
                state_root: Hash32::zero(),
                compute_root: Hash32::zero(),
                version: PROTOCOL_VERSION,
            },
            transactions: vec![],
            signature: vec![],
        }
    }

    async fn spawn_node(
        genesis_hash: Hash32,
        node_id: &str,
        dir: &std::path::Path,
    ) -> (NetworkHandle, mpsc::Receiver<NetEvent>, Arc<FileBlockStore>) {
        let store = Arc::new(FileBlockStore::open(dir).unwrap());
        let (tx, rx) = mpsc::channel(64);
        let handle = spawn(
            NetworkConfig::for_tests(genesis_hash, node_id),
            store.clone(),
            tx,
        )
        .await
        .unwrap();
        (handle, rx, store)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// S6: a genesis mismatch closes the session before any exchange and
    /// blacklists the peer.
    #[tokio::test]
    async fn genesis_mismatch_closes_and_blacklists() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (a, _a_rx, _) = spawn_node(hash_bytes(b"network-one"), "a", dir_a.path()).await;
        let (b, _b_rx, _) = spawn_node(hash_bytes(b"network-two"), "b", dir_b.path()).await;

        let a_addr = a.local_addr().to_string();
        b.connect_with_retry(a_addr.clone());

        assert!(wait_for(|| b.is_blacklisted(&a_addr)).await);
        assert_eq!(a.peer_count(), 0);
        assert_eq!(b.peer_count(), 0);
    }

    #[tokio::test]
    async fn matching_genesis_connects_and_gossips_blocks() {
        let genesis = hash_bytes(b"same-network");
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (a, _a_rx, _) = spawn_node(genesis, "a", dir_a.path()).await;
        let (b, mut b_rx, _) = spawn_node(genesis, "b", dir_b.path()).await;

        b.connect_with_retry(a.local_addr().to_string());
        assert!(wait_for(|| a.peer_count() == 1 && b.peer_count() == 1).await);

        let block = test_block(1, Hash32::zero());
        a.mark_seen(block.hash());
        a.broadcast_block(&block, None).await;

        let event = timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap();
        match event {
            Some(NetEvent::PeerConnected { .. }) => {
                // Connection event first, block next.
                match timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap() {
                    Some(NetEvent::BlockReceived { block: received, .. }) => {
                        assert_eq!(received.hash(), block.hash());
                    }
                    other => panic!("expected BlockReceived, got {other:?}"),
                }
            }
            Some(NetEvent::BlockReceived { block: received, .. }) => {
                assert_eq!(received.hash(), block.hash());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_blocks_serves_a_range_from_the_store() {
        let genesis = hash_bytes(b"sync-network");
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (a, _a_rx, a_store) = spawn_node(genesis, "a", dir_a.path()).await;
        let (b, mut b_rx, _) = spawn_node(genesis, "b", dir_b.path()).await;

        let b1 = test_block(1, Hash32::zero());
        let b2 = test_block(2, b1.hash());
        a_store.append(&b1).unwrap();
        a_store.append(&b2).unwrap();
        a.set_tip_height(2);

        b.connect_with_retry(a.local_addr().to_string());
        assert!(wait_for(|| b.peer_count() == 1).await);

        let (peer, tip) = b.best_peer().unwrap();
        assert_eq!(tip, 2);
        b.request_blocks(&peer, 1, 2).await;

        let mut blocks = None;
        for _ in 0..10 {
            match timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap() {
                Some(NetEvent::BlocksReceived { blocks: received, .. }) => {
                    blocks = Some(received);
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        let blocks = blocks.expect("sync response");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].header.height, 1);
        assert_eq!(blocks[1].header.height, 2);
    }

    #[test]
    fn seen_cache_is_bounded_and_deduplicates() {
        let mut cache = SeenCache::new(2);
        let h1 = hash_bytes(b"1");
        let h2 = hash_bytes(b"2");
        let h3 = hash_bytes(b"3");
        assert!(cache.insert(h1));
        assert!(!cache.insert(h1));
        assert!(cache.insert(h2));
        assert!(cache.insert(h3));
        // h1 was evicted by capacity, so it is new again.
        assert!(cache.insert(h1));
    }
}
