//! P2P Node implementation
//!
//! A node runs four kinds of tasks: an acceptor polling the listener, one
//! task per connection, an inbound worker processing messages in arrival
//! order, and a broadcast worker fanning queued messages out to peers.
//! All of them share one chain behind a single `RwLock`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};

use super::message::{
    ChainPayload, GetBlocksPayload, GetDataPayload, InvKind, InvPayload, Message,
    VersionPayload, MAX_GETBLOCKS_HASHES, PROTOCOL_VERSION,
};
use super::peer::{NetworkError, PeerManager};
use super::server::{establish, run_peer, Inbound};
use crate::core::{Block, Blockchain, BlockchainError, Transaction};

/// The chain, mempool and UTXO set, shared by every task of a node
pub type SharedBlockchain = Arc<RwLock<Blockchain>>;

/// Inbound message queue depth
pub const INBOX_CAPACITY: usize = 1000;

/// Broadcast queue depth
pub const BROADCAST_CAPACITY: usize = 1000;

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind, e.g. `127.0.0.1:8333`; port 0 picks a free port
    pub listen_addr: String,
    /// Address announced to peers; defaults to the bound address
    pub advertise_addr: Option<String>,
    /// Bootstrap peers dialed at start
    pub seeds: Vec<String>,
    /// How long one accept waits before the shutdown flag is rechecked
    pub accept_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long fork resolution waits for one peer's chain
    pub fetch_timeout: Duration,
    pub protocol_version: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8333".to_string(),
            advertise_addr: None,
            seeds: Vec::new(),
            accept_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Node status information
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub listen_addr: String,
    pub height: u64,
    pub tip_hash: String,
    pub difficulty: u32,
    pub peers: usize,
    pub known_peers: usize,
    pub mempool_size: usize,
    pub syncing: bool,
    pub running: bool,
}

struct Broadcast {
    message: Message,
    except: Option<SocketAddr>,
}

struct NodeInner {
    config: NodeConfig,
    local_addr: SocketAddr,
    advertised: String,
    blockchain: SharedBlockchain,
    peers: Arc<PeerManager>,
    inbox: mpsc::Sender<Inbound>,
    broadcasts: mpsc::Sender<Broadcast>,
    shutdown: watch::Sender<bool>,
    /// Outstanding `getchain` requests, by peer
    chain_requests: Mutex<HashMap<SocketAddr, oneshot::Sender<Vec<Block>>>>,
    syncing: AtomicBool,
}

/// The main P2P node. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind the listener, spawn the node's tasks and dial the seeds.
    /// Failing to bind is the only fatal error.
    pub async fn start(
        config: NodeConfig,
        blockchain: SharedBlockchain,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let advertised = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let (inbox, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (broadcasts, broadcast_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let node = Self {
            inner: Arc::new(NodeInner {
                config,
                local_addr,
                advertised,
                blockchain,
                peers: Arc::new(PeerManager::new()),
                inbox,
                broadcasts,
                shutdown,
                chain_requests: Mutex::new(HashMap::new()),
                syncing: AtomicBool::new(false),
            }),
        };

        tokio::spawn(node.clone().accept_loop(listener));
        tokio::spawn(node.clone().inbound_worker(inbox_rx));
        tokio::spawn(node.clone().broadcast_worker(broadcast_rx));
        info!("Node listening on {}", node.inner.advertised);

        for seed in node.inner.config.seeds.clone() {
            if let Err(e) = node.connect_to(&seed).await {
                warn!("Could not reach seed {}: {}", seed, e);
            }
        }

        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Address announced to peers
    pub fn address(&self) -> &str {
        &self.inner.advertised
    }

    pub fn blockchain(&self) -> SharedBlockchain {
        self.inner.blockchain.clone()
    }

    pub fn peers(&self) -> Arc<PeerManager> {
        self.inner.peers.clone()
    }

    pub fn is_running(&self) -> bool {
        !*self.inner.shutdown.borrow()
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    async fn accept_loop(self, listener: TcpListener) {
        let timeout = self.inner.config.accept_timeout;
        while self.is_running() {
            match tokio::time::timeout(timeout, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, addr))) => {
                    debug!("Incoming connection from {}", addr);
                    tokio::spawn(self.clone().serve(stream, false));
                }
                Ok(Err(e)) => warn!("Accept error: {}", e),
            }
        }
        debug!("Acceptor on {} stopped", self.inner.advertised);
    }

    async fn inbound_worker(self, mut inbox: mpsc::Receiver<Inbound>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                item = inbox.recv() => match item {
                    Some((from, msg)) => self.process_message(from, msg).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn broadcast_worker(self, mut queue: mpsc::Receiver<Broadcast>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                item = queue.recv() => match item {
                    Some(Broadcast { message, except }) => {
                        let sent = self.inner.peers.broadcast(&message, except).await;
                        debug!("Broadcast {} to {} peers", message.kind(), sent);
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn version_payload(&self) -> VersionPayload {
        VersionPayload {
            version: self.inner.config.protocol_version,
            address: self.inner.advertised.clone(),
            height: self.inner.blockchain.read().await.height(),
        }
    }

    /// Handshake, then hand the connection to its own receive loop
    async fn serve(self, stream: TcpStream, outbound: bool) {
        if let Err(e) = self.open(stream, outbound).await {
            warn!("Connection failed: {}", e);
        }
    }

    async fn open(&self, stream: TcpStream, outbound: bool) -> Result<SocketAddr, NetworkError> {
        let local = self.version_payload().await;
        let connection = establish(
            stream,
            outbound,
            local,
            &self.inner.peers,
            self.inner.config.handshake_timeout,
        )
        .await?;
        let addr = connection.addr;

        tokio::spawn(run_peer(
            connection,
            self.inner.peers.clone(),
            self.inner.inbox.clone(),
            self.inner.shutdown.subscribe(),
        ));
        Ok(addr)
    }

    /// Dial `addr` and complete the handshake
    pub async fn connect_to(&self, addr: &str) -> Result<SocketAddr, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        if addr == self.inner.advertised {
            return Err(NetworkError::Handshake("refusing to dial self".to_string()));
        }

        self.inner.peers.add_known(addr).await;
        let stream = tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout)??;

        let peer = self.open(stream, true).await?;
        info!("Connected to peer {}", addr);
        Ok(peer)
    }

    /// Queue a message for every peer except `except`
    async fn broadcast(&self, message: Message, except: Option<SocketAddr>) {
        if self
            .inner
            .broadcasts
            .send(Broadcast { message, except })
            .await
            .is_err()
        {
            debug!("Broadcast queue closed");
        }
    }

    async fn reply(&self, to: SocketAddr, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.inner.peers.send_to(&to, message).await {
            warn!("Failed to send {} to {}: {}", kind, to, e);
        }
    }

    /// Start fork resolution in the background
    fn spawn_resolve(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.resolve_conflicts().await {
                warn!("Fork resolution failed: {}", e);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Message processing
    // -------------------------------------------------------------------------

    /// Apply one message received from `from`
    pub async fn process_message(&self, from: SocketAddr, msg: Message) {
        match msg {
            Message::Version(version) => {
                self.inner.peers.add_known(&version.address).await;
                self.inner.peers.update_height(&from, version.height).await;
                let height = self.inner.blockchain.read().await.height();
                if version.height > height {
                    info!(
                        "Peer {} is ahead ({} > {}), resolving",
                        from, version.height, height
                    );
                    self.spawn_resolve();
                }
            }

            Message::Addr(addr) => {
                for peer in addr.peers {
                    if peer == self.inner.advertised || !self.inner.peers.add_known(&peer).await {
                        continue;
                    }
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.connect_to(&peer).await {
                            debug!("Could not dial {}: {}", peer, e);
                        }
                    });
                }
            }

            Message::Inv(InvPayload { kind, items }) => {
                let missing: Vec<String> = {
                    let chain = self.inner.blockchain.read().await;
                    items
                        .into_iter()
                        .filter(|hash| match kind {
                            InvKind::Block => !chain.has_block(hash),
                            InvKind::Tx => chain.get_transaction(hash).is_none(),
                        })
                        .collect()
                };
                for hash in missing {
                    self.reply(from, Message::GetData(GetDataPayload { kind, hash }))
                        .await;
                }
            }

            Message::GetData(GetDataPayload { kind, hash }) => {
                let found = {
                    let chain = self.inner.blockchain.read().await;
                    match kind {
                        InvKind::Block => chain.get_block_by_hash(&hash).cloned().map(Message::block),
                        InvKind::Tx => chain.get_transaction(&hash).cloned().map(Message::tx),
                    }
                };
                match found {
                    Some(message) => self.reply(from, message).await,
                    None => debug!("getdata for unknown {:?} {}", kind, hash),
                }
            }

            Message::Block(payload) => self.handle_block(from, payload.block).await,

            Message::Tx(payload) => self.handle_transaction(from, payload.transaction).await,

            Message::GetBlocks(GetBlocksPayload { start_height }) => {
                let hashes: Vec<String> = {
                    let chain = self.inner.blockchain.read().await;
                    let blocks = chain.blocks();
                    let from_start = blocks
                        .iter()
                        .filter(|b| b.index >= start_height)
                        .map(|b| b.hash.clone())
                        .collect::<Vec<_>>();
                    let skip = from_start.len().saturating_sub(MAX_GETBLOCKS_HASHES);
                    from_start.into_iter().skip(skip).collect()
                };
                self.reply(from, Message::inv(InvKind::Block, hashes)).await;
            }

            Message::GetChain => {
                let blocks = self.inner.blockchain.read().await.blocks().to_vec();
                self.reply(from, Message::Chain(ChainPayload { blocks })).await;
            }

            Message::Chain(ChainPayload { blocks }) => {
                let waiting = self.inner.chain_requests.lock().await.remove(&from);
                match waiting {
                    Some(tx) => {
                        let _ = tx.send(blocks);
                    }
                    None => {
                        let replaced = self.inner.blockchain.write().await.replace_chain(blocks);
                        if replaced {
                            self.announce_tip(None).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_block(&self, from: SocketAddr, block: Block) {
        let hash = block.hash.clone();
        let index = block.index;

        let result = {
            let mut chain = self.inner.blockchain.write().await;
            if chain.has_block(&hash) {
                debug!("Already have block {}", hash);
                return;
            }
            if index > chain.height() + 1 {
                None
            } else {
                Some(chain.accept_block(block))
            }
        };

        match result {
            None => {
                info!("Block {} from {} is beyond our tip, resolving", index, from);
                self.inner.peers.update_height(&from, index).await;
                self.spawn_resolve();
            }
            Some(Ok(())) => {
                self.inner.peers.update_height(&from, index).await;
                self.broadcast(Message::inv(InvKind::Block, vec![hash]), Some(from))
                    .await;
            }
            Some(Err(BlockchainError::InvalidPreviousHash(_))) => {
                info!("Block {} from {} forks our chain, resolving", index, from);
                self.spawn_resolve();
            }
            Some(Err(e)) => warn!("Rejected block {} from {}: {}", index, from, e),
        }
    }

    async fn handle_transaction(&self, from: SocketAddr, tx: Transaction) {
        let id = tx.id.clone();
        let result = {
            let mut chain = self.inner.blockchain.write().await;
            if chain.mempool().contains(&id) {
                return;
            }
            chain.add_transaction(tx)
        };

        match result {
            Ok(_) => {
                self.broadcast(Message::inv(InvKind::Tx, vec![id]), Some(from))
                    .await
            }
            Err(e) => debug!("Rejected transaction {} from {}: {}", id, from, e),
        }
    }

    async fn announce_tip(&self, except: Option<SocketAddr>) {
        let tip = self.inner.blockchain.read().await.latest_block().hash.clone();
        self.broadcast(Message::inv(InvKind::Block, vec![tip]), except)
            .await;
    }

    // -------------------------------------------------------------------------
    // Service surface
    // -------------------------------------------------------------------------

    /// Fetch every active peer's chain and adopt any strictly longer valid
    /// one. Returns whether the local chain changed.
    pub async fn resolve_conflicts(&self) -> Result<bool, NetworkError> {
        if self.inner.syncing.swap(true, Ordering::SeqCst) {
            debug!("Fork resolution already running");
            return Ok(false);
        }

        let mut replaced = false;
        for peer in self.inner.peers.active_peers().await {
            let Some(blocks) = self.fetch_chain(peer).await else {
                continue;
            };
            if self.inner.blockchain.write().await.replace_chain(blocks) {
                info!("Adopted chain from {}", peer);
                replaced = true;
            }
        }

        self.inner.syncing.store(false, Ordering::SeqCst);
        if replaced {
            self.announce_tip(None).await;
        }
        Ok(replaced)
    }

    async fn fetch_chain(&self, peer: SocketAddr) -> Option<Vec<Block>> {
        let (tx, rx) = oneshot::channel();
        self.inner.chain_requests.lock().await.insert(peer, tx);

        if let Err(e) = self.inner.peers.send_to(&peer, Message::GetChain).await {
            debug!("Could not request chain from {}: {}", peer, e);
            self.inner.chain_requests.lock().await.remove(&peer);
            return None;
        }

        match tokio::time::timeout(self.inner.config.fetch_timeout, rx).await {
            Ok(Ok(blocks)) => Some(blocks),
            _ => {
                warn!("No chain from {} within timeout", peer);
                self.inner.chain_requests.lock().await.remove(&peer);
                None
            }
        }
    }

    /// Admit a local transaction and relay it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<String, NetworkError> {
        let id = self
            .inner
            .blockchain
            .write()
            .await
            .add_transaction(tx.clone())?;
        self.broadcast(Message::tx(tx), None).await;
        Ok(id)
    }

    /// Mine pending transactions on a blocking worker and relay the block.
    /// The chain stays write-locked for the whole search.
    pub async fn mine_block(&self, miner_address: &str) -> Result<Block, NetworkError> {
        let chain = self.inner.blockchain.clone();
        let address = miner_address.to_string();
        let block = tokio::task::spawn_blocking(move || chain.blocking_write().mine_block(&address))
            .await??;

        self.broadcast(Message::block(block.clone()), None).await;
        Ok(block)
    }

    /// Stop every task and drop every peer
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.peers.clear().await;
        self.inner.chain_requests.lock().await.clear();
        info!("Node {} shut down", self.inner.advertised);
    }

    pub async fn status(&self) -> NodeStatus {
        let chain = self.inner.blockchain.read().await;
        NodeStatus {
            listen_addr: self.inner.advertised.clone(),
            height: chain.height(),
            tip_hash: chain.latest_block().hash.clone(),
            difficulty: chain.difficulty(),
            peers: self.inner.peers.peer_count().await,
            known_peers: self.inner.peers.known_addresses().await.len(),
            mempool_size: chain.mempool().len(),
            syncing: self.inner.syncing.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }
}
