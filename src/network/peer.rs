//! Peer management for P2P networking
//!
//! Tracks each connection through connecting, handshaking, active and
//! closed, and routes outbound messages to per-peer writer channels.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use super::message::{Message, MessageError, VersionPayload};
use crate::core::{BlockchainError, TransactionError};

/// Maximum number of tracked connections
pub const MAX_PEERS: usize = 32;

/// Outbound queue depth per peer
pub const PEER_CHANNEL_CAPACITY: usize = 100;

/// Networking errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Malformed message: {0}")]
    Message(#[from] MessageError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Operation timed out")]
    Timeout,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Node is not running")]
    NotRunning,
    #[error("Transaction rejected: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

impl PeerState {
    /// States only move forward; any state may close
    pub fn can_transition_to(self, next: PeerState) -> bool {
        matches!(
            (self, next),
            (PeerState::Connecting, PeerState::Handshaking)
                | (PeerState::Handshaking, PeerState::Active)
                | (_, PeerState::Closed)
        ) && self != PeerState::Closed
    }
}

/// Information about a connected peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// Listening address announced in the version message
    pub listen_addr: Option<String>,
    pub version: u32,
    pub height: u64,
    pub outbound: bool,
    pub connected_at: DateTime<Utc>,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            state: PeerState::Connecting,
            listen_addr: None,
            version: 0,
            height: 0,
            outbound,
            connected_at: Utc::now(),
        }
    }

    pub fn update_from_version(&mut self, version: &VersionPayload) {
        self.listen_addr = Some(version.address.clone());
        self.version = version.version;
        self.height = version.height;
    }
}

/// Handle for sending messages to a peer
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    /// Distinguishes a reconnect from the same socket address
    pub conn_id: u64,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub async fn send(&self, msg: Message) -> Result<(), NetworkError> {
        self.tx.send(msg).await.map_err(|_| NetworkError::Disconnected)
    }
}

/// Manages all peer connections
#[derive(Debug, Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
    /// Writer channels of active peers
    handles: RwLock<HashMap<SocketAddr, PeerHandle>>,
    /// Listening addresses learned from seeds, versions and addr messages
    known: RwLock<BTreeSet<String>>,
    next_conn_id: AtomicU64,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly opened connection
    pub async fn begin(&self, addr: SocketAddr, outbound: bool) -> Result<(), NetworkError> {
        let mut peers = self.peers.write().await;
        if peers.len() >= MAX_PEERS {
            return Err(NetworkError::MaxPeersReached);
        }
        peers.insert(addr, PeerInfo::new(addr, outbound));
        Ok(())
    }

    /// Move a tracked connection to `state`. Invalid transitions are ignored.
    pub async fn set_state(&self, addr: &SocketAddr, state: PeerState) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(addr) {
            Some(peer) if peer.state.can_transition_to(state) => {
                peer.state = state;
                true
            }
            Some(peer) => {
                warn!("Peer {}: ignoring transition {:?} -> {:?}", addr, peer.state, state);
                false
            }
            None => false,
        }
    }

    /// Mark a handshaken peer active and attach its writer channel
    pub async fn activate(
        &self,
        addr: SocketAddr,
        version: &VersionPayload,
        tx: mpsc::Sender<Message>,
    ) -> Result<PeerHandle, NetworkError> {
        {
            let mut peers = self.peers.write().await;
            let peer = peers.get_mut(&addr).ok_or(NetworkError::Disconnected)?;
            if !peer.state.can_transition_to(PeerState::Active) {
                return Err(NetworkError::Handshake(format!(
                    "peer {} is {:?}",
                    addr, peer.state
                )));
            }
            peer.update_from_version(version);
            peer.state = PeerState::Active;
        }

        self.add_known(&version.address).await;

        let handle = PeerHandle {
            addr,
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        self.handles.write().await.insert(addr, handle.clone());

        info!(
            "Peer {} active: listening on {}, height {}",
            addr, version.address, version.height
        );
        Ok(handle)
    }

    /// Close a connection. A handle from an older connection on the same
    /// socket address does not remove the newer one.
    pub async fn remove(&self, addr: &SocketAddr, conn_id: Option<u64>) -> Option<PeerInfo> {
        let mut handles = self.handles.write().await;
        if let (Some(id), Some(current)) = (conn_id, handles.get(addr)) {
            if current.conn_id != id {
                return None;
            }
        }
        handles.remove(addr);
        drop(handles);

        let mut peer = self.peers.write().await.remove(addr)?;
        peer.state = PeerState::Closed;
        info!("Removed peer: {}", addr);
        Some(peer)
    }

    /// Drop every connection
    pub async fn clear(&self) {
        self.handles.write().await.clear();
        self.peers.write().await.clear();
    }

    /// Remember a listening address; true if it was new
    pub async fn add_known(&self, addr: &str) -> bool {
        self.known.write().await.insert(addr.to_string())
    }

    pub async fn is_known(&self, addr: &str) -> bool {
        self.known.read().await.contains(addr)
    }

    pub async fn known_addresses(&self) -> Vec<String> {
        self.known.read().await.iter().cloned().collect()
    }

    pub async fn get_peer_info(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn get_all_peer_info(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Addresses of peers that finished the handshake
    pub async fn active_peers(&self) -> Vec<SocketAddr> {
        self.handles.read().await.keys().copied().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Record a height learned from a peer
    pub async fn update_height(&self, addr: &SocketAddr, height: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.height = peer.height.max(height);
        }
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, addr: &SocketAddr, msg: Message) -> Result<(), NetworkError> {
        let handle = self
            .handles
            .read()
            .await
            .get(addr)
            .cloned()
            .ok_or(NetworkError::Disconnected)?;
        handle.send(msg).await
    }

    /// Queue `msg` for every active peer except `except`. Peers whose
    /// writer has gone away are removed; peers with a full queue miss
    /// this message.
    pub async fn broadcast(&self, msg: &Message, except: Option<SocketAddr>) -> usize {
        let mut dead = Vec::new();
        let mut sent = 0;
        {
            let handles = self.handles.read().await;
            for (addr, handle) in handles.iter() {
                if Some(*addr) == except {
                    continue;
                }
                match handle.tx.try_send(msg.clone()) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue full for {}, dropping {}", addr, msg.kind());
                    }
                    Err(TrySendError::Closed(_)) => dead.push((*addr, handle.conn_id)),
                }
            }
        }

        for (addr, conn_id) in dead {
            debug!("Peer {} gone during broadcast", addr);
            self.remove(&addr, Some(conn_id)).await;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::PROTOCOL_VERSION;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn version(port: u16) -> VersionPayload {
        VersionPayload {
            version: PROTOCOL_VERSION,
            address: addr(port).to_string(),
            height: 3,
        }
    }

    #[test]
    fn test_state_transitions() {
        use PeerState::*;
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));
        assert!(Connecting.can_transition_to(Closed));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Handshaking));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let manager = PeerManager::new();
        let (tx, _rx) = mpsc::channel(4);

        manager.begin(addr(9000), true).await.unwrap();
        assert!(manager.activate(addr(9000), &version(9100), tx.clone()).await.is_err());

        assert!(manager.set_state(&addr(9000), PeerState::Handshaking).await);
        let handle = manager
            .activate(addr(9000), &version(9100), tx)
            .await
            .unwrap();

        let info = manager.get_peer_info(&addr(9000)).await.unwrap();
        assert_eq!(info.state, PeerState::Active);
        assert_eq!(info.height, 3);
        assert_eq!(manager.peer_count().await, 1);
        assert!(manager.is_known(&addr(9100).to_string()).await);

        let closed = manager.remove(&addr(9000), Some(handle.conn_id)).await.unwrap();
        assert_eq!(closed.state, PeerState::Closed);
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_remove_keeps_new_connection() {
        let manager = PeerManager::new();
        let (tx, _rx) = mpsc::channel(4);

        manager.begin(addr(9001), false).await.unwrap();
        manager.set_state(&addr(9001), PeerState::Handshaking).await;
        let handle = manager.activate(addr(9001), &version(9101), tx).await.unwrap();

        assert!(manager.remove(&addr(9001), Some(handle.conn_id + 1)).await.is_none());
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_peers() {
        let manager = PeerManager::new();
        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (dead_tx, dead_rx) = mpsc::channel(4);
        drop(dead_rx);

        for (port, tx) in [(9002, live_tx), (9003, dead_tx)] {
            manager.begin(addr(port), true).await.unwrap();
            manager.set_state(&addr(port), PeerState::Handshaking).await;
            manager.activate(addr(port), &version(port + 100), tx).await.unwrap();
        }

        let sent = manager.broadcast(&Message::GetChain, None).await;
        assert_eq!(sent, 1);
        assert_eq!(live_rx.recv().await, Some(Message::GetChain));
        assert_eq!(manager.active_peers().await, vec![addr(9002)]);

        assert_eq!(manager.broadcast(&Message::GetChain, Some(addr(9002))).await, 0);
    }
}
