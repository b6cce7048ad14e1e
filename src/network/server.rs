//! Connection handling
//!
//! A connection is established by a version exchange: the dialer speaks
//! first, the acceptor answers with its own version followed by the
//! addresses it knows. After that every frame is forwarded to the node's
//! inbox until the socket closes, a frame fails to decode, or the node
//! shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::sink::SinkExt;
use futures::stream::StreamExt;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use super::codec::MessageCodec;
use super::message::{AddrPayload, Message, VersionPayload};
use super::peer::{NetworkError, PeerManager, PeerState, PEER_CHANNEL_CAPACITY};

/// Inbound message queue item: sender and message
pub type Inbound = (SocketAddr, Message);

pub type PeerFramed = Framed<TcpStream, MessageCodec>;

/// A connection that finished its handshake and is registered as active
pub struct Established {
    pub addr: SocketAddr,
    pub conn_id: u64,
    pub remote: VersionPayload,
    framed: PeerFramed,
    outbound_rx: mpsc::Receiver<Message>,
}

async fn expect_version(
    framed: &mut PeerFramed,
    timeout: Duration,
) -> Result<VersionPayload, NetworkError> {
    let frame = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| NetworkError::Timeout)?;
    match frame {
        Some(Ok(Message::Version(version))) => Ok(version),
        Some(Ok(other)) => Err(NetworkError::Handshake(format!(
            "expected version, got {}",
            other.kind()
        ))),
        Some(Err(e)) => Err(e),
        None => Err(NetworkError::Disconnected),
    }
}

/// Run the version exchange on `stream` and register the peer
pub async fn establish(
    stream: TcpStream,
    outbound: bool,
    local: VersionPayload,
    peers: &PeerManager,
    timeout: Duration,
) -> Result<Established, NetworkError> {
    let addr = stream.peer_addr()?;
    peers.begin(addr, outbound).await?;

    match handshake(stream, addr, outbound, local, peers, timeout).await {
        Ok(established) => Ok(established),
        Err(e) => {
            peers.remove(&addr, None).await;
            Err(e)
        }
    }
}

async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    local: VersionPayload,
    peers: &PeerManager,
    timeout: Duration,
) -> Result<Established, NetworkError> {
    let mut framed = Framed::new(stream, MessageCodec::default());
    peers.set_state(&addr, PeerState::Handshaking).await;

    let remote = if outbound {
        framed.send(Message::Version(local.clone())).await?;
        expect_version(&mut framed, timeout).await?
    } else {
        let remote = expect_version(&mut framed, timeout).await?;
        framed.send(Message::Version(local.clone())).await?;
        let known = peers
            .known_addresses()
            .await
            .into_iter()
            .filter(|a| *a != remote.address)
            .collect();
        framed.send(Message::Addr(AddrPayload { peers: known })).await?;
        remote
    };

    if remote.version != local.version {
        return Err(NetworkError::Handshake(format!(
            "protocol version {} (ours {})",
            remote.version, local.version
        )));
    }
    if remote.address == local.address {
        return Err(NetworkError::Handshake("connected to self".to_string()));
    }

    let (tx, outbound_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
    let handle = peers.activate(addr, &remote, tx).await?;
    debug!("Handshake with {} complete (outbound: {})", addr, outbound);

    Ok(Established {
        addr,
        conn_id: handle.conn_id,
        remote,
        framed,
        outbound_rx,
    })
}

/// Drive an established connection until it closes. The remote version is
/// delivered to the inbox first so the node can act on it.
pub async fn run_peer(
    connection: Established,
    peers: Arc<PeerManager>,
    inbox: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Established {
        addr,
        conn_id,
        remote,
        framed,
        mut outbound_rx,
    } = connection;
    let (mut writer, mut reader) = framed.split();

    // Writer task: a failed write ends it, which closes the peer's channel
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                warn!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    if inbox.send((addr, Message::Version(remote))).await.is_ok() {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(msg)) => {
                        debug!("Received {} from {}", msg.kind(), addr);
                        if inbox.send((addr, msg)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Dropping peer {}: {}", addr, e);
                        break;
                    }
                    None => {
                        info!("Peer {} disconnected", addr);
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    write_handle.abort();
    peers.remove(&addr, Some(conn_id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::PROTOCOL_VERSION;
    use tokio::net::TcpListener;

    fn version(address: &str) -> VersionPayload {
        VersionPayload {
            version: PROTOCOL_VERSION,
            address: address.to_string(),
            height: 0,
        }
    }

    #[tokio::test]
    async fn test_handshake_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let acceptor_peers = Arc::new(PeerManager::new());
        acceptor_peers.add_known("10.0.0.1:8333").await;
        let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let peers = acceptor_peers.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let est = establish(stream, false, version("acceptor:1"), &peers, Duration::from_secs(5))
                .await
                .unwrap();
            run_peer(est, peers, inbox_tx, shutdown_rx).await;
        });

        let dialer_peers = PeerManager::new();
        let stream = TcpStream::connect(listen_addr).await.unwrap();
        let mut est = establish(
            stream,
            true,
            version("dialer:1"),
            &dialer_peers,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(est.remote.address, "acceptor:1");
        assert_eq!(dialer_peers.peer_count().await, 1);

        // The acceptor follows its version with the addresses it knows
        match est.framed.next().await {
            Some(Ok(Message::Addr(addr))) => {
                assert!(addr.peers.contains(&"10.0.0.1:8333".to_string()));
                assert!(!addr.peers.contains(&"dialer:1".to_string()));
            }
            other => panic!("expected addr, got {:?}", other.map(|r| r.map(|m| m.kind()))),
        }

        // Acceptor's inbox sees the dialer's version, then relayed frames
        let (_, first) = inbox_rx.recv().await.unwrap();
        assert_eq!(first, Message::Version(version("dialer:1")));
        est.framed.send(Message::GetChain).await.unwrap();
        let (_, second) = inbox_rx.recv().await.unwrap();
        assert_eq!(second, Message::GetChain);
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let peers = PeerManager::new();
            let _ = establish(stream, false, version("same:1"), &peers, Duration::from_secs(5)).await;
        });

        let peers = PeerManager::new();
        let stream = TcpStream::connect(listen_addr).await.unwrap();
        let result = establish(stream, true, version("same:1"), &peers, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(NetworkError::Handshake(_))));
        assert_eq!(peers.peer_count().await, 0);
        assert!(peers.get_all_peer_info().await.is_empty());
    }
}
