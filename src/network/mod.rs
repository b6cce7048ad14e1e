//! P2P Networking module
//!
//! Gossip of blocks and transactions between nodes over TCP.
//!
//! # Features
//! - Length-prefixed JSON envelopes with a closed set of message types
//! - Version handshake and address gossip
//! - Inventory announcements with on-demand `getdata`
//! - Longest-valid-chain fork resolution

pub mod codec;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;

pub use codec::{MessageCodec, MAX_FRAME_SIZE};
pub use message::{
    AddrPayload, BlockPayload, ChainPayload, Envelope, GetBlocksPayload, GetDataPayload, InvKind,
    InvPayload, Message, MessageError, TxPayload, VersionPayload, MAX_GETBLOCKS_HASHES,
    PROTOCOL_VERSION,
};
pub use node::{Node, NodeConfig, NodeStatus, SharedBlockchain};
pub use peer::{NetworkError, PeerHandle, PeerInfo, PeerManager, PeerState, MAX_PEERS};
pub use server::{establish, run_peer, Established, Inbound};
