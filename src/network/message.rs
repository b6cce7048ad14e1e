//! Network message types for P2P communication
//!
//! On the wire every message is an envelope `{type, payload, timestamp}`.
//! The `type` tag selects exactly one [`Message`] variant and its payload
//! is decoded into that variant's typed struct; an unknown tag is a
//! malformed message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Block, Transaction};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Most block hashes announced in reply to `getblocks`
pub const MAX_GETBLOCKS_HASHES: usize = 10;

/// Message decoding errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

/// What an `inv` or `getdata` refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    /// Address the sender accepts connections on
    pub address: String,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub kind: InvKind,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub kind: InvKind,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub start_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPayload {
    pub blocks: Vec<Block>,
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake: protocol version, listening address, chain height
    Version(VersionPayload),
    /// Known peer listening addresses
    Addr(AddrPayload),
    /// Announce blocks or transactions by hash
    Inv(InvPayload),
    /// Request one block or transaction by hash
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
    /// Ask for recent block hashes from a height
    GetBlocks(GetBlocksPayload),
    /// Ask for the full chain
    GetChain,
    /// Full chain, genesis first
    Chain(ChainPayload),
}

/// Wire form of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    value: serde_json::Value,
) -> Result<T, MessageError> {
    serde_json::from_value(value).map_err(|source| MessageError::MalformedPayload {
        kind: kind.to_string(),
        source,
    })
}

impl Message {
    pub fn block(block: Block) -> Self {
        Message::Block(BlockPayload { block })
    }

    pub fn tx(transaction: Transaction) -> Self {
        Message::Tx(TxPayload { transaction })
    }

    pub fn inv(kind: InvKind, items: Vec<String>) -> Self {
        Message::Inv(InvPayload { kind, items })
    }

    /// Wire tag, also used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::GetBlocks(_) => "getblocks",
            Message::GetChain => "getchain",
            Message::Chain(_) => "chain",
        }
    }

    /// Wrap in an envelope stamped with the current time
    pub fn to_envelope(&self) -> Result<Envelope, MessageError> {
        let payload = match self {
            Message::Version(p) => serde_json::to_value(p)?,
            Message::Addr(p) => serde_json::to_value(p)?,
            Message::Inv(p) => serde_json::to_value(p)?,
            Message::GetData(p) => serde_json::to_value(p)?,
            Message::Block(p) => serde_json::to_value(p)?,
            Message::Tx(p) => serde_json::to_value(p)?,
            Message::GetBlocks(p) => serde_json::to_value(p)?,
            Message::GetChain => serde_json::Value::Object(serde_json::Map::new()),
            Message::Chain(p) => serde_json::to_value(p)?,
        };
        Ok(Envelope {
            kind: self.kind().to_string(),
            payload,
            timestamp: Utc::now(),
        })
    }

    /// Map an envelope's tag to its variant and decode the payload
    pub fn from_envelope(envelope: Envelope) -> Result<Self, MessageError> {
        let Envelope { kind, payload: value, .. } = envelope;
        let message = match kind.as_str() {
            "version" => Message::Version(payload(&kind, value)?),
            "addr" => Message::Addr(payload(&kind, value)?),
            "inv" => Message::Inv(payload(&kind, value)?),
            "getdata" => Message::GetData(payload(&kind, value)?),
            "block" => Message::Block(payload(&kind, value)?),
            "tx" => Message::Tx(payload(&kind, value)?),
            "getblocks" => Message::GetBlocks(payload(&kind, value)?),
            "getchain" => Message::GetChain,
            "chain" => Message::Chain(payload(&kind, value)?),
            _ => return Err(MessageError::UnknownType(kind)),
        };
        Ok(message)
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(&self.to_envelope()?)?)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        Self::from_envelope(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let msg = Message::GetBlocks(GetBlocksPayload { start_height: 7 });
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "getblocks");
        assert_eq!(value["payload"]["start_height"], 7);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_version_roundtrip() {
        let msg = Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            address: "127.0.0.1:8333".to_string(),
            height: 12,
        });
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_inv_kind_is_lowercase() {
        let msg = Message::inv(InvKind::Tx, vec!["ab".to_string()]);
        let envelope = msg.to_envelope().unwrap();
        assert_eq!(envelope.payload["kind"], "tx");
    }

    #[test]
    fn test_block_message_keeps_hash() {
        let block = Block::new(1, "00".repeat(32), vec![Transaction::coinbase("m", 1)]);
        let decoded = Message::from_bytes(&Message::block(block.clone()).to_bytes().unwrap());
        match decoded.unwrap() {
            Message::Block(p) => {
                assert_eq!(p.block.hash, block.hash);
                assert!(p.block.verify_hash());
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = br#"{"type":"ping","payload":{},"timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(
            Message::from_bytes(raw),
            Err(MessageError::UnknownType(t)) if t == "ping"
        ));
    }

    #[test]
    fn test_bad_payload_rejected() {
        let raw = br#"{"type":"getblocks","payload":{"start":1},"timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(
            Message::from_bytes(raw),
            Err(MessageError::MalformedPayload { .. })
        ));
        assert!(matches!(
            Message::from_bytes(b"not json"),
            Err(MessageError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_getchain_has_empty_payload() {
        let decoded = Message::from_bytes(&Message::GetChain.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, Message::GetChain);
    }
}
