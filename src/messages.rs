//! # Wire Protocol Messages
//!
//! This module defines every message that crosses the datagram wire, plus
//! the JSON codec. A datagram carries exactly one [`Message`] envelope:
//!
//! ```text
//! { "type": <integer>, "sender_id": [32 bytes], "rpc_id": "...", "payload": {...} }
//! ```
//!
//! ## Message Groups
//!
//! | Group | Request | Response |
//! |-------|---------|----------|
//! | Liveness | `Ping` | `PingRes` |
//! | Routing | `FindNode` | `FindNodeRes` |
//! | Storage | `Store`, `FindValue` | `StoreRes`, `FindValueRes` |
//! | Admission | `JoinReq`, `JoinRes`, `PosProof` | `JoinChallenge`, `JoinAck`, `PosChallenge` |
//!
//! The admission "responses" are the server's replies inside the handshake;
//! the transport routes them through the same rpc-id mailboxes as the plain
//! `*Res` types.
//!
//! ## Bounds
//!
//! Encoding refuses to produce a datagram larger than
//! [`MAX_DATAGRAM_BYTES`](crate::config::MAX_DATAGRAM_BYTES); decoding reads
//! from a receive buffer of that size, so oversized input never reaches the
//! parser. Ids and hashes are fixed-size 32-byte arrays on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::MAX_DATAGRAM_BYTES;
use crate::identity::{Contact, PeerId};

/// Wire message tags. The numeric values are the protocol; reordering the
/// variants breaks compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    Store = 1,
    FindNode = 2,
    FindValue = 3,
    PingRes = 4,
    StoreRes = 5,
    FindNodeRes = 6,
    FindValueRes = 7,
    JoinReq = 8,
    JoinChallenge = 9,
    JoinRes = 10,
    JoinAck = 11,
    PosChallenge = 12,
    PosProof = 13,
}

impl MessageType {
    /// Whether this type is routed to a pending rpc mailbox (client side)
    /// rather than dispatched to a request handler.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::PingRes
                | MessageType::StoreRes
                | MessageType::FindNodeRes
                | MessageType::FindValueRes
                | MessageType::JoinChallenge
                | MessageType::JoinAck
                | MessageType::PosChallenge
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => MessageType::Ping,
            1 => MessageType::Store,
            2 => MessageType::FindNode,
            3 => MessageType::FindValue,
            4 => MessageType::PingRes,
            5 => MessageType::StoreRes,
            6 => MessageType::FindNodeRes,
            7 => MessageType::FindValueRes,
            8 => MessageType::JoinReq,
            9 => MessageType::JoinChallenge,
            10 => MessageType::JoinRes,
            11 => MessageType::JoinAck,
            12 => MessageType::PosChallenge,
            13 => MessageType::PosProof,
            other => return Err(other),
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        MessageType::try_from(raw)
            .map_err(|v| serde::de::Error::custom(format!("unknown message type {v}")))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sender_id: PeerId,
    pub rpc_id: String,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new<P: Serialize>(
        msg_type: MessageType,
        sender_id: PeerId,
        rpc_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, WireError> {
        Ok(Self {
            msg_type,
            sender_id,
            rpc_id: rpc_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into its type-specific struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Encode a message to datagram bytes, refusing oversized output.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_DATAGRAM_BYTES {
        return Err(WireError::Oversize(bytes.len()));
    }
    Ok(bytes)
}

/// Decode a single datagram into a message envelope.
pub fn decode(data: &[u8]) -> Result<Message, WireError> {
    Ok(serde_json::from_slice(data)?)
}

#[derive(Debug)]
pub enum WireError {
    /// Encoded datagram exceeds the single-packet bound.
    Oversize(usize),
    /// Malformed JSON, unknown message type, or payload shape mismatch.
    Json(serde_json::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Oversize(len) => {
                write!(f, "datagram of {len} bytes exceeds {MAX_DATAGRAM_BYTES}")
            }
            WireError::Json(e) => write!(f, "wire decode: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Json(e)
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    pub key: PeerId,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub target_id: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub nodes: Vec<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub key: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueResponse {
    pub found: bool,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
    #[serde(default)]
    pub nodes: Vec<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequestPayload {
    pub peer_id: PeerId,
    /// SEC1-encoded P-256 public key of the joiner.
    pub public_key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinChallengePayload {
    pub nonce: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinResponsePayload {
    /// ASN.1 DER ECDSA signature over the challenge nonce bytes.
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinAckPayload {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosChallengePayload {
    /// Number of significant prefix bits (T).
    pub prefix_bits: u32,
    /// MSB-aligned prefix, `ceil(T/8)` bytes, unused low bits cleared.
    pub prefix: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosProofPayload {
    /// `"<hex64(peer_id)>_<decimal(index)>"` — the preimage of `hash`.
    pub raw_value: String,
    pub index: u64,
    pub hash: [u8; 32],
}
