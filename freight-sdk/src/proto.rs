//! Wire protocol for the freight fabric.
//!
//! Two planes share this module:
//!
//! - **Signaling plane**: JSON messages exchanged with the relay over
//!   WebSocket frames. A tagged enum, one frame per message.
//! - **Data plane**: binary frames exchanged directly between peers on
//!   an established channel. Little-endian, length-prefixed:
//!   `[u32 LE body length][u8 tag][body]`.
//!
//! Undecodable frames are recoverable on both planes: the receiver logs
//! and waits for the next frame. The length prefix keeps the stream
//! framed even when a body fails to decode.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::FabricError;

/// Upper bound on a single data-plane frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// ── Signaling plane ────────────────────────────────────────────────────

/// A peer-connection message relayed between two endpoints.
///
/// The relay forwards these verbatim by `peer_uuid` and never inspects
/// `description`. When the target is not registered, the relay bounces
/// the message back to the sender with `error` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConnectionMsg {
    pub source_uuid: Uuid,
    pub source_name: String,
    pub peer_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messages carried on the signaling transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Registration request. Must be the first frame of a session.
    /// A missing `uuid` asks the relay to mint one.
    #[serde(rename = "register")]
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uuid: Option<Uuid>,
        name: String,
    },

    /// Registration response carrying the accepted identity.
    #[serde(rename = "register_ack")]
    RegisterAck {
        uuid: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Connection-establishment message between two peers.
    #[serde(rename = "peer_connection")]
    PeerConnection(PeerConnectionMsg),

    /// Protocol error reported by the relay.
    #[serde(rename = "server_error")]
    ServerError { message: String },
}

/// Decode a signaling frame (text or binary payload).
pub fn decode_signal(bytes: &[u8]) -> Result<SignalMessage, FabricError> {
    serde_json::from_slice(bytes).map_err(|e| FabricError::Serialization(e.to_string()))
}

/// Encode a signaling message as a JSON text frame.
pub fn encode_signal(msg: &SignalMessage) -> Result<String, FabricError> {
    serde_json::to_string(msg).map_err(|e| FabricError::Serialization(e.to_string()))
}

/// Channel-establishment descriptor carried opaquely in the
/// `description` field of a [`PeerConnectionMsg`].
///
/// The offer names the offerer's peer listener; the answer names the
/// answerer's. On receipt of an answer, the offerer dials the address
/// inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelDescriptor {
    Offer { addr: String },
    Answer { addr: String },
}

impl ChannelDescriptor {
    pub fn encode(&self) -> Result<String, FabricError> {
        serde_json::to_string(self).map_err(|e| FabricError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, FabricError> {
        serde_json::from_str(text).map_err(|e| FabricError::Serialization(e.to_string()))
    }
}

// ── Data plane ─────────────────────────────────────────────────────────

/// Object-store operation carried in a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    Put,
    Exists,
    Evict,
}

impl RequestKind {
    fn as_u8(self) -> u8 {
        match self {
            RequestKind::Get => 0,
            RequestKind::Put => 1,
            RequestKind::Exists => 2,
            RequestKind::Evict => 3,
        }
    }

    fn from_u8(tag: u8) -> Result<Self, FabricError> {
        match tag {
            0 => Ok(RequestKind::Get),
            1 => Ok(RequestKind::Put),
            2 => Ok(RequestKind::Exists),
            3 => Ok(RequestKind::Evict),
            other => Err(FabricError::Serialization(format!(
                "unknown request kind {other}"
            ))),
        }
    }
}

/// Outcome of a peer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    NotFound,
    Error,
}

impl ReplyStatus {
    fn as_u8(self) -> u8 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::NotFound => 1,
            ReplyStatus::Error => 2,
        }
    }

    fn from_u8(tag: u8) -> Result<Self, FabricError> {
        match tag {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::NotFound),
            2 => Ok(ReplyStatus::Error),
            other => Err(FabricError::Serialization(format!(
                "unknown reply status {other}"
            ))),
        }
    }
}

const TAG_HELLO: u8 = 0;
const TAG_REQUEST: u8 = 1;
const TAG_REPLY: u8 = 2;

/// A single data-plane frame.
///
/// `Hello` is sent once by the dialing side to bind the TCP stream to a
/// peer identity. `Request`/`Reply` pair up by correlation id, which is
/// monotonic within one peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello {
        uuid: Uuid,
    },
    Request {
        correlation_id: u64,
        kind: RequestKind,
        object_id: String,
        payload: Vec<u8>,
    },
    Reply {
        correlation_id: u64,
        status: ReplyStatus,
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Encode the frame body (everything after the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Hello { uuid } => {
                let mut body = Vec::with_capacity(17);
                body.push(TAG_HELLO);
                body.extend_from_slice(uuid.as_bytes());
                body
            }
            Frame::Request {
                correlation_id,
                kind,
                object_id,
                payload,
            } => {
                let id = object_id.as_bytes();
                let mut body = Vec::with_capacity(12 + id.len() + payload.len());
                body.push(TAG_REQUEST);
                body.extend_from_slice(&correlation_id.to_le_bytes());
                body.push(kind.as_u8());
                body.extend_from_slice(&(id.len() as u16).to_le_bytes());
                body.extend_from_slice(id);
                body.extend_from_slice(payload);
                body
            }
            Frame::Reply {
                correlation_id,
                status,
                payload,
            } => {
                let mut body = Vec::with_capacity(10 + payload.len());
                body.push(TAG_REPLY);
                body.extend_from_slice(&correlation_id.to_le_bytes());
                body.push(status.as_u8());
                body.extend_from_slice(payload);
                body
            }
        }
    }

    /// Decode a frame body.
    pub fn decode(body: &[u8]) -> Result<Frame, FabricError> {
        let (&tag, rest) = body
            .split_first()
            .ok_or_else(|| FabricError::Serialization("empty frame".to_string()))?;
        match tag {
            TAG_HELLO => {
                let uuid = Uuid::from_slice(rest)
                    .map_err(|e| FabricError::Serialization(format!("bad hello frame: {e}")))?;
                Ok(Frame::Hello { uuid })
            }
            TAG_REQUEST => {
                let correlation_id = read_u64_le(rest, 0).ok_or_else(truncated)?;
                let kind = RequestKind::from_u8(*rest.get(8).ok_or_else(truncated)?)?;
                let id_len = read_u16_le(rest, 9).ok_or_else(truncated)? as usize;
                let id_bytes = rest.get(11..11 + id_len).ok_or_else(truncated)?;
                let object_id = String::from_utf8(id_bytes.to_vec())
                    .map_err(|e| FabricError::Serialization(format!("bad object id: {e}")))?;
                Ok(Frame::Request {
                    correlation_id,
                    kind,
                    object_id,
                    payload: rest[11 + id_len..].to_vec(),
                })
            }
            TAG_REPLY => {
                let correlation_id = read_u64_le(rest, 0).ok_or_else(truncated)?;
                let status = ReplyStatus::from_u8(*rest.get(8).ok_or_else(truncated)?)?;
                Ok(Frame::Reply {
                    correlation_id,
                    status,
                    payload: rest[9..].to_vec(),
                })
            }
            other => Err(FabricError::Serialization(format!(
                "unknown frame tag {other}"
            ))),
        }
    }
}

fn truncated() -> FabricError {
    FabricError::Serialization("truncated frame".to_string())
}

fn read_u64_le(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(slice))
}

fn read_u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_le_bytes(slice))
}

/// Read one length-prefixed frame from the stream.
///
/// A decode failure consumes the frame and returns `Serialization`; the
/// stream stays framed and the caller may keep reading. Transport
/// failures (including an over-limit length prefix, after which the
/// stream cannot be resynchronised) return `Channel`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FabricError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| FabricError::Channel(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FabricError::Channel(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte bound"
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| FabricError::Channel(e.to_string()))?;
    Frame::decode(&body)
}

/// Write one length-prefixed frame to the stream and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FabricError>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode();
    writer
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .map_err(|e| FabricError::Channel(e.to_string()))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| FabricError::Channel(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| FabricError::Channel(e.to_string()))
}

/// Parse and validate a descriptor address. The fabric dials whatever
/// the descriptor names, so reject anything that is not `host:port`.
pub fn descriptor_addr(addr: &str) -> Result<String, FabricError> {
    if addr.parse::<SocketAddr>().is_ok() {
        return Ok(addr.to_string());
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(FabricError::Serialization(format!(
            "bad channel address {addr:?}"
        ))),
    }
}
