use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Media kind carried by a producer or consumer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Direction of a transport, seen from the client
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// Producer as seen by other peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSnapshot {
    pub id: Uuid,
    pub kind: MediaKind,
    #[serde(default)]
    pub app_data: Value,
}

/// Consumer created for the receiving peer from another peer's producer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSnapshot {
    pub id: Uuid,
    pub producer_id: Uuid,
    /// Name of the peer owning the source producer
    pub peer_name: String,
    pub kind: MediaKind,
    /// Opaque engine parameters for the consumer
    #[serde(default)]
    pub parameters: Value,
}

/// Peer as enumerated in join replies and `newPeer` notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub name: String,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub producers: Vec<ProducerSnapshot>,
    /// Consumers the recipient of this snapshot holds on this peer's producers
    #[serde(default)]
    pub consumers: Vec<ConsumerSnapshot>,
}

/// Result of `queryRoom`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub rtp_capabilities: Value,
    pub peers: Vec<String>,
}

/// Result of `join`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinResult {
    pub peers: Vec<PeerSnapshot>,
}

/// Result of `createTransport`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub transport_id: Uuid,
    pub direction: TransportDirection,
    #[serde(default)]
    pub parameters: Value,
}

/// Result of `produce`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResult {
    pub producer_id: Uuid,
}

/// Result of `enableConsumer`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnableConsumerResult {
    #[serde(default)]
    pub rtp_parameters: Value,
}

/// Error codes carried in failed replies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    NotJoined,
    DuplicatePeer,
    UnknownMethod,
    EntityNotFound,
    EngineFailure,
    InvalidPayload,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::NotJoined => "NotJoined",
            ErrorCode::DuplicatePeer => "DuplicatePeer",
            ErrorCode::UnknownMethod => "UnknownMethod",
            ErrorCode::EntityNotFound => "EntityNotFound",
            ErrorCode::EngineFailure => "EngineFailure",
            ErrorCode::InvalidPayload => "InvalidPayload",
        };
        f.write_str(s)
    }
}

/// Error payload of a failed reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
