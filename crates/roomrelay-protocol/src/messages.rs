use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    ConsumerSnapshot, ErrorBody, ErrorCode, MediaKind, PeerSnapshot, TransportDirection,
};

/// Request frame sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub request_id: u64,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

/// Fire-and-forget notification sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientNotificationFrame {
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

/// Any frame a client may send, told apart by the presence of `requestId`
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Request(RequestFrame),
    Notification(ClientNotificationFrame),
}

/// Client frame before classification. `request_id` is `Some` whenever the
/// key is present, even when its value is `null`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClientFrame {
    #[serde(default, deserialize_with = "present")]
    request_id: Option<Value>,
    method: String,
    #[serde(default)]
    payload: Value,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for ClientFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let RawClientFrame {
            request_id,
            method,
            payload,
        } = RawClientFrame::deserialize(deserializer)?;

        match request_id {
            None => Ok(ClientFrame::Notification(ClientNotificationFrame {
                method,
                payload,
            })),
            Some(id) => {
                let request_id = id.as_u64().ok_or_else(|| {
                    de::Error::custom(format!("invalid requestId {} for {}", id, method))
                })?;
                Ok(ClientFrame::Request(RequestFrame {
                    request_id,
                    method,
                    payload,
                }))
            }
        }
    }
}

/// Reply to exactly one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    pub request_id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ReplyFrame {
    pub fn success(request_id: u64, result: Value) -> Self {
        Self {
            request_id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Unsolicited message pushed by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Any frame the relay may send. Replies are recognised by `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Reply(ReplyFrame),
    Notification(NotificationFrame),
}

/// Closed set of request kinds understood by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "method",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RelayRequest {
    /// Read-only capability query, allowed before join
    QueryRoom {},

    /// Register this connection's peer in its room
    Join {
        #[serde(default)]
        app_data: Value,
    },

    CreateTransport {
        direction: TransportDirection,
        #[serde(default)]
        app_data: Value,
    },

    ConnectTransport {
        transport_id: Uuid,
        #[serde(default)]
        dtls_parameters: Value,
    },

    CloseTransport { transport_id: Uuid },

    Produce {
        transport_id: Uuid,
        kind: MediaKind,
        #[serde(default)]
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },

    CloseProducer { producer_id: Uuid },

    /// Start receiving a consumer over a receive transport
    EnableConsumer {
        consumer_id: Uuid,
        transport_id: Uuid,
    },

    CloseConsumer { consumer_id: Uuid },

    /// Explicitly close this connection's peer
    Leave {},
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestParseError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid payload for {method}: {reason}")]
    InvalidPayload { method: String, reason: String },
}

impl RelayRequest {
    /// Wire names of every request kind
    pub const METHODS: &'static [&'static str] = &[
        "queryRoom",
        "join",
        "createTransport",
        "connectTransport",
        "closeTransport",
        "produce",
        "closeProducer",
        "enableConsumer",
        "closeConsumer",
        "leave",
    ];

    /// Resolve a method name and its payload into a request kind.
    pub fn parse(method: &str, payload: Value) -> Result<Self, RequestParseError> {
        if !Self::METHODS.contains(&method) {
            return Err(RequestParseError::UnknownMethod(method.to_string()));
        }

        let payload = if payload.is_null() { json!({}) } else { payload };

        serde_json::from_value(json!({ "method": method, "payload": payload })).map_err(|e| {
            RequestParseError::InvalidPayload {
                method: method.to_string(),
                reason: e.to_string(),
            }
        })
    }

    pub fn method(&self) -> &'static str {
        match self {
            RelayRequest::QueryRoom {} => "queryRoom",
            RelayRequest::Join { .. } => "join",
            RelayRequest::CreateTransport { .. } => "createTransport",
            RelayRequest::ConnectTransport { .. } => "connectTransport",
            RelayRequest::CloseTransport { .. } => "closeTransport",
            RelayRequest::Produce { .. } => "produce",
            RelayRequest::CloseProducer { .. } => "closeProducer",
            RelayRequest::EnableConsumer { .. } => "enableConsumer",
            RelayRequest::CloseConsumer { .. } => "closeConsumer",
            RelayRequest::Leave {} => "leave",
        }
    }

    /// Split into the `(method, payload)` pair sent on the wire.
    pub fn into_parts(self) -> (String, Value) {
        let method = self.method().to_string();
        let payload = serde_json::to_value(&self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(Value::take))
            .unwrap_or_else(|| json!({}));
        (method, payload)
    }
}

/// Notifications produced by the relay itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RelayNotification {
    /// Another peer joined the room
    NewPeer { peer: PeerSnapshot },

    /// Another peer left the room
    PeerClosed { peer_name: String },

    /// A consumer was created for the recipient
    NewConsumer { consumer: ConsumerSnapshot },

    /// One of the recipient's consumers was closed
    ConsumerClosed {
        consumer_id: Uuid,
        producer_id: Uuid,
        peer_name: String,
    },

    /// One of the recipient's producers was closed by the relay or engine
    ProducerClosed { producer_id: Uuid },

    /// One of the recipient's transports was closed by the engine
    TransportClosed { transport_id: Uuid },
}

impl RelayNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayNotification::NewPeer { .. } => "newPeer",
            RelayNotification::PeerClosed { .. } => "peerClosed",
            RelayNotification::NewConsumer { .. } => "newConsumer",
            RelayNotification::ConsumerClosed { .. } => "consumerClosed",
            RelayNotification::ProducerClosed { .. } => "producerClosed",
            RelayNotification::TransportClosed { .. } => "transportClosed",
        }
    }

    /// Interpret a generic notification frame. Returns `None` for kinds the
    /// relay does not define (engine pass-through notifications).
    pub fn from_frame(frame: &NotificationFrame) -> Option<Self> {
        serde_json::from_value(json!({ "type": frame.kind, "payload": frame.payload })).ok()
    }

    pub fn into_frame(self) -> NotificationFrame {
        let kind = self.kind().to_string();
        let payload = serde_json::to_value(&self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(Value::take))
            .unwrap_or(Value::Null);
        NotificationFrame { kind, payload }
    }
}
