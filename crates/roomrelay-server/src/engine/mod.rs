//! Media engine boundary
//!
//! The relay never touches media itself. Everything that negotiates codecs,
//! transports or RTP goes through [`MediaEngine`], and everything the engine
//! wants to tell the relay on its own arrives as an [`EngineEvent`] on the
//! channel handed to [`crate::relay::Relay::spawn_event_router`].

mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use roomrelay_protocol::{MediaKind, TransportDirection};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Opaque failure reported by the engine. The message is surfaced to the
/// client as-is.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Entity an engine event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineScope {
    Room(Uuid),
    Peer(Uuid),
    Transport(Uuid),
    Producer(Uuid),
    Consumer(Uuid),
}

/// Asynchronous event emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub scope: EngineScope,
    pub kind: String,
    pub payload: Value,
}

impl EngineEvent {
    /// Event kind that makes the relay close the scoped entity
    pub const CLOSE: &'static str = "close";

    pub fn new(scope: EngineScope, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            scope,
            kind: kind.into(),
            payload,
        }
    }

    pub fn close(scope: EngineScope) -> Self {
        Self::new(scope, Self::CLOSE, Value::Null)
    }

    pub fn is_close(&self) -> bool {
        self.kind == Self::CLOSE
    }
}

/// Requests the relay issues to the media engine.
///
/// Create/connect calls may suspend for a long time and may fail; close calls
/// are notifications and never fail from the relay's point of view.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capability set a fresh room would negotiate, without creating one
    async fn room_capabilities(&self) -> EngineResult<Value>;

    /// Create the engine side of a room and return its capability set
    async fn create_room(&self, room: Uuid) -> EngineResult<Value>;

    async fn close_room(&self, room: Uuid);

    async fn create_transport(
        &self,
        room: Uuid,
        peer: Uuid,
        transport: Uuid,
        direction: TransportDirection,
        app_data: &Value,
    ) -> EngineResult<Value>;

    async fn connect_transport(&self, transport: Uuid, dtls_parameters: &Value)
    -> EngineResult<Value>;

    async fn close_transport(&self, transport: Uuid);

    async fn create_producer(
        &self,
        transport: Uuid,
        producer: Uuid,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Value>;

    async fn close_producer(&self, producer: Uuid);

    /// Create a consumer of `producer` for the receiving `peer`
    async fn create_consumer(
        &self,
        room: Uuid,
        consumer: Uuid,
        producer: Uuid,
        peer: Uuid,
    ) -> EngineResult<Value>;

    /// Bind a consumer to a receive transport and start the flow
    async fn enable_consumer(&self, consumer: Uuid, transport: Uuid) -> EngineResult<Value>;

    async fn close_consumer(&self, consumer: Uuid);
}
