//! One participant of a room and the media entities it owns.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use roomrelay_protocol::{
    ConsumerSnapshot, MediaKind, PeerSnapshot, ProducerSnapshot, RelayNotification,
    TransportDirection,
};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::ws::connections::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created in the engine, DTLS not negotiated yet
    New,
    Connected,
}

#[derive(Debug, Clone)]
pub struct Transport {
    pub id: Uuid,
    pub direction: TransportDirection,
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: Uuid,
    pub kind: MediaKind,
    pub transport_id: Uuid,
    pub app_data: Value,
}

impl Producer {
    pub fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            id: self.id,
            kind: self.kind,
            app_data: self.app_data.clone(),
        }
    }
}

/// Consumer held by a receiving peer.
///
/// The source producer is referenced by id only; it may already be gone when
/// the consumer is looked at.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: Uuid,
    pub kind: MediaKind,
    pub producer_id: Uuid,
    /// Name of the peer owning the source producer
    pub producer_peer: String,
    pub transport_id: Option<Uuid>,
    pub parameters: Value,
}

impl Consumer {
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            id: self.id,
            producer_id: self.producer_id,
            peer_name: self.producer_peer.clone(),
            kind: self.kind,
            parameters: self.parameters.clone(),
        }
    }
}

/// Everything a peer owned at the moment it was closed
#[derive(Debug, Default)]
pub struct Detached {
    pub transports: Vec<Transport>,
    pub producers: Vec<Producer>,
    pub consumers: Vec<Consumer>,
}

#[derive(Default)]
struct PeerState {
    closed: bool,
    transports: Vec<Transport>,
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
}

pub struct Peer {
    id: Uuid,
    name: String,
    room_id: String,
    joined_at: DateTime<Utc>,
    app_data: Value,
    connection: ConnectionHandle,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(room_id: &str, name: &str, app_data: Value, connection: ConnectionHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            room_id: room_id.to_string(),
            joined_at: Utc::now(),
            app_data,
            connection,
            state: Mutex::new(PeerState::default()),
        }
    }

    /// Engine-facing identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn notify(&self, notification: RelayNotification) {
        self.connection.notify(notification);
    }

    pub fn forward(&self, frame: roomrelay_protocol::NotificationFrame) {
        self.connection.forward(frame);
    }

    /// Snapshot as seen by other peers. `consumers` is left for the caller to
    /// fill with whatever the recipient consumes of this peer.
    pub fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.lock();
        PeerSnapshot {
            name: self.name.clone(),
            joined_at: self.joined_at,
            app_data: self.app_data.clone(),
            producers: state.producers.iter().map(Producer::snapshot).collect(),
            consumers: vec![],
        }
    }

    pub fn producers(&self) -> Vec<Producer> {
        self.state.lock().producers.clone()
    }

    pub fn has_producer(&self, producer_id: Uuid) -> bool {
        self.state.lock().producers.iter().any(|p| p.id == producer_id)
    }

    pub fn has_transport(&self, transport_id: Uuid) -> bool {
        self.state.lock().transports.iter().any(|t| t.id == transport_id)
    }

    pub fn has_consumer(&self, consumer_id: Uuid) -> bool {
        self.state.lock().consumers.iter().any(|c| c.id == consumer_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Check that a connected transport of the given direction exists.
    ///
    /// Transports still negotiating are treated like absent ones.
    pub fn ready_transport(&self, transport_id: Uuid, direction: TransportDirection) -> Result<()> {
        let state = self.state.lock();
        match state.transports.iter().find(|t| t.id == transport_id) {
            Some(t) if t.direction == direction && t.state == TransportState::Connected => Ok(()),
            _ => Err(RelayError::not_found("Transport", transport_id)),
        }
    }

    pub fn insert_transport(&self, transport: Transport) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RelayError::NotJoined);
        }
        state.transports.push(transport);
        Ok(())
    }

    /// Move a transport from `New` to `Connected`. Fails if it is gone or
    /// already connected.
    pub fn mark_connected(&self, transport_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        match state.transports.iter_mut().find(|t| t.id == transport_id) {
            Some(t) if t.state == TransportState::New => {
                t.state = TransportState::Connected;
                Ok(())
            }
            _ => Err(RelayError::not_found("Transport", transport_id)),
        }
    }

    pub fn transport_state(&self, transport_id: Uuid) -> Option<TransportState> {
        self.state
            .lock()
            .transports
            .iter()
            .find(|t| t.id == transport_id)
            .map(|t| t.state)
    }

    /// Register a producer created by the engine. Fails when the peer or the
    /// send transport went away while the engine was working.
    pub fn insert_producer(&self, producer: Producer) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RelayError::NotJoined);
        }
        let transport_ok = state.transports.iter().any(|t| {
            t.id == producer.transport_id && t.direction == TransportDirection::Send
        });
        if !transport_ok {
            return Err(RelayError::not_found("Transport", producer.transport_id));
        }
        state.producers.push(producer);
        Ok(())
    }

    pub(super) fn take_producer(&self, producer_id: Uuid) -> Option<Producer> {
        let mut state = self.state.lock();
        let index = state.producers.iter().position(|p| p.id == producer_id)?;
        Some(state.producers.remove(index))
    }

    /// Register a consumer. Refused when the peer is closed or already holds a
    /// consumer of the same producer. With `announce`, the `newConsumer`
    /// notification is queued before the lock is released so a later close
    /// notification can never overtake it.
    pub(super) fn insert_consumer(&self, consumer: Consumer, announce: bool) -> bool {
        let mut state = self.state.lock();
        if state.closed
            || state
                .consumers
                .iter()
                .any(|c| c.producer_id == consumer.producer_id)
        {
            return false;
        }

        if announce {
            self.connection.notify(RelayNotification::NewConsumer {
                consumer: consumer.snapshot(),
            });
        }
        state.consumers.push(consumer);
        true
    }

    /// Bind a consumer to a receive transport once the engine enabled it
    pub fn bind_consumer(&self, consumer_id: Uuid, transport_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        if !state.transports.iter().any(|t| t.id == transport_id) {
            return Err(RelayError::not_found("Transport", transport_id));
        }
        let consumer = state
            .consumers
            .iter_mut()
            .find(|c| c.id == consumer_id)
            .ok_or_else(|| RelayError::not_found("Consumer", consumer_id))?;
        consumer.transport_id = Some(transport_id);
        Ok(())
    }

    /// Remove a consumer. With `notify`, the owner is told about it.
    pub(super) fn take_consumer(&self, consumer_id: Uuid, notify: bool) -> Option<Consumer> {
        let mut state = self.state.lock();
        let index = state.consumers.iter().position(|c| c.id == consumer_id)?;
        let consumer = state.consumers.remove(index);
        if notify {
            self.notify_consumer_closed(&consumer);
        }
        Some(consumer)
    }

    /// Remove every consumer sourced from `producer_id`, telling the owner
    /// about each one.
    pub(super) fn take_consumers_of(&self, producer_id: Uuid) -> Vec<Consumer> {
        let mut state = self.state.lock();
        let (gone, kept): (Vec<Consumer>, Vec<Consumer>) = std::mem::take(&mut state.consumers)
            .into_iter()
            .partition(|c| c.producer_id == producer_id);
        state.consumers = kept;

        for consumer in &gone {
            self.notify_consumer_closed(consumer);
        }
        gone
    }

    /// Remove a transport with the producers and consumers bound to it
    pub(super) fn take_transport(&self, transport_id: Uuid, notify: bool) -> Option<Detached> {
        let mut state = self.state.lock();
        let index = state.transports.iter().position(|t| t.id == transport_id)?;
        let transport = state.transports.remove(index);

        let (producers, kept): (Vec<Producer>, Vec<Producer>) =
            std::mem::take(&mut state.producers)
                .into_iter()
                .partition(|p| p.transport_id == transport_id);
        state.producers = kept;

        let (consumers, kept): (Vec<Consumer>, Vec<Consumer>) =
            std::mem::take(&mut state.consumers)
                .into_iter()
                .partition(|c| c.transport_id == Some(transport_id));
        state.consumers = kept;

        if notify {
            for consumer in &consumers {
                self.notify_consumer_closed(consumer);
            }
            for producer in &producers {
                self.connection.notify(RelayNotification::ProducerClosed {
                    producer_id: producer.id,
                });
            }
            self.connection.notify(RelayNotification::TransportClosed { transport_id });
        }

        Some(Detached {
            transports: vec![transport],
            producers,
            consumers,
        })
    }

    /// Mark the peer closed and hand back everything it owned. Returns `None`
    /// if it was already closed.
    pub(super) fn close(&self) -> Option<Detached> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;

        Some(Detached {
            transports: std::mem::take(&mut state.transports),
            producers: std::mem::take(&mut state.producers),
            consumers: std::mem::take(&mut state.consumers),
        })
    }

    fn notify_consumer_closed(&self, consumer: &Consumer) {
        self.connection.notify(RelayNotification::ConsumerClosed {
            consumer_id: consumer.id,
            producer_id: consumer.producer_id,
            peer_name: consumer.producer_peer.clone(),
        });
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("room_id", &self.room_id)
            .field("connection", &self.connection.id())
            .finish()
    }
}
