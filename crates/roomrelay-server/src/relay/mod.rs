//! Session relay
//!
//! Owns the room registry and performs every operation that changes the
//! room/peer/transport/producer/consumer tree. Each connection talks to it
//! through a [`PeerSession`].

mod peer;
mod room;
mod session;

#[cfg(test)]
mod tests;

pub use peer::{Consumer, Detached, Peer, Producer, Transport, TransportState};
pub use room::Room;
pub use session::PeerSession;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use roomrelay_protocol::{
    ConsumerSnapshot, EnableConsumerResult, JoinResult, MediaKind, NotificationFrame,
    PeerSnapshot, ProduceResult, RelayNotification, RoomInfo, TransportDirection, TransportInfo,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{EngineEvent, EngineScope, MediaEngine};
use crate::error::{RelayError, Result};
use room::{AddPeer, Released, RemovedPeer};

pub struct Relay {
    engine: Arc<dyn MediaEngine>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl Relay {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Route engine events to the entities they concern until the engine
    /// drops its sender.
    pub fn spawn_event_router(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                relay.handle_engine_event(event).await;
            }
            tracing::debug!("Engine event channel closed");
        })
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .lock()
            .get(room_id)
            .filter(|room| !room.is_closed())
            .cloned()
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.lock().values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Capability query. An unknown room answers like a fresh one would,
    /// without being created.
    pub async fn query_room(&self, room_id: &str) -> Result<RoomInfo> {
        if let Some(room) = self.room(room_id) {
            return Ok(RoomInfo {
                rtp_capabilities: room.rtp_capabilities().clone(),
                peers: room.peer_names(),
            });
        }

        let rtp_capabilities = self.engine.room_capabilities().await?;
        Ok(RoomInfo {
            rtp_capabilities,
            peers: vec![],
        })
    }

    /// Find the live room for `room_id`, creating it in the engine if absent.
    pub(crate) async fn resolve_room(&self, room_id: &str) -> Result<Arc<Room>> {
        if let Some(room) = self.room(room_id) {
            return Ok(room);
        }

        let engine_id = Uuid::new_v4();
        let rtp_capabilities = self.engine.create_room(engine_id).await?;
        let candidate = Arc::new(Room::new(room_id, engine_id, rtp_capabilities));

        let (room, created) = self.insert_room(candidate);
        if created {
            tracing::info!("Created room {} (engine {})", room_id, engine_id);
        } else {
            // Lost the race against another join for the same room
            self.engine.close_room(engine_id).await;
        }
        Ok(room)
    }

    fn insert_room(&self, candidate: Arc<Room>) -> (Arc<Room>, bool) {
        let mut rooms = self.rooms.lock();
        if let Some(existing) = rooms.get(candidate.id()) {
            if !existing.is_closed() {
                return (existing.clone(), false);
            }
        }
        rooms.insert(candidate.id().to_string(), candidate.clone());
        (candidate, true)
    }

    fn forget_room(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.lock();
        if rooms.get(room.id()).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(room.id());
        }
    }

    async fn retire_room(&self, room: &Arc<Room>) {
        self.forget_room(room);
        self.engine.close_room(room.engine_id()).await;
        tracing::info!("Room {} removed", room.id());
    }

    /// Called when a join gave up after resolving its room.
    pub(crate) async fn abandon_room(&self, room: &Arc<Room>) {
        if room.retire_if_empty() {
            self.retire_room(room).await;
        }
    }

    /// Try to register `peer` in `room`. `Ok(None)` means the room retired
    /// in the meantime and the caller should resolve it again.
    pub(crate) fn try_register(
        &self,
        room: &Arc<Room>,
        peer: &Arc<Peer>,
    ) -> Result<Option<Vec<Arc<Peer>>>> {
        match room.add_peer(peer) {
            AddPeer::Added(existing) => {
                tracing::info!(
                    "Peer {} joined room {} ({} already present)",
                    peer.name(),
                    room.id(),
                    existing.len()
                );
                Ok(Some(existing))
            }
            AddPeer::Duplicate => Err(RelayError::DuplicatePeer {
                room_id: room.id().to_string(),
                peer_name: peer.name().to_string(),
            }),
            AddPeer::Retired => Ok(None),
        }
    }

    /// Build the join reply: every peer already present, with the consumers
    /// created for the newcomer from their producers.
    pub(crate) async fn complete_join(
        &self,
        room: &Arc<Room>,
        peer: &Arc<Peer>,
        existing: Vec<Arc<Peer>>,
    ) -> JoinResult {
        let mut peers = Vec::with_capacity(existing.len());
        for other in existing {
            let mut snapshot = other.snapshot();
            for producer in other.producers() {
                if let Some(consumer) =
                    consume(&self.engine, room, &other, &producer, peer, false).await
                {
                    snapshot.consumers.push(consumer);
                }
            }
            peers.push(snapshot);
        }
        JoinResult { peers }
    }

    pub(crate) async fn create_transport(
        &self,
        room: &Room,
        peer: &Peer,
        direction: TransportDirection,
        app_data: &Value,
    ) -> Result<TransportInfo> {
        let transport_id = Uuid::new_v4();
        let parameters = self
            .engine
            .create_transport(room.engine_id(), peer.id(), transport_id, direction, app_data)
            .await?;

        let transport = Transport {
            id: transport_id,
            direction,
            state: TransportState::New,
        };
        if let Err(e) = peer.insert_transport(transport) {
            self.engine.close_transport(transport_id).await;
            return Err(e);
        }

        tracing::debug!(
            "Peer {} created {} transport {}",
            peer.name(),
            direction,
            transport_id
        );
        Ok(TransportInfo {
            transport_id,
            direction,
            parameters,
        })
    }

    pub(crate) async fn connect_transport(
        &self,
        peer: &Peer,
        transport_id: Uuid,
        dtls_parameters: &Value,
    ) -> Result<Value> {
        if peer.transport_state(transport_id) != Some(TransportState::New) {
            return Err(RelayError::not_found("Transport", transport_id));
        }

        let result = self
            .engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        peer.mark_connected(transport_id)?;
        Ok(result)
    }

    pub(crate) async fn close_transport(
        &self,
        room: &Room,
        peer: &Peer,
        transport_id: Uuid,
        notify_owner: bool,
    ) {
        if let Some(released) = room.close_transport(peer, transport_id, notify_owner) {
            tracing::debug!("Peer {} closed transport {}", peer.name(), transport_id);
            self.release(released).await;
        }
    }

    pub(crate) async fn produce(
        &self,
        room: &Arc<Room>,
        peer: &Arc<Peer>,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: &Value,
        app_data: Value,
    ) -> Result<ProduceResult> {
        peer.ready_transport(transport_id, TransportDirection::Send)?;

        let producer_id = Uuid::new_v4();
        self.engine
            .create_producer(transport_id, producer_id, kind, rtp_parameters)
            .await?;

        let producer = Producer {
            id: producer_id,
            kind,
            transport_id,
            app_data,
        };
        if let Err(e) = peer.insert_producer(producer.clone()) {
            // The peer or its transport went away while the engine worked
            self.engine.close_producer(producer_id).await;
            return Err(e);
        }

        tracing::info!(
            "Peer {} produces {} ({})",
            peer.name(),
            kind,
            producer_id
        );

        let engine = Arc::clone(&self.engine);
        let room = Arc::clone(room);
        let source = Arc::clone(peer);
        tokio::spawn(async move {
            for target in room.peers() {
                if Arc::ptr_eq(&target, &source) {
                    continue;
                }
                consume(&engine, &room, &source, &producer, &target, true).await;
            }
        });

        Ok(ProduceResult { producer_id })
    }

    pub(crate) async fn close_producer(
        &self,
        room: &Room,
        peer: &Peer,
        producer_id: Uuid,
        notify_owner: bool,
    ) {
        if let Some(released) = room.close_producer(peer, producer_id, notify_owner) {
            tracing::debug!("Peer {} closed producer {}", peer.name(), producer_id);
            self.release(released).await;
        }
    }

    pub(crate) async fn enable_consumer(
        &self,
        peer: &Peer,
        consumer_id: Uuid,
        transport_id: Uuid,
    ) -> Result<EnableConsumerResult> {
        peer.ready_transport(transport_id, TransportDirection::Recv)?;
        if !peer.has_consumer(consumer_id) {
            return Err(RelayError::not_found("Consumer", consumer_id));
        }

        let result = self.engine.enable_consumer(consumer_id, transport_id).await?;
        peer.bind_consumer(consumer_id, transport_id)?;

        let rtp_parameters = result
            .get("rtpParameters")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(EnableConsumerResult { rtp_parameters })
    }

    pub(crate) async fn close_consumer(&self, peer: &Peer, consumer_id: Uuid, notify_owner: bool) {
        if let Some(consumer) = peer.take_consumer(consumer_id, notify_owner) {
            tracing::debug!("Peer {} closed consumer {}", peer.name(), consumer_id);
            self.engine.close_consumer(consumer.id).await;
        }
    }

    /// Close a peer with full cascade. Closing an already closed peer does
    /// nothing.
    pub async fn close_peer(&self, room: &Arc<Room>, peer: &Arc<Peer>) {
        let Some(RemovedPeer {
            detached,
            cascaded,
            emptied,
        }) = room.remove_peer(peer)
        else {
            return;
        };

        tracing::info!("Peer {} left room {}", peer.name(), room.id());
        self.release(Released { detached, cascaded }).await;

        if emptied {
            self.retire_room(room).await;
        }
    }

    /// Close every room, e.g. on shutdown
    pub async fn close_all(&self) {
        for room in self.rooms() {
            for peer in room.peers() {
                peer.notify(RelayNotification::PeerClosed {
                    peer_name: peer.name().to_string(),
                });
                self.close_peer(&room, &peer).await;
            }
            self.abandon_room(&room).await;
        }
    }

    /// Tell the engine about everything a close released
    async fn release(&self, released: Released) {
        let Released { detached, cascaded } = released;
        for consumer in cascaded.iter().chain(&detached.consumers) {
            self.engine.close_consumer(consumer.id).await;
        }
        for producer in &detached.producers {
            self.engine.close_producer(producer.id).await;
        }
        for transport in &detached.transports {
            self.engine.close_transport(transport.id).await;
        }
    }

    fn locate(&self, scope: EngineScope) -> Option<(Arc<Room>, Option<Arc<Peer>>)> {
        for room in self.rooms() {
            if scope == EngineScope::Room(room.engine_id()) {
                return Some((room, None));
            }

            let owner = room.peers().into_iter().find(|peer| match scope {
                EngineScope::Peer(id) => peer.id() == id,
                EngineScope::Transport(id) => peer.has_transport(id),
                EngineScope::Producer(id) => peer.has_producer(id),
                EngineScope::Consumer(id) => peer.has_consumer(id),
                EngineScope::Room(_) => false,
            });
            if owner.is_some() {
                return Some((room, owner));
            }
        }
        None
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        let Some((room, owner)) = self.locate(event.scope) else {
            tracing::debug!("Dropping engine event {} for unknown {:?}", event.kind, event.scope);
            return;
        };

        if !event.is_close() {
            let frame = NotificationFrame {
                kind: event.kind,
                payload: event.payload,
            };
            match owner {
                Some(peer) => peer.forward(frame),
                None => {
                    for peer in room.peers() {
                        peer.forward(frame.clone());
                    }
                }
            }
            return;
        }

        tracing::warn!("Engine closed {:?}", event.scope);
        match (event.scope, owner) {
            (EngineScope::Room(_), _) => {
                for peer in room.peers() {
                    peer.notify(RelayNotification::PeerClosed {
                        peer_name: peer.name().to_string(),
                    });
                    self.close_peer(&room, &peer).await;
                }
                self.abandon_room(&room).await;
            }
            (EngineScope::Peer(_), Some(peer)) => {
                peer.notify(RelayNotification::PeerClosed {
                    peer_name: peer.name().to_string(),
                });
                self.close_peer(&room, &peer).await;
            }
            (EngineScope::Transport(id), Some(peer)) => {
                self.close_transport(&room, &peer, id, true).await;
            }
            (EngineScope::Producer(id), Some(peer)) => {
                self.close_producer(&room, &peer, id, true).await;
            }
            (EngineScope::Consumer(id), Some(peer)) => {
                self.close_consumer(&peer, id, true).await;
            }
            _ => {}
        }
    }
}

/// Create a consumer of `producer` for `target` and hand it over. Failures
/// are logged and leave no consumer behind.
async fn consume(
    engine: &Arc<dyn MediaEngine>,
    room: &Room,
    source: &Peer,
    producer: &Producer,
    target: &Peer,
    announce: bool,
) -> Option<ConsumerSnapshot> {
    let consumer_id = Uuid::new_v4();
    let parameters = match engine
        .create_consumer(room.engine_id(), consumer_id, producer.id, target.id())
        .await
    {
        Ok(parameters) => parameters,
        Err(e) => {
            tracing::warn!(
                "Could not create consumer of {} for peer {}: {}",
                producer.id,
                target.name(),
                e
            );
            return None;
        }
    };

    let consumer = Consumer {
        id: consumer_id,
        kind: producer.kind,
        producer_id: producer.id,
        producer_peer: source.name().to_string(),
        transport_id: None,
        parameters,
    };
    let snapshot = consumer.snapshot();

    if !room.commit_consumer(source, target, consumer, announce) {
        // Producer, target or room closed meanwhile, or a duplicate
        engine.close_consumer(consumer_id).await;
        return None;
    }

    tracing::debug!(
        "Peer {} consumes {} of peer {}",
        target.name(),
        producer.id,
        source.name()
    );
    Some(snapshot)
}

/// Peer snapshots of a room, as listed by the HTTP API
pub fn room_snapshot(room: &Room) -> Vec<PeerSnapshot> {
    room.peers().iter().map(|p| p.snapshot()).collect()
}
