//! A named set of peers sharing one capability context.
//!
//! Operations that cross peer boundaries (joining, leaving, closing a
//! producer together with every consumer of it) run under the room lock, and
//! the room lock is always taken before any peer lock.

use std::sync::Arc;

use parking_lot::Mutex;
use roomrelay_protocol::RelayNotification;
use serde_json::Value;
use uuid::Uuid;

use super::peer::{Consumer, Detached, Peer, Producer};

/// Outcome of trying to add a peer
pub enum AddPeer {
    /// Added; carries the peers that were already in the room, in join order
    Added(Vec<Arc<Peer>>),
    Duplicate,
    /// The room emptied and was retired before the peer could be added
    Retired,
}

/// What closing a peer released
pub struct RemovedPeer {
    pub detached: Detached,
    /// Consumers other peers held on the closed peer's producers
    pub cascaded: Vec<Consumer>,
    /// The room has no peers left and is retired
    pub emptied: bool,
}

/// What closing a producer or transport released
pub struct Released {
    pub detached: Detached,
    pub cascaded: Vec<Consumer>,
}

#[derive(Default)]
struct RoomState {
    peers: Vec<Arc<Peer>>,
    closed: bool,
}

pub struct Room {
    id: String,
    engine_id: Uuid,
    rtp_capabilities: Value,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(id: &str, engine_id: Uuid, rtp_capabilities: Value) -> Self {
        Self {
            id: id.to_string(),
            engine_id,
            rtp_capabilities,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    pub fn rtp_capabilities(&self) -> &Value {
        &self.rtp_capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Peers in join order
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.lock().peers.clone()
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.state
            .lock()
            .peers
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.state
            .lock()
            .peers
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Register a peer and announce it to everyone already present.
    pub fn add_peer(&self, peer: &Arc<Peer>) -> AddPeer {
        let mut state = self.state.lock();
        if state.closed {
            return AddPeer::Retired;
        }
        if state.peers.iter().any(|p| p.name() == peer.name()) {
            return AddPeer::Duplicate;
        }

        let existing = state.peers.clone();
        let snapshot = peer.snapshot();
        for other in &existing {
            other.notify(RelayNotification::NewPeer {
                peer: snapshot.clone(),
            });
        }

        state.peers.push(peer.clone());
        AddPeer::Added(existing)
    }

    /// Retire the room if nobody is in it. Used when a join gave up after
    /// the room was created for it.
    pub fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || !state.peers.is_empty() {
            return false;
        }
        state.closed = true;
        true
    }

    /// Close a peer, cascade to the consumers others held on its producers and
    /// tell the remaining peers it left. `None` if it was already closed.
    pub fn remove_peer(&self, peer: &Arc<Peer>) -> Option<RemovedPeer> {
        let mut state = self.state.lock();
        let detached = peer.close()?;
        state.peers.retain(|p| !Arc::ptr_eq(p, peer));

        let cascaded = cascade(&state.peers, &detached.producers);
        for other in &state.peers {
            other.notify(RelayNotification::PeerClosed {
                peer_name: peer.name().to_string(),
            });
        }

        let emptied = state.peers.is_empty() && !state.closed;
        if emptied {
            state.closed = true;
        }

        Some(RemovedPeer {
            detached,
            cascaded,
            emptied,
        })
    }

    /// Close one producer of `owner` and every consumer of it in the room.
    pub fn close_producer(
        &self,
        owner: &Peer,
        producer_id: Uuid,
        notify_owner: bool,
    ) -> Option<Released> {
        let state = self.state.lock();
        let producer = owner.take_producer(producer_id)?;
        if notify_owner {
            owner.notify(RelayNotification::ProducerClosed { producer_id });
        }

        let cascaded = cascade(&state.peers, std::slice::from_ref(&producer));
        Some(Released {
            detached: Detached {
                producers: vec![producer],
                ..Default::default()
            },
            cascaded,
        })
    }

    /// Close a transport of `owner` with everything bound to it.
    pub fn close_transport(
        &self,
        owner: &Peer,
        transport_id: Uuid,
        notify_owner: bool,
    ) -> Option<Released> {
        let state = self.state.lock();
        let detached = owner.take_transport(transport_id, notify_owner)?;
        let cascaded = cascade(&state.peers, &detached.producers);
        Some(Released { detached, cascaded })
    }

    /// Hand a consumer to `target` if `source` still owns the producer.
    ///
    /// Checked under the room lock, so a producer closing concurrently either
    /// sees this consumer and closes it, or this call sees the producer gone.
    pub fn commit_consumer(
        &self,
        source: &Peer,
        target: &Peer,
        consumer: Consumer,
        announce: bool,
    ) -> bool {
        let state = self.state.lock();
        if state.closed || !source.has_producer(consumer.producer_id) {
            return false;
        }
        target.insert_consumer(consumer, announce)
    }
}

fn cascade(peers: &[Arc<Peer>], producers: &[Producer]) -> Vec<Consumer> {
    let mut cascaded = vec![];
    for peer in peers {
        for producer in producers {
            cascaded.extend(peer.take_consumers_of(producer.id));
        }
    }
    if !cascaded.is_empty() {
        tracing::debug!("Closed {} consumers by cascade", cascaded.len());
    }
    cascaded
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("engine_id", &self.engine_id)
            .finish()
    }
}
