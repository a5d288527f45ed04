//! Local mirror of the relay-side state this peer can see

use std::collections::{BTreeMap, HashMap};

use roomrelay_protocol::{ConsumerSnapshot, MediaKind, PeerSnapshot};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RemoteConsumer {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: MediaKind,
    /// Set once the receive request succeeded
    pub rtp_parameters: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub name: String,
    pub app_data: Value,
    pub consumers: HashMap<Uuid, RemoteConsumer>,
}

#[derive(Debug, Default)]
pub struct RoomMirror {
    // Remote peers by name
    pub peers: BTreeMap<String, RemotePeer>,

    // Local producers (producer_id -> kind)
    pub producers: HashMap<Uuid, MediaKind>,

    // Transports
    pub send_transport: Option<Uuid>,
    pub recv_transport: Option<Uuid>,

    pub joined: bool,
}

impl RoomMirror {
    pub fn add_peer(&mut self, snapshot: &PeerSnapshot) {
        let peer = self
            .peers
            .entry(snapshot.name.clone())
            .or_insert_with(|| RemotePeer {
                name: snapshot.name.clone(),
                app_data: Value::Null,
                consumers: HashMap::new(),
            });
        peer.app_data = snapshot.app_data.clone();
    }

    /// Drop a peer with all of its consumers, which are handed back
    pub fn remove_peer(&mut self, name: &str) -> Vec<RemoteConsumer> {
        self.peers
            .remove(name)
            .map(|peer| peer.consumers.into_values().collect())
            .unwrap_or_default()
    }

    /// Track a consumer. Returns false if it is already known.
    pub fn add_consumer(&mut self, snapshot: &ConsumerSnapshot) -> bool {
        let peer = self
            .peers
            .entry(snapshot.peer_name.clone())
            .or_insert_with(|| RemotePeer {
                name: snapshot.peer_name.clone(),
                app_data: Value::Null,
                consumers: HashMap::new(),
            });
        if peer.consumers.contains_key(&snapshot.id) {
            return false;
        }
        peer.consumers.insert(
            snapshot.id,
            RemoteConsumer {
                id: snapshot.id,
                producer_id: snapshot.producer_id,
                kind: snapshot.kind,
                rtp_parameters: None,
            },
        );
        true
    }

    pub fn consumer_mut(&mut self, consumer_id: Uuid) -> Option<&mut RemoteConsumer> {
        self.peers
            .values_mut()
            .find_map(|peer| peer.consumers.get_mut(&consumer_id))
    }

    pub fn remove_consumer(&mut self, consumer_id: Uuid) -> Option<RemoteConsumer> {
        self.peers
            .values_mut()
            .find_map(|peer| peer.consumers.remove(&consumer_id))
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.peers.values().map(|peer| peer.consumers.len()).sum()
    }

    /// Forget everything, e.g. after the connection closed
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
