use roomrelay_protocol::{NotificationFrame, RelayNotification, ReplyFrame, ServerFrame};
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Outbound half of one client connection.
///
/// Replies and notifications are queued as typed frames; the socket's send
/// task is the only place they are serialized onto the wire, so everything
/// queued for one connection goes out in queue order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn new(id: Uuid, tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn reply(&self, reply: ReplyFrame) -> bool {
        self.push(ServerFrame::Reply(reply))
    }

    pub fn notify(&self, notification: RelayNotification) -> bool {
        tracing::debug!("Notify {} on connection {}", notification.kind(), self.id);
        self.push(ServerFrame::Notification(notification.into_frame()))
    }

    /// Queue a notification whose type is not defined by the relay
    pub fn forward(&self, frame: NotificationFrame) -> bool {
        self.push(ServerFrame::Notification(frame))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, frame: ServerFrame) -> bool {
        if self.tx.send(frame).is_err() {
            tracing::debug!("Dropping frame for closed connection {}", self.id);
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub room_id: String,
    pub peer_name: String,
}

/// Live connections, for bookkeeping and stats
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, ConnectionInfo>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, connection_id: Uuid, info: ConnectionInfo) {
        tracing::debug!(
            "Peer {} of room {} connected with connection ID {}",
            info.peer_name,
            info.room_id,
            connection_id
        );
        self.connections.write().await.insert(connection_id, info);
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        if let Some(info) = self.connections.write().await.remove(&connection_id) {
            tracing::debug!(
                "Peer {} of room {} disconnected (connection ID {})",
                info.peer_name,
                info.room_id,
                connection_id
            );
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections_in_room(&self, room_id: &str) -> Vec<Uuid> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, info)| info.room_id == room_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
