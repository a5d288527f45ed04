//! Per-connection state machine: `Unjoined -> Joined -> Closed`.

use std::sync::Arc;

use parking_lot::Mutex;
use roomrelay_protocol::{
    ClientFrame, ClientNotificationFrame, RelayRequest, ReplyFrame, RequestFrame,
};
use serde::Serialize;
use serde_json::{Value, json};

use super::{Peer, Relay, Room};
use crate::error::{RelayError, Result};
use crate::ws::connections::ConnectionHandle;

enum SessionState {
    Unjoined,
    Joined { room: Arc<Room>, peer: Arc<Peer> },
    Closed,
}

/// The relay's view of one connection.
///
/// Holds at most one peer for the whole life of the connection and routes
/// every request from that connection to it.
pub struct PeerSession {
    relay: Arc<Relay>,
    room_id: String,
    peer_name: String,
    connection: ConnectionHandle,
    state: Mutex<SessionState>,
}

impl PeerSession {
    pub fn new(
        relay: Arc<Relay>,
        room_id: impl Into<String>,
        peer_name: impl Into<String>,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            relay,
            room_id: room_id.into(),
            peer_name: peer_name.into(),
            connection,
            state: Mutex::new(SessionState::Unjoined),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_joined(&self) -> bool {
        self.joined().is_ok()
    }

    /// Handle one inbound frame to completion. Replies go out through the
    /// connection handle.
    pub async fn handle_frame(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::Request(request) => {
                let reply = self.handle_request(request).await;
                self.connection.reply(reply);
            }
            ClientFrame::Notification(notification) => {
                self.handle_notification(notification).await;
            }
        }
    }

    pub async fn handle_request(&self, frame: RequestFrame) -> ReplyFrame {
        let RequestFrame {
            request_id,
            method,
            payload,
        } = frame;

        let outcome = match RelayRequest::parse(&method, payload) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(result) => ReplyFrame::success(request_id, result),
            Err(e) => {
                tracing::debug!(
                    "Request {} ({}) from {} failed: {}",
                    request_id,
                    method,
                    self.peer_name,
                    e
                );
                e.into_reply(request_id)
            }
        }
    }

    /// Client notifications mirror the close requests but get no reply.
    pub async fn handle_notification(&self, frame: ClientNotificationFrame) {
        let request = match RelayRequest::parse(&frame.method, frame.payload) {
            Ok(
                request @ (RelayRequest::Leave {}
                | RelayRequest::CloseTransport { .. }
                | RelayRequest::CloseProducer { .. }
                | RelayRequest::CloseConsumer { .. }),
            ) => request,
            Ok(other) => {
                tracing::warn!(
                    "Ignoring {} sent as notification by {}",
                    other.method(),
                    self.peer_name
                );
                return;
            }
            Err(e) => {
                tracing::warn!("Bad notification from {}: {}", self.peer_name, e);
                return;
            }
        };

        if let Err(e) = self.dispatch(request).await {
            tracing::warn!("Notification from {} failed: {}", self.peer_name, e);
        }
    }

    async fn dispatch(&self, request: RelayRequest) -> Result<Value> {
        match request {
            RelayRequest::QueryRoom {} => to_value(self.relay.query_room(&self.room_id).await?),
            RelayRequest::Join { app_data } => self.join(app_data).await,
            RelayRequest::Leave {} => {
                let (room, peer) = self.joined()?;
                self.close_with(room, peer).await;
                Ok(json!({}))
            }
            RelayRequest::CreateTransport {
                direction,
                app_data,
            } => {
                let (room, peer) = self.joined()?;
                to_value(
                    self.relay
                        .create_transport(&room, &peer, direction, &app_data)
                        .await?,
                )
            }
            RelayRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let (_, peer) = self.joined()?;
                self.relay
                    .connect_transport(&peer, transport_id, &dtls_parameters)
                    .await
            }
            RelayRequest::CloseTransport { transport_id } => {
                let (room, peer) = self.joined()?;
                self.relay
                    .close_transport(&room, &peer, transport_id, false)
                    .await;
                Ok(json!({}))
            }
            RelayRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                let (room, peer) = self.joined()?;
                to_value(
                    self.relay
                        .produce(&room, &peer, transport_id, kind, &rtp_parameters, app_data)
                        .await?,
                )
            }
            RelayRequest::CloseProducer { producer_id } => {
                let (room, peer) = self.joined()?;
                self.relay
                    .close_producer(&room, &peer, producer_id, false)
                    .await;
                Ok(json!({}))
            }
            RelayRequest::EnableConsumer {
                consumer_id,
                transport_id,
            } => {
                let (_, peer) = self.joined()?;
                to_value(
                    self.relay
                        .enable_consumer(&peer, consumer_id, transport_id)
                        .await?,
                )
            }
            RelayRequest::CloseConsumer { consumer_id } => {
                let (_, peer) = self.joined()?;
                self.relay.close_consumer(&peer, consumer_id, false).await;
                Ok(json!({}))
            }
        }
    }

    async fn join(&self, app_data: Value) -> Result<Value> {
        {
            let mut state = self.state.lock();
            match &*state {
                SessionState::Unjoined => {}
                // Closed by the engine or by shutdown, never by this connection
                SessionState::Joined { peer, .. } if peer.is_closed() => {
                    *state = SessionState::Closed;
                    return Err(RelayError::NotJoined);
                }
                SessionState::Joined { room, .. } => {
                    return Err(RelayError::DuplicatePeer {
                        room_id: room.id().to_string(),
                        peer_name: self.peer_name.clone(),
                    });
                }
                SessionState::Closed => return Err(RelayError::NotJoined),
            }
        }

        let peer = Arc::new(Peer::new(
            &self.room_id,
            &self.peer_name,
            app_data,
            self.connection.clone(),
        ));

        loop {
            let room = self.relay.resolve_room(&self.room_id).await?;
            match self.register(&room, &peer) {
                Ok(Some(existing)) => {
                    let result = self.relay.complete_join(&room, &peer, existing).await;
                    return to_value(result);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.relay.abandon_room(&room).await;
                    return Err(e);
                }
            }
        }
    }

    /// Register the peer and enter `Joined` in one step, so a disconnect
    /// can never observe a registered peer the session does not know about.
    fn register(&self, room: &Arc<Room>, peer: &Arc<Peer>) -> Result<Option<Vec<Arc<Peer>>>> {
        let mut state = self.state.lock();
        if !matches!(*state, SessionState::Unjoined) {
            // Closed while the room was being resolved
            return Err(RelayError::NotJoined);
        }

        let existing = self.relay.try_register(room, peer)?;
        if existing.is_some() {
            *state = SessionState::Joined {
                room: Arc::clone(room),
                peer: Arc::clone(peer),
            };
        }
        Ok(existing)
    }

    fn joined(&self) -> Result<(Arc<Room>, Arc<Peer>)> {
        match &*self.state.lock() {
            SessionState::Joined { room, peer } if !peer.is_closed() => {
                Ok((Arc::clone(room), Arc::clone(peer)))
            }
            _ => Err(RelayError::NotJoined),
        }
    }

    /// Tear the session down. Safe to call any number of times; the peer is
    /// closed at most once.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Closed);
        if let SessionState::Joined { room, peer } = previous {
            self.relay.close_peer(&room, &peer).await;
        }
    }

    async fn close_with(&self, room: Arc<Room>, peer: Arc<Peer>) {
        *self.state.lock() = SessionState::Closed;
        self.relay.close_peer(&room, &peer).await;
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| RelayError::InvalidPayload(e.to_string()))
}
