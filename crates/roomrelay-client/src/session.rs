//! Client session controller
//!
//! Drives one peer through the relay: join, one send and one receive
//! transport, a producer per local track, and a receiving flow per consumer
//! the relay announces. Close notifications only ever clean up locally.

use roomrelay_protocol::{
    ConsumerSnapshot, EnableConsumerResult, JoinResult, NotificationFrame, ProduceResult,
    RelayNotification, RelayRequest, RoomInfo, TransportDirection, TransportInfo,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::media::{MediaSource, RenderSink};
use crate::network::Connection;
use crate::state::RoomMirror;

pub struct SessionController<S: MediaSource, R: RenderSink> {
    connection: Connection,
    notifications: mpsc::UnboundedReceiver<NotificationFrame>,
    peer_name: String,
    source: S,
    sink: R,
    mirror: RoomMirror,
}

impl<S: MediaSource, R: RenderSink> SessionController<S, R> {
    pub async fn connect(
        base: &str,
        room_id: &str,
        peer_name: &str,
        source: S,
        sink: R,
    ) -> Result<Self> {
        let (connection, notifications) = Connection::connect(base, room_id, peer_name).await?;
        Ok(Self::new(connection, notifications, peer_name, source, sink))
    }

    pub fn new(
        connection: Connection,
        notifications: mpsc::UnboundedReceiver<NotificationFrame>,
        peer_name: &str,
        source: S,
        sink: R,
    ) -> Self {
        Self {
            connection,
            notifications,
            peer_name: peer_name.to_string(),
            source,
            sink,
            mirror: RoomMirror::default(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn mirror(&self) -> &RoomMirror {
        &self.mirror
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &R {
        &self.sink
    }

    /// Join the room, open both transports, pick up the consumers created
    /// for us and start producing local tracks.
    pub async fn start(&mut self) -> Result<()> {
        let room: RoomInfo = self.connection.request_as(RelayRequest::QueryRoom {}).await?;
        tracing::debug!(
            "Room offers {} codecs, {} peers present",
            room.rtp_capabilities["codecs"]
                .as_array()
                .map_or(0, |codecs| codecs.len()),
            room.peers.len()
        );

        let joined: JoinResult = self
            .connection
            .request_as(RelayRequest::Join {
                app_data: Value::Null,
            })
            .await?;
        self.mirror.joined = true;
        tracing::info!("Joined as {} with {} peers", self.peer_name, joined.peers.len());

        self.mirror.send_transport = Some(self.open_transport(TransportDirection::Send).await?);
        self.mirror.recv_transport = Some(self.open_transport(TransportDirection::Recv).await?);

        for peer in &joined.peers {
            self.mirror.add_peer(peer);
            for consumer in &peer.consumers {
                self.consume(consumer).await;
            }
        }

        self.produce_all().await;
        Ok(())
    }

    async fn open_transport(&self, direction: TransportDirection) -> Result<Uuid> {
        let info: TransportInfo = self
            .connection
            .request_as(RelayRequest::CreateTransport {
                direction,
                app_data: Value::Null,
            })
            .await?;

        self.connection
            .request(RelayRequest::ConnectTransport {
                transport_id: info.transport_id,
                dtls_parameters: json!({ "role": "client" }),
            })
            .await?;

        tracing::debug!("{} transport {} connected", direction, info.transport_id);
        Ok(info.transport_id)
    }

    async fn produce_all(&mut self) {
        let Some(transport_id) = self.mirror.send_transport else {
            return;
        };

        for track in self.source.tracks() {
            let kind = track.kind;
            let produced = self
                .connection
                .request_as::<ProduceResult>(RelayRequest::Produce {
                    transport_id,
                    kind,
                    rtp_parameters: track.rtp_parameters,
                    app_data: Value::Null,
                })
                .await;

            match produced {
                Ok(result) => {
                    tracing::info!("Producing {} as {}", kind, result.producer_id);
                    self.mirror.producers.insert(result.producer_id, kind);
                }
                Err(e) => {
                    tracing::warn!("Failed to produce {}: {}", kind, e);
                    self.source.stop(kind);
                }
            }
        }
    }

    /// Receive a consumer over the receive transport and render it
    async fn consume(&mut self, consumer: &ConsumerSnapshot) {
        if !self.mirror.add_consumer(consumer) {
            return;
        }
        let Some(transport_id) = self.mirror.recv_transport else {
            return;
        };

        let enabled = self
            .connection
            .request_as::<EnableConsumerResult>(RelayRequest::EnableConsumer {
                consumer_id: consumer.id,
                transport_id,
            })
            .await;

        match enabled {
            Ok(result) => {
                if let Some(entry) = self.mirror.consumer_mut(consumer.id) {
                    entry.rtp_parameters = Some(result.rtp_parameters.clone());
                    self.sink.attach(
                        &consumer.peer_name,
                        consumer.id,
                        consumer.kind,
                        &result.rtp_parameters,
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Failed to receive consumer {}: {}", consumer.id, e);
                self.mirror.remove_consumer(consumer.id);
            }
        }
    }

    pub async fn handle_notification(&mut self, frame: NotificationFrame) {
        let Some(notification) = RelayNotification::from_frame(&frame) else {
            tracing::debug!("Engine notification {}: {}", frame.kind, frame.payload);
            return;
        };

        match notification {
            RelayNotification::NewPeer { peer } => {
                tracing::info!("Peer {} joined", peer.name);
                self.mirror.add_peer(&peer);
            }
            RelayNotification::PeerClosed { peer_name } if peer_name == self.peer_name => {
                tracing::info!("Relay closed our peer");
                self.teardown();
            }
            RelayNotification::PeerClosed { peer_name } => {
                tracing::info!("Peer {} left", peer_name);
                for consumer in self.mirror.remove_peer(&peer_name) {
                    self.sink.detach(consumer.id);
                }
            }
            RelayNotification::NewConsumer { consumer } => {
                self.consume(&consumer).await;
            }
            RelayNotification::ConsumerClosed { consumer_id, .. } => {
                if self.mirror.remove_consumer(consumer_id).is_some() {
                    self.sink.detach(consumer_id);
                }
            }
            RelayNotification::ProducerClosed { producer_id } => {
                if let Some(kind) = self.mirror.producers.remove(&producer_id) {
                    self.source.stop(kind);
                }
            }
            RelayNotification::TransportClosed { transport_id } => {
                if self.mirror.send_transport == Some(transport_id) {
                    self.mirror.send_transport = None;
                }
                if self.mirror.recv_transport == Some(transport_id) {
                    self.mirror.recv_transport = None;
                }
            }
        }
    }

    /// Handle the next notification. Returns its type, or `None` once the
    /// connection is gone.
    pub async fn next_notification(&mut self) -> Option<String> {
        let frame = self.notifications.recv().await?;
        let kind = frame.kind.clone();
        self.handle_notification(frame).await;
        Some(kind)
    }

    /// Process notifications until the connection closes or the relay closes
    /// our peer.
    pub async fn run(&mut self) {
        while self.mirror.joined {
            if self.next_notification().await.is_none() {
                tracing::info!("Connection closed");
                break;
            }
        }
        self.teardown();
    }

    /// Leave the room and close the connection
    pub async fn leave(&mut self) -> Result<()> {
        let result = self.connection.request(RelayRequest::Leave {}).await;
        self.teardown();
        self.connection.close();
        result.map(|_| ())
    }

    fn teardown(&mut self) {
        let consumers: Vec<Uuid> = self
            .mirror
            .peers
            .values()
            .flat_map(|peer| peer.consumers.keys().copied())
            .collect();
        for consumer_id in consumers {
            self.sink.detach(consumer_id);
        }
        for kind in self.mirror.producers.values().copied().collect::<Vec<_>>() {
            self.source.stop(kind);
        }
        self.mirror.clear();
    }
}
