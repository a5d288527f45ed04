//! In-process media engine
//!
//! Keeps the bookkeeping a real engine would keep (which rooms, transports,
//! producers and consumers exist and how they relate) and hands out opaque
//! parameter blobs. The codec table is expressed with the `webrtc` crate's
//! codec types and registered in a `webrtc` media engine, so an invalid table
//! is rejected at startup.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use roomrelay_protocol::{MediaKind, TransportDirection};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use super::{EngineError, EngineEvent, EngineResult, EngineScope, MediaEngine};
use crate::state::Config;

struct LocalTransport {
    room: Uuid,
    direction: TransportDirection,
    connected: bool,
}

struct LocalProducer {
    transport: Uuid,
    kind: MediaKind,
    rtp_parameters: Value,
}

struct LocalConsumer {
    producer: Uuid,
    transport: Option<Uuid>,
}

#[derive(Default)]
struct LocalState {
    rooms: HashSet<Uuid>,
    transports: HashMap<Uuid, LocalTransport>,
    producers: HashMap<Uuid, LocalProducer>,
    consumers: HashMap<Uuid, LocalConsumer>,
    next_port: u16,
}

pub struct LocalEngine {
    codecs: Vec<(MediaKind, RTCRtpCodecParameters)>,
    announced_ip: String,
    min_port: u16,
    max_port: u16,
    state: Mutex<LocalState>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl LocalEngine {
    /// Build the engine from the relay configuration. The returned receiver
    /// carries the engine's asynchronous events.
    pub fn new(config: &Config) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        let mut registry = CodecRegistry::default();
        let mut codecs = Vec::with_capacity(config.media_codecs.len());

        for codec in &config.media_codecs {
            let parameters = RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: codec.mime_type.clone(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    sdp_fmtp_line: codec.parameters.clone(),
                    rtcp_feedback: vec![],
                },
                payload_type: codec.payload_type,
                ..Default::default()
            };

            let codec_type = match codec.kind {
                MediaKind::Audio => RTPCodecType::Audio,
                MediaKind::Video => RTPCodecType::Video,
            };
            registry.register_codec(parameters.clone(), codec_type)?;
            codecs.push((codec.kind, parameters));
        }

        let announced_ip = config
            .rtc_announced_ipv4
            .clone()
            .or_else(|| config.rtc_ipv4.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let (events, rx) = mpsc::unbounded_channel();

        let engine = Self {
            codecs,
            announced_ip,
            min_port: config.rtc_min_port,
            max_port: config.rtc_max_port,
            state: Mutex::new(LocalState {
                next_port: config.rtc_min_port,
                ..Default::default()
            }),
            events,
        };

        tracing::info!(
            "Local media engine ready with {} codecs, ports {}-{}",
            engine.codecs.len(),
            engine.min_port,
            engine.max_port
        );

        Ok((engine, rx))
    }

    /// Emit an event as if the engine had produced it on its own (transport
    /// failure, stats, ...).
    pub fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Engine event dropped, no router attached");
        }
    }

    fn capabilities(&self) -> Value {
        let codecs: Vec<Value> = self
            .codecs
            .iter()
            .map(|(kind, codec)| {
                json!({
                    "kind": kind,
                    "mimeType": codec.capability.mime_type,
                    "clockRate": codec.capability.clock_rate,
                    "channels": codec.capability.channels,
                    "parameters": codec.capability.sdp_fmtp_line,
                    "preferredPayloadType": codec.payload_type,
                })
            })
            .collect();

        json!({ "codecs": codecs })
    }

    /// Check that every codec named in `rtp_parameters` is in the room table.
    fn check_codecs(&self, kind: MediaKind, rtp_parameters: &Value) -> EngineResult<()> {
        let Some(requested) = rtp_parameters.get("codecs").and_then(Value::as_array) else {
            return Ok(());
        };

        for codec in requested {
            let mime = codec
                .get("mimeType")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::new("codec without mimeType"))?;

            let supported = self.codecs.iter().any(|(k, c)| {
                *k == kind && c.capability.mime_type.eq_ignore_ascii_case(mime)
            });
            if !supported {
                return Err(EngineError::new(format!("unsupported codec {}", mime)));
            }
        }

        Ok(())
    }
}

impl LocalState {
    fn allocate_port(&mut self, min: u16, max: u16) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= max { min } else { port + 1 };
        port
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn room_capabilities(&self) -> EngineResult<Value> {
        Ok(self.capabilities())
    }

    async fn create_room(&self, room: Uuid) -> EngineResult<Value> {
        self.state.lock().rooms.insert(room);
        tracing::debug!("Engine room {} created", room);
        Ok(self.capabilities())
    }

    async fn close_room(&self, room: Uuid) {
        let mut state = self.state.lock();
        state.rooms.remove(&room);

        let transports: HashSet<Uuid> = state
            .transports
            .iter()
            .filter(|(_, t)| t.room == room)
            .map(|(id, _)| *id)
            .collect();
        state.transports.retain(|id, _| !transports.contains(id));
        state.producers.retain(|_, p| !transports.contains(&p.transport));

        let producers = &state.producers;
        let orphaned: Vec<Uuid> = state
            .consumers
            .iter()
            .filter(|(_, c)| {
                !producers.contains_key(&c.producer)
                    || c.transport.is_some_and(|t| transports.contains(&t))
            })
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            state.consumers.remove(&id);
        }

        tracing::debug!("Engine room {} closed", room);
    }

    async fn create_transport(
        &self,
        room: Uuid,
        peer: Uuid,
        transport: Uuid,
        direction: TransportDirection,
        _app_data: &Value,
    ) -> EngineResult<Value> {
        let mut state = self.state.lock();
        if !state.rooms.contains(&room) {
            return Err(EngineError::new(format!("room {} does not exist", room)));
        }

        let port = state.allocate_port(self.min_port, self.max_port);
        state.transports.insert(
            transport,
            LocalTransport {
                room,
                direction,
                connected: false,
            },
        );

        tracing::debug!(
            "Engine transport {} ({}) created for peer {} on port {}",
            transport,
            direction,
            peer,
            port
        );

        let password = transport.simple().to_string();
        Ok(json!({
            "iceParameters": {
                "usernameFragment": &password[..8],
                "password": password,
            },
            "iceCandidates": [{
                "foundation": "udpcandidate",
                "ip": self.announced_ip,
                "port": port,
                "protocol": "udp",
                "type": "host",
            }],
            "dtlsParameters": { "role": "auto" },
        }))
    }

    async fn connect_transport(
        &self,
        transport: Uuid,
        dtls_parameters: &Value,
    ) -> EngineResult<Value> {
        {
            let mut state = self.state.lock();
            let entry = state
                .transports
                .get_mut(&transport)
                .ok_or_else(|| EngineError::new(format!("transport {} does not exist", transport)))?;

            if entry.connected {
                return Err(EngineError::new("transport already connected"));
            }
            entry.connected = true;
        }

        self.emit(EngineEvent::new(
            EngineScope::Transport(transport),
            "transportStateChange",
            json!({ "transportId": transport, "state": "connected" }),
        ));

        let role = dtls_parameters
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("auto");
        let local_role = match role {
            "client" => "server",
            _ => "client",
        };
        Ok(json!({ "dtlsLocalRole": local_role }))
    }

    async fn close_transport(&self, transport: Uuid) {
        let mut state = self.state.lock();
        state.transports.remove(&transport);
        state.producers.retain(|_, p| p.transport != transport);

        let producers = &state.producers;
        let orphaned: Vec<Uuid> = state
            .consumers
            .iter()
            .filter(|(_, c)| {
                c.transport == Some(transport) || !producers.contains_key(&c.producer)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            state.consumers.remove(&id);
        }
    }

    async fn create_producer(
        &self,
        transport: Uuid,
        producer: Uuid,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Value> {
        self.check_codecs(kind, rtp_parameters)?;

        let mut state = self.state.lock();
        match state.transports.get(&transport) {
            Some(t) if t.direction == TransportDirection::Send => {}
            Some(_) => return Err(EngineError::new("cannot produce on a receive transport")),
            None => {
                return Err(EngineError::new(format!(
                    "transport {} does not exist",
                    transport
                )));
            }
        }

        state.producers.insert(
            producer,
            LocalProducer {
                transport,
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );

        Ok(json!({ "producerId": producer }))
    }

    async fn close_producer(&self, producer: Uuid) {
        let mut state = self.state.lock();
        state.producers.remove(&producer);
        state.consumers.retain(|_, c| c.producer != producer);
    }

    async fn create_consumer(
        &self,
        room: Uuid,
        consumer: Uuid,
        producer: Uuid,
        peer: Uuid,
    ) -> EngineResult<Value> {
        let mut state = self.state.lock();
        if !state.rooms.contains(&room) {
            return Err(EngineError::new(format!("room {} does not exist", room)));
        }

        let source = state
            .producers
            .get(&producer)
            .ok_or_else(|| EngineError::new(format!("producer {} does not exist", producer)))?;
        let parameters = json!({
            "kind": source.kind,
            "rtpParameters": source.rtp_parameters,
        });

        state.consumers.insert(
            consumer,
            LocalConsumer {
                producer,
                transport: None,
            },
        );
        tracing::debug!(
            "Engine consumer {} of producer {} created for peer {}",
            consumer,
            producer,
            peer
        );

        Ok(parameters)
    }

    async fn enable_consumer(&self, consumer: Uuid, transport: Uuid) -> EngineResult<Value> {
        let mut state = self.state.lock();
        match state.transports.get(&transport) {
            Some(t) if t.direction == TransportDirection::Recv => {}
            Some(_) => return Err(EngineError::new("cannot consume on a send transport")),
            None => {
                return Err(EngineError::new(format!(
                    "transport {} does not exist",
                    transport
                )));
            }
        }

        let producer = {
            let entry = state
                .consumers
                .get_mut(&consumer)
                .ok_or_else(|| EngineError::new(format!("consumer {} does not exist", consumer)))?;
            entry.transport = Some(transport);
            entry.producer
        };

        let rtp_parameters = state
            .producers
            .get(&producer)
            .map(|p| p.rtp_parameters.clone())
            .unwrap_or(Value::Null);

        Ok(json!({ "rtpParameters": rtp_parameters }))
    }

    async fn close_consumer(&self, consumer: Uuid) {
        self.state.lock().consumers.remove(&consumer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (LocalEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        LocalEngine::new(&Config::default()).unwrap()
    }

    #[tokio::test]
    async fn capabilities_follow_codec_table() {
        let (engine, _rx) = engine();
        let caps = engine.room_capabilities().await.unwrap();
        let codecs = caps["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 3);
        assert_eq!(codecs[0]["mimeType"], "audio/opus");
        assert_eq!(codecs[0]["preferredPayloadType"], 111);
    }

    #[tokio::test]
    async fn transports_need_a_room() {
        let (engine, _rx) = engine();
        let err = engine
            .create_transport(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                TransportDirection::Send,
                &Value::Null,
            )
            .await
            .unwrap_err();
        assert!(err.message().contains("does not exist"));
    }

    #[tokio::test]
    async fn ports_wrap_around_the_range() {
        let config = Config {
            rtc_min_port: 5000,
            rtc_max_port: 5001,
            ..Config::default()
        };
        let (engine, _rx) = LocalEngine::new(&config).unwrap();
        let room = Uuid::new_v4();
        engine.create_room(room).await.unwrap();

        let mut ports = vec![];
        for _ in 0..3 {
            let params = engine
                .create_transport(
                    room,
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    TransportDirection::Recv,
                    &Value::Null,
                )
                .await
                .unwrap();
            ports.push(params["iceCandidates"][0]["port"].as_u64().unwrap());
        }
        assert_eq!(ports, vec![5000, 5001, 5000]);
    }

    #[tokio::test]
    async fn connect_emits_state_change_once() {
        let (engine, mut rx) = engine();
        let room = Uuid::new_v4();
        let transport = Uuid::new_v4();
        engine.create_room(room).await.unwrap();
        engine
            .create_transport(room, Uuid::new_v4(), transport, TransportDirection::Send, &Value::Null)
            .await
            .unwrap();

        engine.connect_transport(transport, &json!({})).await.unwrap();
        assert!(engine.connect_transport(transport, &json!({})).await.is_err());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.scope, EngineScope::Transport(transport));
        assert_eq!(event.kind, "transportStateChange");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_codec() {
        let (engine, _rx) = engine();
        let room = Uuid::new_v4();
        let transport = Uuid::new_v4();
        engine.create_room(room).await.unwrap();
        engine
            .create_transport(room, Uuid::new_v4(), transport, TransportDirection::Send, &Value::Null)
            .await
            .unwrap();

        let err = engine
            .create_producer(
                transport,
                Uuid::new_v4(),
                MediaKind::Video,
                &json!({ "codecs": [{ "mimeType": "video/AV1" }] }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.message(), "unsupported codec video/AV1");
    }

    #[tokio::test]
    async fn consumers_follow_their_producer() {
        let (engine, _rx) = engine();
        let room = Uuid::new_v4();
        let send = Uuid::new_v4();
        let recv = Uuid::new_v4();
        let producer = Uuid::new_v4();
        let consumer = Uuid::new_v4();

        engine.create_room(room).await.unwrap();
        engine
            .create_transport(room, Uuid::new_v4(), send, TransportDirection::Send, &Value::Null)
            .await
            .unwrap();
        engine
            .create_transport(room, Uuid::new_v4(), recv, TransportDirection::Recv, &Value::Null)
            .await
            .unwrap();
        engine
            .create_producer(send, producer, MediaKind::Audio, &json!({ "ssrc": 1 }))
            .await
            .unwrap();

        let params = engine
            .create_consumer(room, consumer, producer, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(params["kind"], "audio");

        let enabled = engine.enable_consumer(consumer, recv).await.unwrap();
        assert_eq!(enabled["rtpParameters"]["ssrc"], 1);

        engine.close_producer(producer).await;
        assert!(engine.enable_consumer(consumer, recv).await.is_err());
    }
}
