use super::*;
use crate::engine::{EngineError, EngineResult, LocalEngine};
use crate::state::Config;
use crate::ws::connections::ConnectionHandle;
use async_trait::async_trait;
use roomrelay_protocol::{ErrorCode, ReplyFrame, RequestFrame, ServerFrame};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;

/// Local engine with switchable produce failures and delays, tracking which
/// producers are alive on the engine side.
struct TestEngine {
    inner: LocalEngine,
    fail_produce: AtomicBool,
    produce_delay_ms: AtomicU64,
    producers: Mutex<HashSet<Uuid>>,
}

#[async_trait]
impl MediaEngine for TestEngine {
    async fn room_capabilities(&self) -> EngineResult<Value> {
        self.inner.room_capabilities().await
    }

    async fn create_room(&self, room: Uuid) -> EngineResult<Value> {
        self.inner.create_room(room).await
    }

    async fn close_room(&self, room: Uuid) {
        self.inner.close_room(room).await
    }

    async fn create_transport(
        &self,
        room: Uuid,
        peer: Uuid,
        transport: Uuid,
        direction: TransportDirection,
        app_data: &Value,
    ) -> EngineResult<Value> {
        self.inner
            .create_transport(room, peer, transport, direction, app_data)
            .await
    }

    async fn connect_transport(
        &self,
        transport: Uuid,
        dtls_parameters: &Value,
    ) -> EngineResult<Value> {
        self.inner.connect_transport(transport, dtls_parameters).await
    }

    async fn close_transport(&self, transport: Uuid) {
        self.inner.close_transport(transport).await
    }

    async fn create_producer(
        &self,
        transport: Uuid,
        producer: Uuid,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Value> {
        if self.fail_produce.load(Ordering::SeqCst) {
            return Err(EngineError::new("producer rejected"));
        }
        let result = self
            .inner
            .create_producer(transport, producer, kind, rtp_parameters)
            .await?;
        self.producers.lock().insert(producer);

        let delay = self.produce_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(result)
    }

    async fn close_producer(&self, producer: Uuid) {
        self.producers.lock().remove(&producer);
        self.inner.close_producer(producer).await
    }

    async fn create_consumer(
        &self,
        room: Uuid,
        consumer: Uuid,
        producer: Uuid,
        peer: Uuid,
    ) -> EngineResult<Value> {
        self.inner.create_consumer(room, consumer, producer, peer).await
    }

    async fn enable_consumer(&self, consumer: Uuid, transport: Uuid) -> EngineResult<Value> {
        self.inner.enable_consumer(consumer, transport).await
    }

    async fn close_consumer(&self, consumer: Uuid) {
        self.inner.close_consumer(consumer).await
    }
}

struct Harness {
    relay: Arc<Relay>,
    engine: Arc<TestEngine>,
    events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

fn harness() -> Harness {
    let (inner, events) = LocalEngine::new(&Config::default()).unwrap();
    let engine = Arc::new(TestEngine {
        inner,
        fail_produce: AtomicBool::new(false),
        produce_delay_ms: AtomicU64::new(0),
        producers: Mutex::new(HashSet::new()),
    });
    let relay = Arc::new(Relay::new(engine.clone()));
    Harness {
        relay,
        engine,
        events: Some(events),
    }
}

impl Harness {
    fn client(&self, room_id: &str, name: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionHandle::new(Uuid::new_v4(), tx);
        Client {
            session: PeerSession::new(self.relay.clone(), room_id, name, connection),
            rx,
            next_id: 0,
        }
    }

    fn route_events(&mut self) {
        let events = self.events.take().unwrap();
        self.relay.spawn_event_router(events);
    }
}

struct Client {
    session: PeerSession,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
    next_id: u64,
}

impl Client {
    fn frame(&mut self, method: &str, payload: Value) -> RequestFrame {
        self.next_id += 1;
        RequestFrame {
            request_id: self.next_id,
            method: method.to_string(),
            payload,
        }
    }

    async fn request(&mut self, method: &str, payload: Value) -> ReplyFrame {
        let frame = self.frame(method, payload);
        self.session.handle_request(frame).await
    }

    async fn ok(&mut self, method: &str, payload: Value) -> Value {
        let reply = self.request(method, payload).await;
        assert!(reply.ok, "{} failed: {:?}", method, reply.error);
        reply.result.unwrap()
    }

    async fn error(&mut self, method: &str, payload: Value) -> ErrorCode {
        let reply = self.request(method, payload).await;
        assert!(!reply.ok, "{} unexpectedly succeeded", method);
        reply.error.unwrap().code
    }

    async fn join(&mut self) -> Value {
        self.ok("join", json!({})).await
    }

    async fn transport(&mut self, direction: &str) -> Uuid {
        let info = self
            .ok("createTransport", json!({ "direction": direction }))
            .await;
        let id: Uuid = serde_json::from_value(info["transportId"].clone()).unwrap();
        self.ok(
            "connectTransport",
            json!({ "transportId": id, "dtlsParameters": { "role": "client" } }),
        )
        .await;
        id
    }

    async fn produce(&mut self, transport_id: Uuid) -> Uuid {
        let result = self
            .ok(
                "produce",
                json!({
                    "transportId": transport_id,
                    "kind": "video",
                    "rtpParameters": { "codecs": [{ "mimeType": "video/VP8" }] },
                }),
            )
            .await;
        serde_json::from_value(result["producerId"].clone()).unwrap()
    }

    /// Wait for the next notification of `kind`, skipping others
    async fn wait_for(&mut self, kind: &str) -> Value {
        loop {
            let frame = timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("no {} notification", kind))
                .unwrap();
            if let ServerFrame::Notification(n) = frame {
                if n.kind == kind {
                    return n.payload;
                }
            }
        }
    }

    /// Kinds of everything queued right now
    fn drain(&mut self) -> Vec<String> {
        let mut kinds = vec![];
        while let Ok(frame) = self.rx.try_recv() {
            if let ServerFrame::Notification(n) = frame {
                kinds.push(n.kind);
            }
        }
        kinds
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn query_room_does_not_create_it() {
    let h = harness();
    let mut alice = h.client("r1", "alice");

    let info = alice.ok("queryRoom", json!({})).await;
    assert_eq!(info["peers"], json!([]));
    assert_eq!(info["rtpCapabilities"]["codecs"].as_array().unwrap().len(), 3);
    assert_eq!(h.relay.room_count(), 0);
}

#[tokio::test]
async fn requests_before_join_are_rejected() {
    let h = harness();
    let mut alice = h.client("r1", "alice");

    assert_eq!(
        alice
            .error("createTransport", json!({ "direction": "send" }))
            .await,
        ErrorCode::NotJoined
    );
    assert_eq!(alice.error("leave", json!({})).await, ErrorCode::NotJoined);
    assert!(!alice.session.is_joined());
}

#[tokio::test]
async fn unknown_method_and_bad_payload() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    alice.join().await;

    assert_eq!(alice.error("teleport", json!({})).await, ErrorCode::UnknownMethod);
    assert_eq!(
        alice.error("produce", json!({ "kind": "video" })).await,
        ErrorCode::InvalidPayload
    );
    // The session survives request-scoped errors
    assert!(alice.session.is_joined());
}

#[tokio::test]
async fn joins_with_distinct_names_see_each_other() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");

    let first = alice.join().await;
    assert_eq!(first["peers"], json!([]));

    let second = bob.join().await;
    assert_eq!(second["peers"][0]["name"], "alice");

    let joined = alice.wait_for("newPeer").await;
    assert_eq!(joined["peer"]["name"], "bob");

    let info = alice.ok("queryRoom", json!({})).await;
    assert_eq!(info["peers"], json!(["alice", "bob"]));
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut imposter = h.client("r1", "alice");

    alice.join().await;
    assert_eq!(alice.error("join", json!({})).await, ErrorCode::DuplicatePeer);
    assert_eq!(imposter.error("join", json!({})).await, ErrorCode::DuplicatePeer);

    // The same name in another room is fine
    let mut elsewhere = h.client("r2", "alice");
    elsewhere.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_with_same_name_admit_one() {
    let h = harness();

    for round in 0..20 {
        let room_id = format!("room-{}", round);
        let mut first = h.client(&room_id, "alice");
        let mut second = h.client(&room_id, "alice");

        let (a, b) = tokio::join!(
            first.request("join", json!({})),
            second.request("join", json!({}))
        );

        assert!(a.ok ^ b.ok, "exactly one join must succeed");
        let loser = if a.ok { b } else { a };
        assert_eq!(loser.error.unwrap().code, ErrorCode::DuplicatePeer);

        let room = h.relay.room(&room_id).unwrap();
        assert_eq!(room.peer_names(), vec!["alice"]);
    }
}

#[tokio::test]
async fn produce_creates_consumers_for_other_peers() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;

    let send = alice.transport("send").await;
    let producer_id = alice.produce(send).await;

    let announced = bob.wait_for("newConsumer").await;
    assert_eq!(announced["consumer"]["producerId"], json!(producer_id));
    assert_eq!(announced["consumer"]["peerName"], "alice");
    assert_eq!(announced["consumer"]["kind"], "video");

    let recv = bob.transport("recv").await;
    let enabled = bob
        .ok(
            "enableConsumer",
            json!({ "consumerId": announced["consumer"]["id"], "transportId": recv }),
        )
        .await;
    assert_eq!(enabled["rtpParameters"]["codecs"][0]["mimeType"], "video/VP8");

    // The producer never consumes itself
    assert!(!alice.drain().contains(&"newConsumer".to_string()));
}

#[tokio::test]
async fn joiner_gets_consumers_for_existing_producers() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    alice.join().await;
    let send = alice.transport("send").await;
    let producer_id = alice.produce(send).await;

    let mut bob = h.client("r1", "bob");
    let joined = bob.join().await;

    let existing = &joined["peers"][0];
    assert_eq!(existing["name"], "alice");
    assert_eq!(existing["producers"][0]["id"], json!(producer_id));
    assert_eq!(existing["consumers"][0]["producerId"], json!(producer_id));

    settle().await;
    assert!(!bob.drain().contains(&"newConsumer".to_string()));
}

#[tokio::test]
async fn transport_must_be_connected_and_match_direction() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    alice.join().await;

    let info = alice
        .ok("createTransport", json!({ "direction": "send" }))
        .await;
    let pending = info["transportId"].clone();
    assert_eq!(
        alice
            .error("produce", json!({ "transportId": pending, "kind": "audio" }))
            .await,
        ErrorCode::EntityNotFound
    );

    let recv = alice.transport("recv").await;
    assert_eq!(
        alice
            .error("produce", json!({ "transportId": recv, "kind": "audio" }))
            .await,
        ErrorCode::EntityNotFound
    );

    // Connecting twice is an error too
    assert_eq!(
        alice
            .error(
                "connectTransport",
                json!({ "transportId": recv, "dtlsParameters": {} })
            )
            .await,
        ErrorCode::EntityNotFound
    );
}

#[tokio::test]
async fn engine_failure_leaves_no_producer() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;
    let send = alice.transport("send").await;

    h.engine.fail_produce.store(true, Ordering::SeqCst);
    let reply = alice
        .request(
            "produce",
            json!({ "transportId": send, "kind": "audio", "rtpParameters": {} }),
        )
        .await;
    let error = reply.error.unwrap();
    assert_eq!(error.code, ErrorCode::EngineFailure);
    assert_eq!(error.message, "producer rejected");

    let room = h.relay.room("r1").unwrap();
    assert!(room_snapshot(&room)[0].producers.is_empty());

    settle().await;
    assert!(!bob.drain().contains(&"newConsumer".to_string()));
}

#[tokio::test]
async fn unsupported_codec_is_an_engine_failure() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    alice.join().await;
    let send = alice.transport("send").await;

    let reply = alice
        .request(
            "produce",
            json!({
                "transportId": send,
                "kind": "video",
                "rtpParameters": { "codecs": [{ "mimeType": "video/AV1" }] },
            }),
        )
        .await;
    assert_eq!(reply.error.unwrap().message, "unsupported codec video/AV1");
}

#[tokio::test]
async fn closing_a_producer_closes_every_consumer() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    let mut carol = h.client("r1", "carol");
    alice.join().await;
    bob.join().await;
    carol.join().await;

    let send = alice.transport("send").await;
    let producer_id = alice.produce(send).await;
    bob.wait_for("newConsumer").await;
    carol.wait_for("newConsumer").await;

    alice
        .ok("closeProducer", json!({ "producerId": producer_id }))
        .await;

    for peer in [&mut bob, &mut carol] {
        let closed = peer.wait_for("consumerClosed").await;
        assert_eq!(closed["producerId"], json!(producer_id));
        assert_eq!(peer.drain(), Vec::<String>::new());
    }

    // Closing again is a no-op
    alice
        .ok("closeProducer", json!({ "producerId": producer_id }))
        .await;
    assert!(bob.drain().is_empty());
    assert!(!alice.drain().contains(&"producerClosed".to_string()));
}

#[tokio::test]
async fn closing_a_consumer_leaves_the_producer() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;

    let send = alice.transport("send").await;
    alice.produce(send).await;
    let announced = bob.wait_for("newConsumer").await;
    let consumer_id = announced["consumer"]["id"].clone();

    bob.ok("closeConsumer", json!({ "consumerId": consumer_id }))
        .await;
    bob.ok("closeConsumer", json!({ "consumerId": consumer_id }))
        .await;

    let room = h.relay.room("r1").unwrap();
    assert_eq!(room.peer("bob").unwrap().consumer_count(), 0);
    assert_eq!(room.peer("alice").unwrap().producers().len(), 1);
    assert!(bob.drain().is_empty());
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn closing_a_transport_closes_its_producers() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;

    let send = alice.transport("send").await;
    alice.produce(send).await;
    bob.wait_for("newConsumer").await;

    alice.ok("closeTransport", json!({ "transportId": send })).await;
    bob.wait_for("consumerClosed").await;

    let room = h.relay.room("r1").unwrap();
    assert!(room.peer("alice").unwrap().producers().is_empty());
    assert_eq!(room.peer("bob").unwrap().consumer_count(), 0);
}

#[tokio::test]
async fn disconnect_closes_the_peer_once() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;
    alice.drain();

    bob.session.close().await;
    bob.session.close().await;

    assert_eq!(alice.drain(), vec!["peerClosed"]);
    assert_eq!(
        bob.error("createTransport", json!({ "direction": "recv" }))
            .await,
        ErrorCode::NotJoined
    );
    assert_eq!(h.relay.room("r1").unwrap().peer_names(), vec!["alice"]);
}

#[tokio::test]
async fn late_engine_completion_is_discarded() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    alice.join().await;
    let send = alice.transport("send").await;

    h.engine.produce_delay_ms.store(50, Ordering::SeqCst);
    let frame = alice.frame(
        "produce",
        json!({ "transportId": send, "kind": "audio", "rtpParameters": {} }),
    );

    let session = &alice.session;
    let (reply, _) = tokio::join!(session.handle_request(frame), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close().await;
    });

    assert!(!reply.ok);
    assert!(h.engine.producers.lock().is_empty());
    assert_eq!(h.relay.room_count(), 0);
}

#[tokio::test]
async fn empty_room_is_removed_and_recreated_fresh() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    alice.join().await;
    let send = alice.transport("send").await;
    alice.produce(send).await;
    let first = h.relay.room("r1").unwrap();

    alice.ok("leave", json!({})).await;
    assert!(h.relay.room("r1").is_none());
    assert_eq!(h.relay.room_count(), 0);
    assert!(first.is_closed());

    // A left session stays closed
    assert_eq!(alice.error("join", json!({})).await, ErrorCode::NotJoined);

    let mut again = h.client("r1", "alice");
    let joined = again.join().await;
    assert_eq!(joined["peers"], json!([]));
    let second = h.relay.room("r1").unwrap();
    assert_ne!(first.engine_id(), second.engine_id());
}

#[tokio::test]
async fn two_peer_room_lifecycle() {
    let h = harness();
    let mut a = h.client("r1", "A");
    let mut b = h.client("r1", "B");

    assert_eq!(a.join().await["peers"], json!([]));
    assert_eq!(b.join().await["peers"][0]["name"], "A");
    assert_eq!(a.wait_for("newPeer").await["peer"]["name"], "B");

    let a_send = a.transport("send").await;
    let a_producer = a.produce(a_send).await;
    let consumer = b.wait_for("newConsumer").await;
    assert_eq!(consumer["consumer"]["producerId"], json!(a_producer));

    // B produces as well, so A holds a consumer derived from B
    let b_send = b.transport("send").await;
    let b_producer = b.produce(b_send).await;
    a.wait_for("newConsumer").await;
    a.drain();

    b.session.close().await;
    let closed = a.wait_for("consumerClosed").await;
    assert_eq!(closed["producerId"], json!(b_producer));
    assert_eq!(a.wait_for("peerClosed").await["peerName"], "B");
    assert!(h.relay.room("r1").is_some());

    a.session.close().await;
    assert!(h.relay.room("r1").is_none());
}

#[tokio::test]
async fn engine_close_event_cascades() {
    let mut h = harness();
    h.route_events();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;

    let send = alice.transport("send").await;
    let state = alice.wait_for("transportStateChange").await;
    assert_eq!(state["state"], "connected");

    let producer_id = alice.produce(send).await;
    bob.wait_for("newConsumer").await;

    h.engine
        .inner
        .emit(EngineEvent::close(EngineScope::Transport(send)));

    let producer = alice.wait_for("producerClosed").await;
    assert_eq!(producer["producerId"], json!(producer_id));
    let transport = alice.wait_for("transportClosed").await;
    assert_eq!(transport["transportId"], json!(send));
    bob.wait_for("consumerClosed").await;
}

#[tokio::test]
async fn engine_closed_peer_cannot_join_again() {
    let mut h = harness();
    h.route_events();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;

    let peer_id = h.relay.room("r1").unwrap().peer("alice").unwrap().id();
    h.engine
        .inner
        .emit(EngineEvent::close(EngineScope::Peer(peer_id)));

    let closed = alice.wait_for("peerClosed").await;
    assert_eq!(closed["peerName"], "alice");
    bob.wait_for("peerClosed").await;

    assert_eq!(alice.error("join", json!({})).await, ErrorCode::NotJoined);
    assert_eq!(alice.error("join", json!({})).await, ErrorCode::NotJoined);
    assert!(!alice.session.is_joined());
    assert_eq!(h.relay.room("r1").unwrap().peer_names(), vec!["bob"]);
}

#[tokio::test]
async fn client_notifications_close_without_reply() {
    let h = harness();
    let mut alice = h.client("r1", "alice");
    let mut bob = h.client("r1", "bob");
    alice.join().await;
    bob.join().await;

    let send = alice.transport("send").await;
    let producer_id = alice.produce(send).await;
    bob.wait_for("newConsumer").await;

    alice
        .session
        .handle_notification(roomrelay_protocol::ClientNotificationFrame {
            method: "closeProducer".into(),
            payload: json!({ "producerId": producer_id }),
        })
        .await;
    bob.wait_for("consumerClosed").await;

    alice
        .session
        .handle_notification(roomrelay_protocol::ClientNotificationFrame {
            method: "leave".into(),
            payload: json!({}),
        })
        .await;
    assert_eq!(bob.wait_for("peerClosed").await["peerName"], "alice");
    assert!(!alice.session.is_joined());
}
