use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use roomrelay_protocol::{
    ClientFrame, ClientNotificationFrame, ErrorBody, NotificationFrame, RelayRequest,
    ReplyFrame, RequestFrame, ServerFrame,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ClientError, Result};

/// Replies awaited by in-flight requests. `None` once the connection is gone,
/// so late requests fail right away.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<ReplyFrame>>>>>;

enum Outbound {
    Frame(ClientFrame),
    Close,
}

/// Build the relay URL carrying the room and peer identification.
pub fn connect_url(base: &str, room_id: &str, peer_name: &str) -> String {
    format!(
        "{}/?roomId={}&peerName={}",
        base.trim_end_matches('/'),
        urlencoding::encode(room_id),
        urlencoding::encode(peer_name)
    )
}

/// Client end of the duplex channel.
///
/// Every request gets a fresh id and resolves with the reply carrying the
/// same id, whatever order replies arrive in. When the channel closes, every
/// request still waiting fails with [`ClientError::ConnectionLost`].
pub struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Pending,
    next_request_id: AtomicU64,
}

impl Connection {
    /// Connect to the relay at `base` (e.g. `ws://127.0.0.1:8080`). The
    /// returned receiver yields every notification in arrival order and ends
    /// when the connection closes.
    pub async fn connect(
        base: &str,
        room_id: &str,
        peer_name: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NotificationFrame>)> {
        let url = connect_url(base, room_id, peer_name);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        tracing::info!("Connected to {} as {} in room {}", base, peer_name, room_id);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<NotificationFrame>();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));

        // Spawn task to handle outgoing frames
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let frame = match outbound {
                    Outbound::Frame(frame) => frame,
                    Outbound::Close => break,
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize frame: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send WebSocket frame");
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Spawn task to handle incoming frames
        let pending_in = pending.clone();
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Reply(reply)) => resolve(&pending_in, reply),
                        Ok(ServerFrame::Notification(frame)) => {
                            if notify_tx.send(frame).is_err() {
                                tracing::debug!("Notification dropped, nobody listening");
                            }
                        }
                        Err(e) => tracing::warn!("Invalid frame from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Dropping the senders fails every waiting request
            if let Some(lost) = pending_in.lock().take() {
                if !lost.is_empty() {
                    tracing::warn!("{} requests lost with the connection", lost.len());
                }
            }
        });

        Ok((
            Self {
                outbound: tx,
                pending,
                next_request_id: AtomicU64::new(1),
            },
            notify_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.pending.lock().is_some() && !self.outbound.is_closed()
    }

    /// Send a request and wait for its result
    pub async fn request(&self, request: RelayRequest) -> Result<Value> {
        let (method, payload) = request.into_parts();
        self.request_raw(&method, payload).await
    }

    /// Send a request and deserialize its result
    pub async fn request_as<T: DeserializeOwned>(&self, request: RelayRequest) -> Result<T> {
        let result = self.request(request).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request by method name. Methods the relay does not know are
    /// rejected by it with `UnknownMethod`.
    pub async fn request_raw(&self, method: &str, payload: Value) -> Result<Value> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(request_id, tx);
            }
            None => return Err(ClientError::ConnectionLost),
        }

        let frame = ClientFrame::Request(RequestFrame {
            request_id,
            method: method.to_string(),
            payload,
        });
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            if let Some(pending) = self.pending.lock().as_mut() {
                pending.remove(&request_id);
            }
            return Err(ClientError::ConnectionLost);
        }

        let reply = rx.await.map_err(|_| ClientError::ConnectionLost)?;
        into_result(reply)
    }

    /// Fire-and-forget notification, e.g. closing a producer
    pub fn notify(&self, request: RelayRequest) -> Result<()> {
        let (method, payload) = request.into_parts();
        let frame = ClientFrame::Notification(ClientNotificationFrame { method, payload });
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Close the channel. Requests still waiting fail with `ConnectionLost`.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve(pending: &Pending, reply: ReplyFrame) {
    let waiter = pending
        .lock()
        .as_mut()
        .and_then(|pending| pending.remove(&reply.request_id));

    match waiter {
        Some(tx) => {
            // The caller may have given up on the request
            let _ = tx.send(reply);
        }
        None => tracing::warn!("Reply for unknown request id {}", reply.request_id),
    }
}

fn into_result(reply: ReplyFrame) -> Result<Value> {
    if reply.ok {
        return Ok(reply.result.unwrap_or(Value::Null));
    }

    match reply.error {
        Some(body) => Err(body.into()),
        None => Err(ClientError::Protocol(format!(
            "reply {} failed without an error",
            reply.request_id
        ))),
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        ClientError::Rejected {
            code: body.code,
            message: body.message,
        }
    }
}
