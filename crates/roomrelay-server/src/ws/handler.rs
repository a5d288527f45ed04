use crate::relay::PeerSession;
use crate::state::AppState;
use crate::ws::connections::{ConnectionHandle, ConnectionInfo};
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use roomrelay_protocol::{ClientFrame, ServerFrame};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub room_id: String,
    pub peer_name: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if params.room_id.is_empty() || params.peer_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "roomId and peerName are required").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    // Outbound frames, serialized by the send task only
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let connection = ConnectionHandle::new(connection_id, tx);

    state
        .connections
        .add_connection(
            connection_id,
            ConnectionInfo {
                room_id: params.room_id.clone(),
                peer_name: params.peer_name.clone(),
            },
        )
        .await;

    let session = Arc::new(PeerSession::new(
        state.relay.clone(),
        params.room_id,
        params.peer_name,
        connection,
    ));

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests are handled strictly in arrival order, off the read loop so a
    // slow engine call never stalls reading the socket.
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let dispatcher = session.clone();
    tokio::spawn(async move {
        while let Some(frame) = request_rx.recv().await {
            dispatcher.handle_frame(frame).await;
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(
                            "Invalid frame from {} on {}: {}",
                            session.peer_name(),
                            connection_id,
                            e
                        );
                        continue;
                    }
                };
                if request_tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Close before anything queued behind an in-flight request can run;
    // whatever completes later finds the peer closed.
    session.close().await;
    drop(request_tx);

    state.connections.remove_connection(connection_id).await;
    send_task.abort();

    tracing::info!(
        "Peer {} of room {} disconnected",
        session.peer_name(),
        session.room_id()
    );
}
