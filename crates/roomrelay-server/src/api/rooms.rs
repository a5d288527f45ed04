use crate::error::{RelayError, Result};
use crate::relay::room_snapshot;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use roomrelay_protocol::PeerSnapshot;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub peers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetail {
    pub id: String,
    pub rtp_capabilities: Value,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub rooms: usize,
    pub peers: usize,
    pub connections: usize,
}

pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    let mut rooms: Vec<RoomSummary> = state
        .relay
        .rooms()
        .iter()
        .filter(|room| !room.is_closed())
        .map(|room| RoomSummary {
            id: room.id().to_string(),
            peers: room.peer_names(),
        })
        .collect();
    rooms.sort_by(|a, b| a.id.cmp(&b.id));
    Json(rooms)
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomDetail>> {
    let room = state
        .relay
        .room(&room_id)
        .ok_or_else(|| RelayError::not_found("Room", &room_id))?;

    Ok(Json(RoomDetail {
        id: room.id().to_string(),
        rtp_capabilities: room.rtp_capabilities().clone(),
        peers: room_snapshot(&room),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Stats> {
    let rooms = state.relay.rooms();
    Json(Stats {
        rooms: rooms.len(),
        peers: rooms.iter().map(|room| room.peers().len()).sum(),
        connections: state.connections.connection_count().await,
    })
}
