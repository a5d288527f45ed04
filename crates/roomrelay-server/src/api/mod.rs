mod rooms;

pub use rooms::{RoomDetail, RoomSummary, Stats};

use crate::state::AppState;
use crate::ws;
use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSocket endpoint, `/?roomId=..&peerName=..`
        .route("/", get(ws::handler::ws_handler))
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Read-only room inspection
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{room_id}", get(rooms::get_room))
        .route("/api/stats", get(rooms::stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_app;
    use crate::state::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_check() {
        let (app, _relay) = create_app(Config::default()).await.unwrap();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let (app, _relay) = create_app(Config::default()).await.unwrap();
        let (status, body) = get_json(app, "/api/rooms/nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "EntityNotFound");
    }

    #[tokio::test]
    async fn empty_relay_stats() {
        let (app, _relay) = create_app(Config::default()).await.unwrap();
        let (status, body) = get_json(app.clone(), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rooms"], 0);
        assert_eq!(body["connections"], 0);

        let (_, rooms) = get_json(app, "/api/rooms").await;
        assert_eq!(rooms, serde_json::json!([]));
    }

    #[tokio::test]
    async fn websocket_route_requires_room_and_name() {
        let (app, _relay) = create_app(Config::default()).await.unwrap();
        let response = app
            .oneshot(Request::builder().uri("/?roomId=r1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
