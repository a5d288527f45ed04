use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use roomrelay_protocol::{ErrorCode, ReplyFrame, RequestParseError};
use serde_json::json;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Peer has not joined the room")]
    NotJoined,

    #[error("Peer {peer_name} already exists in room {room_id}")]
    DuplicatePeer { room_id: String, peer_name: String },

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Media engine failure: {0}")]
    Engine(#[from] EngineError),
}

impl RelayError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        RelayError::EntityNotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::NotJoined => ErrorCode::NotJoined,
            RelayError::DuplicatePeer { .. } => ErrorCode::DuplicatePeer,
            RelayError::UnknownMethod(_) => ErrorCode::UnknownMethod,
            RelayError::EntityNotFound { .. } => ErrorCode::EntityNotFound,
            RelayError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            RelayError::Engine(_) => ErrorCode::EngineFailure,
        }
    }

    /// Failed reply for the request that produced this error
    pub fn into_reply(self, request_id: u64) -> ReplyFrame {
        let message = match &self {
            // Engine messages are passed through untouched
            RelayError::Engine(e) => e.to_string(),
            other => other.to_string(),
        };
        ReplyFrame::failure(request_id, self.code(), message)
    }
}

impl From<RequestParseError> for RelayError {
    fn from(err: RequestParseError) -> Self {
        match err {
            RequestParseError::UnknownMethod(method) => RelayError::UnknownMethod(method),
            other @ RequestParseError::InvalidPayload { .. } => {
                RelayError::InvalidPayload(other.to_string())
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::EntityNotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::DuplicatePeer { .. } => StatusCode::CONFLICT,
            RelayError::Engine(e) => {
                tracing::error!("Engine error: {:?}", e);
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::BAD_REQUEST,
        };

        let body = Json(json!({
            "code": self.code(),
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_message_passes_through() {
        let reply = RelayError::Engine(EngineError::new("codec mismatch")).into_reply(9);
        let error = reply.error.unwrap();
        assert_eq!(reply.request_id, 9);
        assert!(!reply.ok);
        assert_eq!(error.code, ErrorCode::EngineFailure);
        assert_eq!(error.message, "codec mismatch");
    }

    #[test]
    fn parse_errors_map_to_codes() {
        let unknown: RelayError = RequestParseError::UnknownMethod("x".into()).into();
        assert_eq!(unknown.code(), ErrorCode::UnknownMethod);

        let invalid: RelayError = RequestParseError::InvalidPayload {
            method: "produce".into(),
            reason: "missing field `kind`".into(),
        }
        .into();
        assert_eq!(invalid.code(), ErrorCode::InvalidPayload);
    }
}
