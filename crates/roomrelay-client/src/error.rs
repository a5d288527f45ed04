use roomrelay_protocol::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The connection closed before the reply arrived. Never sent on the wire.
    #[error("Connection to the relay was lost")]
    ConnectionLost,

    #[error("Request rejected ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Wire error code, for rejections
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
