use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection could not be reestablished, exceeded maximum number of reconnection attempts")]
    ReconnectExhausted,

    #[error("The peer disconnected before the media stream was resolved")]
    PeerDisconnected,

    #[error("Not connected")]
    NotConnected,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RoomError>;
