use thiserror::Error;

/// Room- and peer-level failure taxonomy.
///
/// Room-level variants abort an in-progress create/join and surface to the
/// user-visible error state. `NegotiationFailed` is contained to a single
/// peer: that connection is closed and removed while the session continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::SignalingUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
