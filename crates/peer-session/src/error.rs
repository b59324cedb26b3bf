use relay_bus::RelayError;
use thiserror::Error;

/// Failures reported by the transport primitive.
#[derive(Debug, Error)]
pub enum RtcError {
    #[error("peer setup failed: {0}")]
    Setup(String),
    #[error("operation not valid in signaling state {0}")]
    InvalidState(String),
    #[error("invalid session description: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("peer connection closed")]
    Closed,
    #[error("rtc backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("data channel {0} is not open")]
    NotOpen(String),
    #[error("data channel transport failed: {0}")]
    Transport(#[from] RtcError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("data channel {0} already exists")]
    ChannelExists(String),
    #[error("data channel {0} already declared")]
    DuplicateDeclaration(String),
    #[error("no live session")]
    NoSession,
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Rtc(#[from] RtcError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type SessionResult<T> = Result<T, SessionError>;
