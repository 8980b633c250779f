pub mod webrtc;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport timed out")]
    Timeout,
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Lifecycle notifications reported by the underlying peer connection or
/// data channel, normalized before they reach the session state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
