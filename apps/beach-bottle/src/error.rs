use thiserror::Error;

use crate::session::SessionState;
use crate::transport::TransportError;

/// Every failure the chat core reports to its caller.
///
/// `Decryption`, `MalformedEnvelope` and `MalformedMessage` concern a single
/// inbound frame; the session keeps running after them. `RoleConflict` is
/// fatal to the session. `KeyImport` and `DescriptorFormat` are raised before
/// any session state changes, so the caller can fix the input and retry.
#[derive(Debug, Error)]
pub enum BottleError {
    #[error("invalid key material: {0}")]
    KeyImport(String),
    #[error("invalid connection descriptor: {0}")]
    DescriptorFormat(String),
    #[error("role conflict: {0}")]
    RoleConflict(String),
    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("message failed authentication")]
    Decryption,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("malformed chat message: {0}")]
    MalformedMessage(String),
    #[error("failed to encrypt outbound message: {0}")]
    Encryption(String),
    #[error("chat channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = BottleError> = std::result::Result<T, E>;
