//! Chat message envelope carried over the data channel.
//!
//! One data channel message is one [`WireEnvelope`] serialized as JSON. The
//! channel is ordered and reliable, so this layer neither reorders nor
//! retransmits.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::crypto::{EncryptedEnvelope, SharedKey};
use crate::error::{BottleError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub text: String,
    pub nickname: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChatMessage {
    pub fn now(text: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            nickname: nickname.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireEnvelope {
    pub ciphertext: String,
    pub nonce: String,
}

impl WireEnvelope {
    pub fn from_envelope(envelope: &EncryptedEnvelope) -> Self {
        Self {
            ciphertext: BASE64_STANDARD.encode(envelope.ciphertext()),
            nonce: BASE64_STANDARD.encode(envelope.nonce()),
        }
    }

    pub fn into_envelope(self) -> Result<EncryptedEnvelope> {
        let nonce = BASE64_STANDARD
            .decode(self.nonce.as_bytes())
            .map_err(|err| BottleError::MalformedEnvelope(format!("invalid nonce encoding: {err}")))?;
        let ciphertext = BASE64_STANDARD.decode(self.ciphertext.as_bytes()).map_err(|err| {
            BottleError::MalformedEnvelope(format!("invalid ciphertext encoding: {err}"))
        })?;
        EncryptedEnvelope::from_parts(&nonce, ciphertext)
    }
}

/// Serializes, encrypts and frames a message for the data channel.
pub fn seal(key: &SharedKey, message: &ChatMessage) -> Result<String> {
    let plaintext = serde_json::to_vec(message)
        .map_err(|err| BottleError::Encryption(err.to_string()))?;
    let envelope = key.encrypt(&plaintext)?;
    serde_json::to_string(&WireEnvelope::from_envelope(&envelope))
        .map_err(|err| BottleError::Encryption(err.to_string()))
}

/// Inverse of [`seal`]. Any failure means the frame is dropped; nothing
/// partially decoded is ever returned.
pub fn open(key: &SharedKey, frame: &[u8]) -> Result<ChatMessage> {
    let wire: WireEnvelope = serde_json::from_slice(frame)
        .map_err(|err| BottleError::MalformedEnvelope(err.to_string()))?;
    let envelope = wire.into_envelope()?;
    let plaintext = key.decrypt(&envelope)?;
    serde_json::from_slice(&plaintext).map_err(|err| BottleError::MalformedMessage(err.to_string()))
}
