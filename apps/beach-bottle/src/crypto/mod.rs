//! Symmetric authenticated encryption for chat payloads.
//!
//! Both peers import the same pre-shared key out of band. Every call to
//! [`SharedKey::encrypt`] draws a fresh 96-bit nonce from the OS RNG; callers
//! cannot supply their own.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{BottleError, Result};

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;

const PASSPHRASE_SALT: &[u8] = b"beach-bottle:shared-key:v1";

/// How the operator hands key material to a session.
#[derive(Clone, Debug)]
pub enum KeyMaterial {
    /// Base64 (standard alphabet) or hex encoding of exactly 32 bytes.
    Encoded(String),
    /// Free-form passphrase, stretched with Argon2id.
    Passphrase(String),
}

impl KeyMaterial {
    pub fn import(&self) -> Result<SharedKey> {
        match self {
            KeyMaterial::Encoded(text) => SharedKey::from_encoded(text),
            KeyMaterial::Passphrase(passphrase) => SharedKey::from_passphrase(passphrase),
        }
    }

    /// Like [`KeyMaterial::import`], but runs the Argon2id stretch on the
    /// blocking pool so it does not stall a runtime worker.
    pub async fn import_async(&self) -> Result<SharedKey> {
        match self {
            KeyMaterial::Encoded(text) => SharedKey::from_encoded(text),
            KeyMaterial::Passphrase(passphrase) => {
                let passphrase = Zeroizing::new(passphrase.clone());
                tokio::task::spawn_blocking(move || SharedKey::from_passphrase(&passphrase))
                    .await
                    .map_err(|err| BottleError::KeyImport(format!("key derivation aborted: {err}")))?
            }
        }
    }
}

#[derive(Clone)]
pub struct SharedKey {
    bytes: Zeroizing<[u8; KEY_LENGTH]>,
}

impl SharedKey {
    pub fn import(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] = raw.try_into().map_err(|_| {
            BottleError::KeyImport(format!(
                "expected {KEY_LENGTH} bytes of key material, got {}",
                raw.len()
            ))
        })?;
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    pub fn from_encoded(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(BottleError::KeyImport("key material is empty".into()));
        }
        let raw = if trimmed.len() == KEY_LENGTH * 2
            && trimmed.bytes().all(|b| b.is_ascii_hexdigit())
        {
            hex::decode(trimmed)
                .map_err(|err| BottleError::KeyImport(format!("invalid hex key: {err}")))?
        } else {
            BASE64_STANDARD
                .decode(trimmed.as_bytes())
                .map_err(|err| BottleError::KeyImport(format!("invalid base64 key: {err}")))?
        };
        let raw = Zeroizing::new(raw);
        Self::import(&raw)
    }

    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.trim().is_empty() {
            return Err(BottleError::KeyImport("passphrase is empty".into()));
        }
        // 32 MiB, single pass.
        let params = Params::new(32 * 1024, 1, 1, Some(KEY_LENGTH))
            .map_err(|err| BottleError::KeyImport(format!("invalid argon2 params: {err}")))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut output = Zeroizing::new([0u8; KEY_LENGTH]);
        argon
            .hash_password_into(passphrase.as_bytes(), PASSPHRASE_SALT, &mut *output)
            .map_err(|err| BottleError::KeyImport(format!("argon2 derive failed: {err}")))?;
        Ok(Self { bytes: output })
    }

    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut *bytes);
        Self { bytes }
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&*self.bytes)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            // Only reachable for plaintexts beyond the AEAD length limit.
            .map_err(|err| BottleError::Encryption(err.to_string()))?;
        Ok(EncryptedEnvelope { ciphertext, nonce })
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| BottleError::Decryption)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        let key: &[u8; KEY_LENGTH] = &self.bytes;
        ChaCha20Poly1305::new(Key::from_slice(key))
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        *self.bytes == *other.bytes
    }
}

impl Eq for SharedKey {}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    ciphertext: Vec<u8>,
    nonce: [u8; NONCE_LENGTH],
}

impl EncryptedEnvelope {
    /// Rebuilds an envelope received from a peer.
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> Result<Self> {
        let nonce: [u8; NONCE_LENGTH] = nonce.try_into().map_err(|_| {
            BottleError::MalformedEnvelope(format!(
                "expected {NONCE_LENGTH} byte nonce, got {}",
                nonce.len()
            ))
        })?;
        Ok(Self { ciphertext, nonce })
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &[u8; NONCE_LENGTH] {
        &self.nonce
    }
}
