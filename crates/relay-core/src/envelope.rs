//! Symmetric authenticated encryption for message bodies.
//!
//! Bodies are AES-256-GCM tokens: a version prefix followed by
//! base64(nonce || ciphertext). The envelope is stateless beyond the key;
//! decryption fails closed on any malformed or tampered token so nothing but
//! metadata ever leaves the process in serialized form.

use std::sync::Once;

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;

/// Version prefix carried by every token the relay produces.
pub const TOKEN_PREFIX: &str = "otp1:";
const NONCE_BYTES: usize = 12;
const ENVELOPE_AAD: &[u8] = b"otp-relay-envelope-v1";

static PLAINTEXT_FALLBACK_WARNING: Once = Once::new();

#[derive(Clone)]
/// Public struct `MessageEnvelope` used across relay components.
pub struct MessageEnvelope {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageEnvelope([REDACTED])")
    }
}

impl MessageEnvelope {
    /// Build an envelope from a base64-encoded 256-bit key.
    pub fn new(key_base64: &str) -> Result<Self> {
        let raw = BASE64_STANDARD
            .decode(key_base64.trim())
            .map_err(|_| anyhow!("encryption key is not valid base64"))?;
        if raw.len() != 32 {
            bail!("encryption key must decode to 32 bytes, got {}", raw.len());
        }
        let cipher = Aes256Gcm::new_from_slice(&raw)
            .map_err(|_| anyhow!("encryption key material has invalid length"))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: ENVELOPE_AAD,
                },
            )
            .map_err(|_| anyhow!("message encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{TOKEN_PREFIX}{}", BASE64_STANDARD.encode(payload)))
    }

    /// Decrypt a token produced by [`encrypt`](Self::encrypt).
    ///
    /// Fails with an invalid-token error when the prefix is missing, the
    /// payload is malformed, or authentication fails under this key.
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let Some(payload) = token.strip_prefix(TOKEN_PREFIX) else {
            bail!("invalid token: missing version prefix");
        };
        let raw = BASE64_STANDARD
            .decode(payload)
            .map_err(|_| anyhow!("invalid token: payload encoding"))?;
        if raw.len() <= NONCE_BYTES {
            bail!("invalid token: payload truncated");
        }
        let nonce = &raw[..NONCE_BYTES];
        let ciphertext = &raw[NONCE_BYTES..];
        let plaintext = self
            .cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad: ENVELOPE_AAD,
                },
            )
            .map_err(|_| anyhow!("invalid token: integrity check failed"))?;
        String::from_utf8(plaintext).map_err(|_| anyhow!("invalid token: payload is not UTF-8"))
    }

    /// Whether a body is structurally a relay token.
    pub fn is_token(value: &str) -> bool {
        value
            .strip_prefix(TOKEN_PREFIX)
            .is_some_and(|payload| BASE64_STANDARD.decode(payload).is_ok())
    }
}

/// Record that an `encrypted=true` body arrived without a token prefix and is
/// being handled as plaintext. Edge firmware that only base64-encodes falls
/// into this path; warn once per process, not per message.
pub fn note_plaintext_fallback(node_id: &str) {
    PLAINTEXT_FALLBACK_WARNING.call_once(|| {
        tracing::warn!(
            node_id,
            "received encrypted-flagged body without token prefix; treating as plaintext \
             (check edge encryption configuration)"
        );
    });
}
