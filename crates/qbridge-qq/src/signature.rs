//! Ed25519 webhook signatures.
//!
//! QQ derives the bot's signing key from the app secret: the secret is
//! repeated until it reaches the 32-byte seed length, truncated, and used as
//! an ed25519 seed. The same key signs validation challenges and verifies
//! event callbacks.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

pub const SEED_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("app secret cannot be empty")]
    EmptySecret,
    #[error("signature header is missing")]
    MissingSignature,
    #[error("signature timestamp header is missing")]
    MissingTimestamp,
    #[error("signature is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("signature is malformed")]
    Malformed,
    #[error("signature verification failed")]
    Mismatch,
}

/// Stretches `secret` to an ed25519 seed by self-repetition and truncation.
pub fn derive_seed(secret: &str) -> Result<[u8; SEED_SIZE], SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }
    let mut stretched = secret.as_bytes().to_vec();
    while stretched.len() < SEED_SIZE {
        stretched.extend_from_within(..);
    }
    let mut seed = [0_u8; SEED_SIZE];
    seed.copy_from_slice(&stretched[..SEED_SIZE]);
    Ok(seed)
}

#[derive(Clone)]
pub struct WebhookSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSigner")
            .field("verifying_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish()
    }
}

impl WebhookSigner {
    pub fn from_secret(secret: &str) -> Result<Self, SignatureError> {
        let signing_key = SigningKey::from_bytes(&derive_seed(secret)?);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Hex signature over `prefix || message`.
    pub fn sign(&self, prefix: &str, message: &[u8]) -> String {
        let mut payload = Vec::with_capacity(prefix.len() + message.len());
        payload.extend_from_slice(prefix.as_bytes());
        payload.extend_from_slice(message);
        hex::encode(self.signing_key.sign(&payload).to_bytes())
    }

    /// Answers the `op = 13` challenge: signs `event_ts || plain_token`.
    pub fn sign_validation(&self, event_ts: &str, plain_token: &str) -> String {
        self.sign(event_ts, plain_token.as_bytes())
    }

    /// Verifies a callback signature over `timestamp || body`.
    pub fn verify(
        &self,
        signature_hex: &str,
        timestamp: &str,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        let signature_hex = signature_hex.trim();
        if signature_hex.is_empty() {
            return Err(SignatureError::MissingSignature);
        }
        let raw = hex::decode(signature_hex)?;
        if raw.len() != SIGNATURE_SIZE || raw[SIGNATURE_SIZE - 1] & 0xE0 != 0 {
            return Err(SignatureError::Malformed);
        }
        if timestamp.is_empty() {
            return Err(SignatureError::MissingTimestamp);
        }
        let signature = Signature::from_slice(&raw).map_err(|_| SignatureError::Malformed)?;

        let mut payload = Vec::with_capacity(timestamp.len() + body.len());
        payload.extend_from_slice(timestamp.as_bytes());
        payload.extend_from_slice(body);
        self.verifying_key
            .verify(&payload, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}
