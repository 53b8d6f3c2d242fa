//! Cryptographic helpers: the optional AEAD message sealer and signed
//! bearer tokens.
//!
//! Neither surface is required by the pairing protocol; both are enforcement
//! aids. The sealer wraps relayed text with AES-256-GCM under a
//! process-lifetime key and a fresh random nonce per message. Tokens are
//! HMAC-SHA256 over JSON claims, transported as `base58(claims).base58(mac)`.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Default bearer token lifetime.
pub const TOKEN_TTL_SECS: u64 = 15 * 60;
/// Lifetime of the long-lived refresh variant.
pub const REFRESH_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;

/// Error returned when the system clock is before the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockError;

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system clock is before Unix epoch")
    }
}

impl std::error::Error for ClockError {}

/// Seconds since the Unix epoch.
pub fn unix_now() -> Result<u64, ClockError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ClockError)
}

// ── Message sealing ──────────────────────────────────────────────────────────

/// Errors from sealing or opening a message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// AEAD encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// The sealed blob is truncated or the tag does not verify.
    #[error("decryption failed")]
    Decrypt,
}

/// Authenticated symmetric wrapper for relayed messages.
///
/// Layout of a sealed blob: `nonce (12) ‖ tag (16) ‖ ciphertext`.
pub struct MessageSealer {
    cipher: Aes256Gcm,
}

impl MessageSealer {
    /// Creates a sealer with a freshly generated process-lifetime key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::from_key(&key)
    }

    /// Creates a sealer from a fixed 32-byte key.
    #[must_use]
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Seals a plaintext under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut ciphertext = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut ciphertext)
            .map_err(|_| SealError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a sealed blob, verifying its tag.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(SealError::Decrypt);
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut plaintext = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| SealError::Decrypt)?;
        Ok(plaintext)
    }
}

// ── Bearer tokens ────────────────────────────────────────────────────────────

/// Claims carried in a signed bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id the token was minted for.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Fingerprint bound at mint time.
    pub fingerprint: String,
    /// Issued-at, seconds since the Unix epoch.
    pub iat: u64,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

/// Errors from verifying a bearer token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token is not `payload.signature` base58.
    #[error("malformed token")]
    Malformed,
    /// The signature does not match the payload.
    #[error("bad token signature")]
    BadSignature,
    /// The token expired.
    #[error("token expired")]
    Expired,
    /// The system clock is unusable.
    #[error(transparent)]
    Clock(#[from] ClockError),
}

/// Mints a short-lived bearer token for `user_id`/`fingerprint`.
pub fn mint_token(
    secret: &[u8],
    user_id: &str,
    fingerprint: &str,
    ttl_secs: u64,
) -> Result<String, TokenError> {
    let iat = unix_now()?;
    let claims = TokenClaims {
        user_id: user_id.to_string(),
        fingerprint: fingerprint.to_string(),
        iat,
        exp: iat.saturating_add(ttl_secs),
    };
    // Claims are plain strings and integers; serialization cannot fail.
    let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Malformed)?;
    let mac = sign(secret, &payload)?;
    Ok(format!(
        "{}.{}",
        bs58::encode(&payload).into_string(),
        bs58::encode(&mac).into_string()
    ))
}

/// Mints the long-lived refresh variant.
pub fn mint_refresh_token(
    secret: &[u8],
    user_id: &str,
    fingerprint: &str,
) -> Result<String, TokenError> {
    mint_token(secret, user_id, fingerprint, REFRESH_TOKEN_TTL_SECS)
}

/// Verifies a token's signature and expiry, returning its claims.
pub fn verify_token(secret: &[u8], token: &str) -> Result<TokenClaims, TokenError> {
    let (payload_b58, mac_b58) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let payload = bs58::decode(payload_b58)
        .into_vec()
        .map_err(|_| TokenError::Malformed)?;
    let mac = bs58::decode(mac_b58)
        .into_vec()
        .map_err(|_| TokenError::Malformed)?;

    let mut verifier =
        <HmacSha256 as KeyInit>::new_from_slice(secret).map_err(|_| TokenError::Malformed)?;
    verifier.update(&payload);
    verifier
        .verify_slice(&mac)
        .map_err(|_| TokenError::BadSignature)?;

    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
    if unix_now()? >= claims.exp {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

fn sign(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac =
        <HmacSha256 as KeyInit>::new_from_slice(secret).map_err(|_| TokenError::Malformed)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}
