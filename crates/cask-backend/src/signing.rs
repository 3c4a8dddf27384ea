//! Ed25519-signed, time-bounded object URLs
//!
//! URL form:
//! `<scheme>://<container>/<key>?method=<M>&expires=<unix-seconds>&sig=<base64url>`
//!
//! The signature covers `"<M>\n<container>/<key>\n<expires>"`, so changing
//! the key, the method or the expiry invalidates it. The query is split at the
//! last `?`, which lets keys contain `?` and `&` without escaping.

use std::fs;
use std::io;
use std::path::Path;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::HttpMethod;

/// Errors from signing/verification operations
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed signed URL: {0}")]
    Malformed(String),

    #[error("signature does not match")]
    BadSignature,

    #[error("URL expired at {expires}")]
    Expired { expires: i64 },

    #[error("URL grants {granted}, not {requested}")]
    MethodMismatch {
        granted: HttpMethod,
        requested: HttpMethod,
    },
}

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

/// Parsed and verified signed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub scheme: String,
    pub container: String,
    pub key: String,
    pub method: HttpMethod,
    pub expires: i64,
}

/// Holds the key signed URLs are issued with.
#[derive(Clone)]
pub struct UrlSigner {
    signing_key: SigningKey,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl UrlSigner {
    /// Fresh random key, valid for this process only.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    /// Decode a base64 (standard alphabet) 32-byte seed.
    pub fn from_base64(encoded: &str) -> SigningResult<Self> {
        let bytes = STANDARD.decode(encoded.trim())?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Load a key file holding a base64 seed.
    pub fn load(path: &Path) -> SigningResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_base64(&contents)
    }

    /// Base64 seed, suitable for writing a key file.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.signing_key.to_bytes())
    }

    /// SHA-256 fingerprint of the public key (hex).
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key.verifying_key().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Issue a URL for `method` on `container/key`, valid until `expires`.
    pub fn sign(
        &self,
        scheme: &str,
        container: &str,
        key: &str,
        method: HttpMethod,
        expires: DateTime<Utc>,
    ) -> String {
        let expires = expires.timestamp();
        let message = Self::message(container, key, method, expires);
        let signature = self.signing_key.sign(message.as_bytes());
        format!(
            "{}://{}/{}?method={}&expires={}&sig={}",
            scheme,
            container,
            key,
            method,
            expires,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    /// Check a URL issued by this signer for use with `method` at `now`.
    pub fn verify(&self, url: &str, method: HttpMethod, now: DateTime<Utc>) -> SigningResult<SignedUrl> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| SigningError::Malformed("missing scheme".to_string()))?;
        let (location, query) = rest
            .rsplit_once('?')
            .ok_or_else(|| SigningError::Malformed("missing query".to_string()))?;
        let (container, key) = location
            .split_once('/')
            .ok_or_else(|| SigningError::Malformed("missing object key".to_string()))?;

        let mut granted = None;
        let mut expires = None;
        let mut sig = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("method", v)) => {
                    granted = Some(v.parse::<HttpMethod>().map_err(SigningError::Malformed)?)
                }
                Some(("expires", v)) => {
                    expires = Some(v.parse::<i64>().map_err(|e| {
                        SigningError::Malformed(format!("bad expires: {}", e))
                    })?)
                }
                Some(("sig", v)) => sig = Some(v),
                _ => return Err(SigningError::Malformed(format!("unexpected parameter: {}", pair))),
            }
        }
        let granted = granted.ok_or_else(|| SigningError::Malformed("missing method".to_string()))?;
        let expires = expires.ok_or_else(|| SigningError::Malformed("missing expires".to_string()))?;
        let sig = sig.ok_or_else(|| SigningError::Malformed("missing sig".to_string()))?;

        let sig_bytes = URL_SAFE_NO_PAD.decode(sig)?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| SigningError::BadSignature)?;
        let message = Self::message(container, key, granted, expires);
        self.signing_key
            .verifying_key()
            .verify(message.as_bytes(), &signature)
            .map_err(|_| SigningError::BadSignature)?;

        if now.timestamp() > expires {
            return Err(SigningError::Expired { expires });
        }
        if granted != method {
            return Err(SigningError::MethodMismatch {
                granted,
                requested: method,
            });
        }

        Ok(SignedUrl {
            scheme: scheme.to_string(),
            container: container.to_string(),
            key: key.to_string(),
            method: granted,
            expires,
        })
    }

    fn message(container: &str, key: &str, method: HttpMethod, expires: i64) -> String {
        format!("{}\n{}/{}\n{}", method, container, key, expires)
    }
}
