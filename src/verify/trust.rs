//! Trusted signing keys.
//!
//! ```toml
//! [[keys]]
//! id = "debian-archive-bookworm"
//! algorithm = "ed25519"
//! public_key = "3d4017c3e843895a92b70aa74d1b7ebc9c982ccf2ec4968cc0cd55f12af4660c"
//! expires = "2031-06-01T00:00:00Z"
//! revoked = false
//! ```

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::TrustStoreError;

pub const ED25519: &str = "ed25519";

/// A key as written in the trust store file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub id: String,
    pub algorithm: String,
    /// Hex-encoded public key.
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TrustFile {
    #[serde(default)]
    keys: Vec<TrustedKey>,
}

/// A trusted key with its decoded public key.
#[derive(Debug, Clone)]
pub struct TrustEntry {
    pub key: TrustedKey,
    pub fingerprint: String,
    pub(crate) verifying_key: VerifyingKey,
}

impl TrustEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.key.expires.map(|e| e <= now).unwrap_or(false)
    }
}

/// Hex SHA-256 of the raw public key bytes.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Read-only set of keys. Shared across verification tasks.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    entries: Vec<TrustEntry>,
}

impl TrustStore {
    pub fn load(path: &Path) -> Result<Self, TrustStoreError> {
        let content = fs::read_to_string(path).map_err(|source| TrustStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), keys = store.len(), "trust store loaded");
        Ok(store)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, TrustStoreError> {
        let file: TrustFile = toml::from_str(content)?;
        Self::from_keys(file.keys)
    }

    pub fn from_keys(keys: Vec<TrustedKey>) -> Result<Self, TrustStoreError> {
        let entries = keys
            .into_iter()
            .map(decode_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks a key up by id or fingerprint.
    pub fn find(&self, key_ref: &str) -> Option<&TrustEntry> {
        let key_ref = key_ref.trim();
        self.entries
            .iter()
            .find(|e| e.key.id == key_ref || e.fingerprint.eq_ignore_ascii_case(key_ref))
    }
}

fn decode_entry(key: TrustedKey) -> Result<TrustEntry, TrustStoreError> {
    let invalid = |reason: String| TrustStoreError::InvalidKey {
        id: key.id.clone(),
        reason,
    };

    if !key.algorithm.eq_ignore_ascii_case(ED25519) {
        return Err(invalid(format!("unsupported algorithm {}", key.algorithm)));
    }

    let bytes = hex::decode(key.public_key.trim()).map_err(|e| invalid(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))?;
    let verifying_key = VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;

    Ok(TrustEntry {
        fingerprint: fingerprint(&bytes),
        verifying_key,
        key,
    })
}
