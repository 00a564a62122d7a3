//! Detached signature envelopes.
//!
//! A signed file `X` is accompanied by `X.sig`:
//!
//! ```json
//! {"algorithm": "ed25519", "key": "debian-archive-bookworm", "signature": "9f0c..."}
//! ```
//!
//! `key` names a trust store entry by id or fingerprint and `signature` is
//! the hex-encoded signature over the exact bytes of `X`.

use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use super::trust::TrustStore;
use crate::model::{SignatureFault, TrustFault, VerificationOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub algorithm: String,
    pub key: String,
    pub signature: String,
}

/// Result of checking one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    pub outcome: VerificationOutcome,
    pub key_fingerprint: Option<String>,
    pub detail: Option<String>,
}

impl SignatureCheck {
    fn rejected(outcome: VerificationOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            key_fingerprint: None,
            detail: Some(detail.into()),
        }
    }

    fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        self.key_fingerprint = Some(fingerprint.to_string());
        self
    }
}

/// Checks `envelope` over `message`. Trust problems with the key are
/// reported before the signature bytes are looked at.
pub fn check_detached(
    message: &[u8],
    envelope: &[u8],
    trust: &TrustStore,
    now: DateTime<Utc>,
) -> SignatureCheck {
    let envelope: SignatureEnvelope = match serde_json::from_slice(envelope) {
        Ok(envelope) => envelope,
        Err(e) => {
            return SignatureCheck::rejected(
                VerificationOutcome::SignatureInvalid(SignatureFault::MalformedEncoding),
                format!("unreadable signature envelope: {}", e),
            )
        }
    };

    let Some(entry) = trust.find(&envelope.key) else {
        return SignatureCheck::rejected(
            VerificationOutcome::UntrustedSource(TrustFault::UnknownKey),
            format!("key {} is not in the trust store", envelope.key),
        );
    };

    if entry.key.revoked {
        return SignatureCheck::rejected(
            VerificationOutcome::UntrustedSource(TrustFault::KeyRevoked),
            format!("key {} is revoked", entry.key.id),
        )
        .with_fingerprint(&entry.fingerprint);
    }

    if entry.is_expired(now) {
        return SignatureCheck::rejected(
            VerificationOutcome::UntrustedSource(TrustFault::KeyExpired),
            format!("key {} expired", entry.key.id),
        )
        .with_fingerprint(&entry.fingerprint);
    }

    if !envelope.algorithm.eq_ignore_ascii_case(&entry.key.algorithm) {
        return SignatureCheck::rejected(
            VerificationOutcome::SignatureInvalid(SignatureFault::AlgorithmMismatch),
            format!(
                "signature uses {}, key {} is {}",
                envelope.algorithm, entry.key.id, entry.key.algorithm
            ),
        )
        .with_fingerprint(&entry.fingerprint);
    }

    let signature = match hex::decode(envelope.signature.trim())
        .map_err(|e| e.to_string())
        .and_then(|bytes| Signature::from_slice(&bytes).map_err(|e| e.to_string()))
    {
        Ok(signature) => signature,
        Err(e) => {
            return SignatureCheck::rejected(
                VerificationOutcome::SignatureInvalid(SignatureFault::MalformedEncoding),
                format!("signature is not a valid encoding: {}", e),
            )
            .with_fingerprint(&entry.fingerprint)
        }
    };

    match entry.verifying_key.verify_strict(message, &signature) {
        Ok(()) => SignatureCheck {
            outcome: VerificationOutcome::Verified,
            key_fingerprint: Some(entry.fingerprint.clone()),
            detail: None,
        },
        Err(_) => SignatureCheck::rejected(
            VerificationOutcome::SignatureInvalid(SignatureFault::BadSignature),
            format!("signature does not verify with key {}", entry.key.id),
        )
        .with_fingerprint(&entry.fingerprint),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::verify::trust::{TrustedKey, ED25519};
    use ed25519_dalek::{Signer, SigningKey};

    pub(crate) fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub(crate) fn trusted(id: &str, seed: u8) -> TrustedKey {
        TrustedKey {
            id: id.to_string(),
            algorithm: ED25519.to_string(),
            public_key: hex::encode(signing_key(seed).verifying_key().to_bytes()),
            expires: None,
            revoked: false,
        }
    }

    pub(crate) fn envelope(key_id: &str, seed: u8, message: &[u8]) -> Vec<u8> {
        let signature = signing_key(seed).sign(message);
        serde_json::to_vec(&SignatureEnvelope {
            algorithm: ED25519.to_string(),
            key: key_id.to_string(),
            signature: hex::encode(signature.to_bytes()),
        })
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const RELEASE: &[u8] = b"Origin: Debian\nSuite: stable\nCodename: bookworm\n";

    fn store() -> TrustStore {
        let mut revoked = trusted("revoked", 2);
        revoked.revoked = true;
        let mut expired = trusted("expired", 3);
        expired.expires = Some("2020-01-01T00:00:00Z".parse().unwrap());
        TrustStore::from_keys(vec![trusted("archive", 1), revoked, expired]).unwrap()
    }

    fn outcome(envelope: &[u8]) -> VerificationOutcome {
        check_detached(RELEASE, envelope, &store(), Utc::now()).outcome
    }

    #[test]
    fn test_valid_signature() {
        let check = check_detached(RELEASE, &envelope("archive", 1, RELEASE), &store(), Utc::now());
        assert_eq!(check.outcome, VerificationOutcome::Verified);
        assert!(check.key_fingerprint.is_some());
    }

    #[test]
    fn test_each_rejection_is_distinct() {
        assert_eq!(
            outcome(b"not json"),
            VerificationOutcome::SignatureInvalid(SignatureFault::MalformedEncoding)
        );
        assert_eq!(
            outcome(&envelope("stranger", 9, RELEASE)),
            VerificationOutcome::UntrustedSource(TrustFault::UnknownKey)
        );
        assert_eq!(
            outcome(&envelope("revoked", 2, RELEASE)),
            VerificationOutcome::UntrustedSource(TrustFault::KeyRevoked)
        );
        assert_eq!(
            outcome(&envelope("expired", 3, RELEASE)),
            VerificationOutcome::UntrustedSource(TrustFault::KeyExpired)
        );
        // Signed by a different key than the one it names.
        assert_eq!(
            outcome(&envelope("archive", 7, RELEASE)),
            VerificationOutcome::SignatureInvalid(SignatureFault::BadSignature)
        );
    }

    #[test]
    fn test_algorithm_mismatch() {
        let mut env: SignatureEnvelope =
            serde_json::from_slice(&envelope("archive", 1, RELEASE)).unwrap();
        env.algorithm = "rsa-sha256".to_string();
        assert_eq!(
            outcome(&serde_json::to_vec(&env).unwrap()),
            VerificationOutcome::SignatureInvalid(SignatureFault::AlgorithmMismatch)
        );
    }

    #[test]
    fn test_truncated_signature_is_malformed() {
        let mut env: SignatureEnvelope =
            serde_json::from_slice(&envelope("archive", 1, RELEASE)).unwrap();
        env.signature.truncate(10);
        assert_eq!(
            outcome(&serde_json::to_vec(&env).unwrap()),
            VerificationOutcome::SignatureInvalid(SignatureFault::MalformedEncoding)
        );
    }

    #[test]
    fn test_tampered_message() {
        let env = envelope("archive", 1, RELEASE);
        let check = check_detached(b"Origin: Evil\n", &env, &store(), Utc::now());
        assert_eq!(
            check.outcome,
            VerificationOutcome::SignatureInvalid(SignatureFault::BadSignature)
        );
    }
}
