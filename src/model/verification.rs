use serde::{Deserialize, Serialize};

/// What was verified.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Subject {
    Package(String),
    Repository(String),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Package(id) => write!(f, "package {}", id),
            Subject::Repository(id) => write!(f, "repository {}", id),
        }
    }
}

/// Why a signature was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureFault {
    MalformedEncoding,
    AlgorithmMismatch,
    BadSignature,
}

/// Why a signer or source is not trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustFault {
    UnknownKey,
    KeyExpired,
    KeyRevoked,
    InsecureTransport,
    /// The package's repository has no verification result.
    UnverifiedRepository,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    SignatureMissing,
    SignatureInvalid(SignatureFault),
    HashMismatch,
    UntrustedSource(TrustFault),
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Verified)
    }

    pub fn label(&self) -> String {
        match self {
            VerificationOutcome::Verified => "verified".to_string(),
            VerificationOutcome::SignatureMissing => "signature missing".to_string(),
            VerificationOutcome::SignatureInvalid(fault) => {
                format!("signature invalid ({:?})", fault)
            }
            VerificationOutcome::HashMismatch => "hash mismatch".to_string(),
            VerificationOutcome::UntrustedSource(fault) => {
                format!("untrusted source ({:?})", fault)
            }
        }
    }
}

/// Where the computed digest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestSource {
    ArtifactBytes,
    CachedDigest,
    /// Files on disk checked against the package manager's per-file digests.
    InstalledFiles,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_digest: Option<String>,
    pub digest_source: DigestSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Default for Evidence {
    fn default() -> Self {
        Self {
            expected_digest: None,
            computed_digest: None,
            digest_source: DigestSource::Unavailable,
            key_fingerprint: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub subject: Subject,
    #[serde(flatten)]
    pub outcome: VerificationOutcome,
    pub evidence: Evidence,
}

impl VerificationResult {
    pub fn new(subject: Subject, outcome: VerificationOutcome, evidence: Evidence) -> Self {
        Self {
            subject,
            outcome,
            evidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization_keeps_reason() {
        let result = VerificationResult::new(
            Subject::Repository("deb.debian.org_debian_dists_bookworm".to_string()),
            VerificationOutcome::UntrustedSource(TrustFault::KeyRevoked),
            Evidence::default(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "untrusted_source");
        assert_eq!(json["reason"], "key_revoked");

        let back: VerificationResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_verified_has_no_reason() {
        let json = serde_json::to_value(VerificationOutcome::Verified).unwrap();
        assert_eq!(json["outcome"], "verified");
        assert!(json.get("reason").is_none());
    }
}
