//! Integrity and authenticity checks.
//!
//! Repositories are checked first: their release file must carry a valid
//! detached signature from a trusted key. Packages are then checked for
//! content integrity and inherit the outcome of the repository that
//! indexes them.
//!
//! Content integrity uses the first source available: the artifact bytes,
//! a digest cached from an earlier run, then the files the package
//! installed against the per-file digests its package manager recorded.
//! A package whose content could not be checked at all keeps its chain of
//! trust outcome with the evidence saying so.
//!
//! Rejections are data, not errors: every subject gets exactly one
//! [`VerificationResult`].

pub mod signature;
pub mod trust;

pub use signature::{check_detached, SignatureCheck, SignatureEnvelope};
pub use trust::{TrustEntry, TrustStore, TrustedKey};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::model::{
    AuditEvent, AuditOutcome, DigestSource, Evidence, PackageRecord, RepositoryRecord,
    SignatureStatus, Subject, TrustFault, VerificationOutcome, VerificationResult,
};
use crate::store::AuditSink;

const ACTOR: &str = "verifier";
const READ_CHUNK: usize = 64 * 1024;
pub const CONTENT_UNCHECKED: &str = "content not checked: no digest available";

/// Everything produced by one verification pass.
#[derive(Debug, Default)]
pub struct VerificationSummary {
    pub results: Vec<VerificationResult>,
    /// Package identity to outcome, for the matcher.
    pub package_outcomes: HashMap<String, VerificationOutcome>,
    /// Digests computed from artifact bytes in this pass, by package
    /// identity.
    pub computed_digests: HashMap<String, String>,
}

pub struct Verifier {
    trust: Arc<TrustStore>,
    cached_digests: HashMap<String, String>,
    audit: Option<Arc<dyn AuditSink>>,
    require_secure_transport: bool,
    concurrency: usize,
    root: PathBuf,
}

impl Verifier {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self {
            trust,
            cached_digests: HashMap::new(),
            audit: None,
            require_secure_transport: false,
            concurrency: 8,
            root: PathBuf::from("/"),
        }
    }

    /// Digests from earlier runs, used when the artifact is gone.
    pub fn with_cached_digests(mut self, digests: HashMap<String, String>) -> Self {
        self.cached_digests = digests;
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn require_secure_transport(mut self, required: bool) -> Self {
        self.require_secure_transport = required;
        self
    }

    /// Filesystem root that installed file paths resolve under.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn audit(&self, subject: &Subject, outcome: &VerificationOutcome) {
        let Some(sink) = &self.audit else {
            return;
        };
        let event = AuditEvent::new(
            ACTOR,
            format!("verify {}", subject),
            if outcome.is_verified() {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            },
        )
        .with_detail(outcome.label());
        // The sink counts its own failures; the orchestrator reports them.
        let _ = sink.record(&event);
    }

    /// Checks the detached signature over a repository's release file.
    pub async fn verify_repository(&self, repo: &RepositoryRecord) -> VerificationResult {
        let subject = Subject::Repository(repo.id.clone());
        let mut evidence = Evidence::default();

        let outcome = match tokio::fs::read(&repo.release_path).await {
            Err(e) => {
                evidence.detail = Some(format!(
                    "release file {} unreadable: {}",
                    repo.release_path.display(),
                    e
                ));
                VerificationOutcome::SignatureMissing
            }
            Ok(release) => {
                evidence.computed_digest = Some(hex::encode(Sha256::digest(&release)));
                evidence.digest_source = DigestSource::ArtifactBytes;

                match tokio::fs::read(&repo.signature_path).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        evidence.detail = Some("no detached signature".to_string());
                        VerificationOutcome::SignatureMissing
                    }
                    Err(e) => {
                        evidence.detail = Some(format!("signature unreadable: {}", e));
                        VerificationOutcome::SignatureMissing
                    }
                    Ok(envelope) => {
                        let check = check_detached(&release, &envelope, &self.trust, Utc::now());
                        evidence.key_fingerprint = check.key_fingerprint;
                        evidence.detail = check.detail;
                        self.transport_check(repo, check.outcome, &mut evidence)
                    }
                }
            }
        };

        debug!(repository = %repo.id, outcome = %outcome.label(), "repository verified");
        self.audit(&subject, &outcome);
        VerificationResult::new(subject, outcome, evidence)
    }

    fn transport_check(
        &self,
        repo: &RepositoryRecord,
        outcome: VerificationOutcome,
        evidence: &mut Evidence,
    ) -> VerificationOutcome {
        if outcome.is_verified() && self.require_secure_transport && repo.uses_plain_http() {
            evidence.detail = Some(format!(
                "fetched over plain http from {}",
                repo.uri.as_deref().unwrap_or_default()
            ));
            return VerificationOutcome::UntrustedSource(TrustFault::InsecureTransport);
        }
        outcome
    }

    /// Checks content integrity, then the chain of trust through the
    /// package's repository.
    pub async fn verify_package(
        &self,
        package: &PackageRecord,
        repositories: &HashMap<String, VerificationResult>,
    ) -> (VerificationResult, Option<String>) {
        let identity = package.identity();
        let subject = Subject::Package(identity.clone());
        let mut evidence = Evidence {
            expected_digest: package.declared_digest.clone(),
            ..Evidence::default()
        };

        let mut fresh_digest = None;
        if let Some(artifact) = &package.artifact {
            match hash_file::<Sha256>(artifact).await {
                Ok(digest) => {
                    evidence.computed_digest = Some(digest.clone());
                    evidence.digest_source = DigestSource::ArtifactBytes;
                    fresh_digest = Some(digest);
                }
                Err(e) => {
                    warn!(package = %identity, error = %e, "artifact unreadable");
                }
            }
        }
        if evidence.computed_digest.is_none() {
            if let Some(cached) = self.cached_digests.get(&identity) {
                evidence.computed_digest = Some(cached.clone());
                evidence.digest_source = DigestSource::CachedDigest;
            }
        }

        let mut rejected = match (&evidence.expected_digest, &evidence.computed_digest) {
            (Some(expected), Some(computed)) if !digests_equal(expected, computed) => {
                evidence.detail =
                    Some("artifact digest differs from the declared digest".to_string());
                Some(VerificationOutcome::HashMismatch)
            }
            _ => None,
        };
        if rejected.is_none() && evidence.digest_source != DigestSource::ArtifactBytes {
            rejected = self.check_installed_files(package, &mut evidence).await;
        }

        let outcome = match rejected {
            Some(outcome) => outcome,
            None => {
                let outcome = self.chain_of_trust(package, repositories, &mut evidence);
                if outcome.is_verified() && evidence.digest_source == DigestSource::Unavailable {
                    warn!(package = %identity, "signature chain verified, content not checked");
                    evidence.detail = Some(CONTENT_UNCHECKED.to_string());
                }
                outcome
            }
        };

        debug!(package = %identity, outcome = %outcome.label(), "package verified");
        self.audit(&subject, &outcome);
        (VerificationResult::new(subject, outcome, evidence), fresh_digest)
    }

    /// Rehashes every file the package installed and compares it with the
    /// recorded digest. Files that are gone or unreadable are counted, not
    /// rejected.
    async fn check_installed_files(
        &self,
        package: &PackageRecord,
        evidence: &mut Evidence,
    ) -> Option<VerificationOutcome> {
        if package.installed_files.is_empty() {
            return None;
        }

        let mut checked = 0usize;
        let mut skipped = 0usize;
        for file in &package.installed_files {
            let relative = file.path.strip_prefix("/").unwrap_or(&file.path);
            let path = self.root.join(relative);
            match hash_file::<Md5>(&path).await {
                Ok(actual) => {
                    checked += 1;
                    if !digests_equal(&file.md5, &actual) {
                        evidence.expected_digest = Some(file.md5.clone());
                        evidence.computed_digest = Some(actual);
                        evidence.digest_source = DigestSource::InstalledFiles;
                        evidence.detail = Some(format!(
                            "{} differs from the recorded digest",
                            file.path.display()
                        ));
                        return Some(VerificationOutcome::HashMismatch);
                    }
                }
                Err(e) => {
                    if e.kind() != ErrorKind::NotFound {
                        debug!(path = %path.display(), error = %e, "installed file unreadable");
                    }
                    skipped += 1;
                }
            }
        }

        if checked > 0 {
            if evidence.digest_source == DigestSource::Unavailable {
                evidence.digest_source = DigestSource::InstalledFiles;
            }
            evidence.detail = Some(format!(
                "{} installed files match, {} not checked",
                checked, skipped
            ));
        }
        None
    }

    fn chain_of_trust(
        &self,
        package: &PackageRecord,
        repositories: &HashMap<String, VerificationResult>,
        evidence: &mut Evidence,
    ) -> VerificationOutcome {
        match package.signature_status {
            SignatureStatus::LocalOnly | SignatureStatus::Unknown => {
                evidence.detail = Some(format!("no signed index covers origin {}", package.origin));
                VerificationOutcome::SignatureMissing
            }
            SignatureStatus::RepositoryIndexed => match repositories.get(&package.origin) {
                None => {
                    evidence.detail = Some(format!("repository {} was not verified", package.origin));
                    VerificationOutcome::UntrustedSource(TrustFault::UnverifiedRepository)
                }
                Some(repo) => {
                    evidence.key_fingerprint = repo.evidence.key_fingerprint.clone();
                    if !repo.outcome.is_verified() {
                        evidence.detail = Some(format!(
                            "repository {}: {}",
                            package.origin,
                            repo.outcome.label()
                        ));
                    }
                    repo.outcome
                }
            },
        }
    }

    /// Verifies every repository, then every package, with bounded
    /// concurrency.
    pub async fn verify_all(
        &self,
        repositories: &[RepositoryRecord],
        packages: &[PackageRecord],
    ) -> VerificationSummary {
        let repo_results: Vec<VerificationResult> = stream::iter(repositories)
            .map(|repo| self.verify_repository(repo))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let by_id: HashMap<String, VerificationResult> = repo_results
            .iter()
            .filter_map(|r| match &r.subject {
                Subject::Repository(id) => Some((id.clone(), r.clone())),
                Subject::Package(_) => None,
            })
            .collect();

        let package_results: Vec<(String, VerificationResult, Option<String>)> =
            stream::iter(packages)
                .map(|pkg| {
                    let by_id = &by_id;
                    async move {
                        let (result, digest) = self.verify_package(pkg, by_id).await;
                        (pkg.identity(), result, digest)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut summary = VerificationSummary {
            results: repo_results,
            ..VerificationSummary::default()
        };
        for (identity, result, digest) in package_results {
            summary.package_outcomes.insert(identity.clone(), result.outcome);
            if let Some(digest) = digest {
                summary.computed_digests.insert(identity, digest);
            }
            summary.results.push(result);
        }

        let verified = summary.results.iter().filter(|r| r.outcome.is_verified()).count();
        info!(
            repositories = repositories.len(),
            packages = packages.len(),
            verified,
            "verification finished"
        );
        summary
    }
}

/// Streams `path` through `D`, hex-encoded.
async fn hash_file<D: Digest>(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Constant-time comparison of two hex digests. Malformed hex never
/// compares equal.
fn digests_equal(expected: &str, computed: &str) -> bool {
    match (hex::decode(expected.trim()), hex::decode(computed.trim())) {
        (Ok(a), Ok(b)) => a.ct_eq(&b).into(),
        _ => false,
    }
}
