use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::Ecosystem;
use crate::version::{SchemeKind, VersionKey};

/// Raw version string plus the ordering key derived from it.
///
/// The key is a pure function of `raw` and the scheme, so two records with
/// the same raw version always order the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub raw: String,
    pub key: VersionKey,
}

impl Version {
    /// Parses `raw` with `scheme`, degrading to a lexical key when the
    /// grammar rejects it.
    pub fn parse(raw: impl Into<String>, scheme: SchemeKind) -> Self {
        let raw = raw.into();
        let key = scheme
            .parse(&raw)
            .unwrap_or_else(|_| VersionKey::Lexical(raw.clone()));
        Self { raw, key }
    }

    /// False when the version could only be ordered lexically.
    pub fn is_reliable(&self) -> bool {
        !matches!(self.key, VersionKey::Lexical(_))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Which trust chain covers a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    /// Listed in a repository index whose signature the verifier checks.
    RepositoryIndexed,
    /// Installed from a local artifact, no repository vouches for it.
    LocalOnly,
    Unknown,
}

/// A file installed by a package, with the digest the package manager
/// recorded at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledFile {
    pub path: PathBuf,
    pub md5: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_size: Option<u64>,
}

/// An installed package as reported by a plugin. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Repository id or other source identifier.
    pub origin: String,
    /// SHA-256 (hex) the origin declares for the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_digest: Option<String>,
    /// Path of the artifact bytes, when still present on the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installed_files: Vec<InstalledFile>,
    pub signature_status: SignatureStatus,
    #[serde(flatten)]
    pub metadata: PackageMetadata,
}

impl PackageRecord {
    pub fn new(
        ecosystem: Ecosystem,
        name: impl Into<String>,
        version: impl Into<String>,
        origin: impl Into<String>,
        scheme: SchemeKind,
    ) -> Self {
        Self {
            ecosystem,
            name: name.into(),
            version: Version::parse(version, scheme),
            architecture: None,
            origin: origin.into(),
            declared_digest: None,
            artifact: None,
            installed_files: Vec::new(),
            signature_status: SignatureStatus::Unknown,
            metadata: PackageMetadata::default(),
        }
    }

    pub fn with_architecture(mut self, arch: impl Into<String>) -> Self {
        self.architecture = Some(arch.into());
        self
    }

    pub fn with_digest(mut self, sha256: impl Into<String>) -> Self {
        self.declared_digest = Some(sha256.into());
        self
    }

    pub fn with_artifact(mut self, path: PathBuf) -> Self {
        self.artifact = Some(path);
        self
    }

    pub fn with_files(mut self, files: Vec<InstalledFile>) -> Self {
        self.installed_files = files;
        self
    }

    pub fn with_signature_status(mut self, status: SignatureStatus) -> Self {
        self.signature_status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: PackageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stable identity: `ecosystem/name@version#origin`.
    pub fn identity(&self) -> String {
        format!(
            "{}/{}@{}#{}",
            self.ecosystem.as_str(),
            self.name,
            self.version.raw,
            self.origin
        )
    }

    pub fn reference(&self) -> PackageRef {
        PackageRef {
            ecosystem: self.ecosystem,
            name: self.name.clone(),
            version: self.version.raw.clone(),
            origin: self.origin.clone(),
        }
    }
}

/// Lightweight pointer to a [`PackageRecord`] of the same run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
    pub origin: String,
}

impl std::fmt::Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.ecosystem.as_str(), self.name, self.version)
    }
}

/// Repository metadata reported alongside packages so its signature can be
/// checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Matches [`PackageRecord::origin`] of the packages it indexes.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    pub release_path: PathBuf,
    pub signature_path: PathBuf,
}

impl RepositoryRecord {
    pub fn uses_plain_http(&self) -> bool {
        self.uri
            .as_deref()
            .map(|u| u.starts_with("http://"))
            .unwrap_or(false)
    }
}
