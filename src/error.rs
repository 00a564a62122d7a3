//! Error types for the enumeration pipeline.
//!
//! Plugin- and record-level failures are recoverable and end up as report
//! warnings. Only [`OrchestrationError`] aborts a run, and only when no data
//! could be collected at all.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::{Ecosystem, Platform, ServiceManager};

/// Failure of a single plugin call.
#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{program}` failed: {message}")]
    Command { program: String, message: String },

    #[error("Command `{program}` timed out after {seconds}s")]
    CommandTimeout { program: String, seconds: u64 },

    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("Plugin {plugin} is not applicable on this host")]
    NotApplicable { plugin: String },
}

impl EnumerationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

/// Capability key already claimed by another plugin.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{platform:?}/{capability} is already claimed by {existing}, refusing {incoming}")]
pub struct RegistrationConflict {
    pub platform: Platform,
    pub capability: String,
    pub existing: String,
    pub incoming: String,
}

impl RegistrationConflict {
    pub(crate) fn packages(
        platform: Platform,
        ecosystem: Ecosystem,
        existing: &str,
        incoming: &str,
    ) -> Self {
        Self {
            platform,
            capability: ecosystem.as_str().to_string(),
            existing: existing.to_string(),
            incoming: incoming.to_string(),
        }
    }

    pub(crate) fn services(
        platform: Platform,
        manager: ServiceManager,
        existing: &str,
        incoming: &str,
    ) -> Self {
        Self {
            platform,
            capability: manager.as_str().to_string(),
            existing: existing.to_string(),
            incoming: incoming.to_string(),
        }
    }
}

/// Fatal run failure.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("No applicable collector for platform {platform:?}")]
    NoApplicablePlugin { platform: Platform },

    #[error("No data collected, every plugin failed: {}", failures.join("; "))]
    NoData { failures: Vec<String> },
}

/// Secure Store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid store key: {0}")]
    Key(String),

    #[error("Encryption failed for {0}")]
    Encrypt(String),

    #[error("Decryption failed for {0} (wrong key or tampered data)")]
    Decrypt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit log lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Vulnerability feed loading failures. Individual bad records are not
/// errors; they are skipped with a warning.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to read feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch feed {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Feed is not a valid document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unsupported feed version {0}")]
    UnsupportedVersion(u32),
}

/// Trust store loading failures.
#[derive(Error, Debug)]
pub enum TrustStoreError {
    #[error("Failed to read trust store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Trust store is not valid TOML: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("Trusted key {id} is unusable: {reason}")]
    InvalidKey { id: String, reason: String },
}

/// A version string the grammar cannot parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {scheme} version `{raw}`: {reason}")]
pub struct VersionError {
    pub scheme: &'static str,
    pub raw: String,
    pub reason: String,
}
