//! Core data types shared by plugins, the verifier, the matcher and the
//! orchestrator.
//!
//! - [`PackageRecord`] - an installed package reported by a plugin
//! - [`ServiceRecord`] - a service reported by a platform adapter
//! - [`VulnerabilityRecord`] - a feed entry with affected version ranges
//! - [`VerificationResult`] - outcome of integrity and signature checks
//! - [`Finding`] - a package matched against a vulnerability
//! - [`Report`] - the immutable snapshot handed back by a run
//!
//! # Example
//!
//! ```
//! use secenum::model::{Ecosystem, PackageRecord};
//! use secenum::version::SchemeKind;
//!
//! let pkg = PackageRecord::new(Ecosystem::Debian, "openssl", "3.0.11-1~deb12u2", "local", SchemeKind::Debian);
//! assert!(pkg.version.is_reliable());
//! ```

mod audit;
mod package;
mod report;
mod service;
mod verification;
mod vulnerability;

pub use audit::*;
pub use package::*;
pub use report::*;
pub use service::*;
pub use verification::*;
pub use vulnerability::*;

use serde::{Deserialize, Serialize};

/// Package-management domain with its own naming and versioning rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Debian,
    Npm,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Debian => "debian",
            Ecosystem::Npm => "npm",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Ecosystem::Debian => "Debian",
            Ecosystem::Npm => "NPM",
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debian" | "deb" | "ubuntu" | "apt" => Ok(Ecosystem::Debian),
            "npm" => Ok(Ecosystem::Npm),
            _ => Err(format!("Unknown ecosystem: {}. Use 'debian' or 'npm'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        #[cfg(target_os = "linux")]
        return Platform::Linux;
        #[cfg(target_os = "macos")]
        return Platform::MacOS;
        #[cfg(target_os = "windows")]
        return Platform::Windows;
    }
}

/// Service supervision system a platform adapter speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManager {
    Systemd,
}

impl ServiceManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceManager::Systemd => "systemd",
        }
    }
}
