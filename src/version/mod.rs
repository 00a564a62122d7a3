//! Version grammars.
//!
//! Each ecosystem orders versions with its own grammar. The grammar is a
//! [`SchemeKind`] picked per ecosystem in the configuration, so a
//! distribution with different rules can be added without touching the
//! matcher.
//!
//! | Scheme | Grammar | Default for |
//! |--------|---------|-------------|
//! | `debian` | `[epoch:]upstream[-revision]`, dpkg ordering | Debian |
//! | `semver` | Semantic Versioning 2.0 | npm |
//! | `lexical` | byte-wise string order | fallback |
//!
//! # Example
//!
//! ```
//! use secenum::version::SchemeKind;
//!
//! let a = SchemeKind::Debian.parse("1:2.5-3ubuntu2").unwrap();
//! let b = SchemeKind::Debian.parse("1:3.0-1").unwrap();
//! assert_eq!(a.compare(&b), Some(std::cmp::Ordering::Less));
//! ```

mod debian;
mod semantic;

pub use debian::{compare_fragments, DebianVersion};
pub use semantic::parse_semver;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::VersionError;
use crate::model::Ecosystem;

/// Parsed ordering key of a version string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "value", rename_all = "lowercase")]
pub enum VersionKey {
    Debian(DebianVersion),
    Semver(semver::Version),
    Lexical(String),
}

impl VersionKey {
    /// Orders two keys of the same scheme. Keys of different schemes are
    /// not comparable.
    pub fn compare(&self, other: &VersionKey) -> Option<Ordering> {
        match (self, other) {
            (VersionKey::Debian(a), VersionKey::Debian(b)) => Some(a.cmp(b)),
            (VersionKey::Semver(a), VersionKey::Semver(b)) => Some(a.cmp(b)),
            (VersionKey::Lexical(a), VersionKey::Lexical(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeKind {
    Debian,
    Semver,
    Lexical,
}

impl SchemeKind {
    pub fn default_for(ecosystem: Ecosystem) -> Self {
        match ecosystem {
            Ecosystem::Debian => SchemeKind::Debian,
            Ecosystem::Npm => SchemeKind::Semver,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemeKind::Debian => "debian",
            SchemeKind::Semver => "semver",
            SchemeKind::Lexical => "lexical",
        }
    }

    pub fn parse(&self, raw: &str) -> Result<VersionKey, VersionError> {
        match self {
            SchemeKind::Debian => DebianVersion::parse(raw).map(VersionKey::Debian),
            SchemeKind::Semver => parse_semver(raw).map(VersionKey::Semver),
            SchemeKind::Lexical => Ok(VersionKey::Lexical(raw.trim().to_string())),
        }
    }
}

impl std::str::FromStr for SchemeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debian" | "dpkg" => Ok(SchemeKind::Debian),
            "semver" => Ok(SchemeKind::Semver),
            "lexical" => Ok(SchemeKind::Lexical),
            _ => Err(format!(
                "Unknown version scheme: {}. Use 'debian', 'semver' or 'lexical'",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_scheme_keys_are_incomparable() {
        let deb = SchemeKind::Debian.parse("1.0-1").unwrap();
        let lex = SchemeKind::Lexical.parse("1.0-1").unwrap();
        assert_eq!(deb.compare(&lex), None);
    }

    #[test]
    fn test_default_scheme_per_ecosystem() {
        assert_eq!(SchemeKind::default_for(Ecosystem::Debian), SchemeKind::Debian);
        assert_eq!(SchemeKind::default_for(Ecosystem::Npm), SchemeKind::Semver);
    }

    #[test]
    fn test_key_serde_round_trip() {
        for (scheme, raw) in [
            (SchemeKind::Debian, "2:1.4~rc1-0ubuntu3"),
            (SchemeKind::Semver, "4.17.21"),
            (SchemeKind::Lexical, "weird version"),
        ] {
            let key = scheme.parse(raw).unwrap();
            let json = serde_json::to_string(&key).unwrap();
            let back: VersionKey = serde_json::from_str(&json).unwrap();
            assert_eq!(back.compare(&key), Some(Ordering::Equal));
        }
    }
}
