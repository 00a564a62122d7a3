//! Matches installed packages against vulnerability records.
//!
//! Candidates for a package come from three places, in order: records
//! filed under its exact name, records whose name is a `*` pattern, and
//! records filed under one of its aliases. A candidate becomes a finding
//! when any of its ranges holds for the installed version.
//!
//! Versions are compared with the grammar configured for the ecosystem.
//! When either side only parses lexically the comparison still happens,
//! but the finding is marked [`Confidence::Unreliable`].

pub mod alias;
pub mod feed;

pub use alias::AliasTable;
pub use feed::{load_file, load_remote, parse_cvss_score, parse_feed, LoadedFeed};

use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::{glob_match, Config, IgnoreConfig};
use crate::model::{
    Confidence, ConstraintOp, Ecosystem, Finding, PackageRecord, Version, VerificationOutcome,
    VulnerabilityRecord,
};
use crate::version::SchemeKind;

/// A record with its constraint versions parsed once up front.
struct CompiledRecord {
    record: VulnerabilityRecord,
    ranges: Vec<Vec<(ConstraintOp, Version)>>,
}

pub struct VulnerabilityMatcher {
    records: Vec<CompiledRecord>,
    exact: HashMap<(Ecosystem, String), Vec<usize>>,
    patterns: Vec<usize>,
    aliases: AliasTable,
    ignore: IgnoreConfig,
}

/// Outcome of checking one record's ranges.
struct RangeMatch {
    range: String,
    reliable: bool,
}

impl VulnerabilityMatcher {
    /// Indexes `records`, parsing constraint versions with `scheme_for`.
    pub fn new(
        records: Vec<VulnerabilityRecord>,
        scheme_for: impl Fn(Ecosystem) -> SchemeKind,
    ) -> Self {
        let mut exact: HashMap<(Ecosystem, String), Vec<usize>> = HashMap::new();
        let mut patterns = Vec::new();

        let records: Vec<CompiledRecord> = records
            .into_iter()
            .map(|record| {
                let scheme = scheme_for(record.ecosystem);
                let ranges = record
                    .ranges
                    .iter()
                    .map(|range| {
                        range
                            .0
                            .iter()
                            .map(|c| (c.op, Version::parse(c.version.clone(), scheme)))
                            .collect()
                    })
                    .collect();
                CompiledRecord { record, ranges }
            })
            .collect();

        for (idx, compiled) in records.iter().enumerate() {
            if compiled.record.is_pattern() {
                patterns.push(idx);
            } else {
                exact
                    .entry((compiled.record.ecosystem, alias::normalize(&compiled.record.package)))
                    .or_default()
                    .push(idx);
            }
        }

        debug!(
            records = records.len(),
            patterns = patterns.len(),
            "vulnerability index built"
        );

        Self {
            records,
            exact,
            patterns,
            aliases: AliasTable::new(),
            ignore: IgnoreConfig::default(),
        }
    }

    /// Matcher using the version grammars, aliases and ignore list from
    /// `config`.
    pub fn from_config(records: Vec<VulnerabilityRecord>, config: &Config) -> Self {
        Self::new(records, |eco| config.scheme_for(eco))
            .with_aliases(AliasTable::from_groups(&config.aliases))
            .with_ignore(config.ignore.clone())
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreConfig) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Candidate record indices, each with the alias it was found through.
    fn candidates(&self, package: &PackageRecord) -> Vec<(usize, Option<String>)> {
        let name = alias::normalize(&package.name);
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        if let Some(ids) = self.exact.get(&(package.ecosystem, name.clone())) {
            for id in ids {
                if seen.insert(*id) {
                    out.push((*id, None));
                }
            }
        }

        let aliases = self.aliases.aliases_of(package.ecosystem, &name);

        for id in &self.patterns {
            let record = &self.records[*id].record;
            if record.ecosystem != package.ecosystem {
                continue;
            }
            let pattern = alias::normalize(&record.package);
            if glob_match(&pattern, &name) {
                if seen.insert(*id) {
                    out.push((*id, None));
                }
            } else if let Some(via) = aliases.iter().find(|a| glob_match(&pattern, a)) {
                if seen.insert(*id) {
                    out.push((*id, Some(via.clone())));
                }
            }
        }

        for alias_name in &aliases {
            if let Some(ids) = self.exact.get(&(package.ecosystem, alias_name.clone())) {
                for id in ids {
                    if seen.insert(*id) {
                        out.push((*id, Some(alias_name.clone())));
                    }
                }
            }
        }

        out
    }

    fn match_ranges(installed: &Version, compiled: &CompiledRecord) -> Option<RangeMatch> {
        if compiled.ranges.is_empty() {
            return Some(RangeMatch {
                range: "*".to_string(),
                reliable: installed.is_reliable(),
            });
        }

        compiled
            .ranges
            .iter()
            .zip(&compiled.record.ranges)
            .find_map(|(constraints, written)| {
                let mut reliable = true;
                let holds = constraints.iter().all(|(op, bound)| {
                    let (ordering, exact) = compare(installed, bound);
                    reliable &= exact;
                    op.accepts(ordering)
                });
                holds.then(|| RangeMatch {
                    range: written.to_string(),
                    reliable,
                })
            })
    }

    /// Findings for one package.
    pub fn match_package(
        &self,
        package: &PackageRecord,
        verification: VerificationOutcome,
    ) -> Vec<Finding> {
        if self.ignore.should_ignore_package(&package.name) {
            return Vec::new();
        }

        self.candidates(package)
            .into_iter()
            .filter_map(|(id, via)| {
                let compiled = &self.records[id];
                if self.ignore.should_ignore_vulnerability(&compiled.record.id) {
                    return None;
                }
                let matched = Self::match_ranges(&package.version, compiled)?;

                let name_confidence = if via.is_some() {
                    Confidence::Probable
                } else {
                    Confidence::Exact
                };
                let version_confidence = if matched.reliable {
                    Confidence::Exact
                } else {
                    Confidence::Unreliable
                };

                Some(Finding {
                    package: package.reference(),
                    vulnerability: compiled.record.reference(),
                    confidence: name_confidence.min(version_confidence),
                    verification,
                    matched_range: matched.range,
                    alias: via,
                })
            })
            .collect()
    }

    /// Matches every package in parallel. `outcomes` maps package identity
    /// to its verification outcome.
    pub fn match_all(
        &self,
        packages: &[PackageRecord],
        outcomes: &HashMap<String, VerificationOutcome>,
    ) -> Vec<Finding> {
        let findings: Vec<Finding> = packages
            .par_iter()
            .flat_map_iter(|package| {
                let verification = outcomes
                    .get(&package.identity())
                    .copied()
                    .unwrap_or(VerificationOutcome::SignatureMissing);
                self.match_package(package, verification)
            })
            .collect();

        info!(
            packages = packages.len(),
            records = self.records.len(),
            findings = findings.len(),
            "matching finished"
        );
        findings
    }
}

/// Orders `installed` against `bound`. The flag is false when the
/// ordering had to fall back to plain string comparison.
fn compare(installed: &Version, bound: &Version) -> (Ordering, bool) {
    if installed.is_reliable() && bound.is_reliable() {
        if let Some(ordering) = installed.key.compare(&bound.key) {
            return (ordering, true);
        }
    }
    (installed.raw.cmp(&bound.raw), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Severity, VersionRange};

    fn record(id: &str, ecosystem: Ecosystem, package: &str, ranges: &[&[&str]]) -> VulnerabilityRecord {
        VulnerabilityRecord {
            id: id.to_string(),
            ecosystem,
            package: package.to_string(),
            ranges: ranges
                .iter()
                .map(|r| VersionRange(r.iter().map(|c| c.parse().unwrap()).collect()))
                .collect(),
            score: Some(7.5),
            severity: Severity::High,
            description: None,
            fixed_version: None,
        }
    }

    fn deb(name: &str, version: &str) -> PackageRecord {
        PackageRecord::new(Ecosystem::Debian, name, version, "local", SchemeKind::Debian)
    }

    fn matcher(records: Vec<VulnerabilityRecord>) -> VulnerabilityMatcher {
        VulnerabilityMatcher::new(records, SchemeKind::default_for)
    }

    #[test]
    fn test_epoch_range_boundaries() {
        let m = matcher(vec![record(
            "CVE-2024-0001",
            Ecosystem::Debian,
            "libfoo",
            &[&[">= 1:2.0-1", "< 1:3.0-1"]],
        )]);

        let inside = m.match_package(&deb("libfoo", "1:2.5-3ubuntu2"), VerificationOutcome::Verified);
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].confidence, Confidence::Exact);
        assert_eq!(inside[0].matched_range, ">= 1:2.0-1, < 1:3.0-1");

        assert!(m
            .match_package(&deb("libfoo", "1:3.0-1"), VerificationOutcome::Verified)
            .is_empty());
        // No epoch means epoch 0, far below 1:2.0-1.
        assert!(m
            .match_package(&deb("libfoo", "2.5-1"), VerificationOutcome::Verified)
            .is_empty());
    }

    #[test]
    fn test_tilde_sorts_before_release() {
        let m = matcher(vec![record(
            "CVE-2023-5678",
            Ecosystem::Debian,
            "openssl",
            &[&["< 3.0.11-1~deb12u2"]],
        )]);
        assert_eq!(
            m.match_package(&deb("openssl", "3.0.11-1~deb12u1"), VerificationOutcome::Verified)
                .len(),
            1
        );
        assert!(m
            .match_package(&deb("openssl", "3.0.11-1"), VerificationOutcome::Verified)
            .is_empty());
    }

    #[test]
    fn test_any_range_matches() {
        let m = matcher(vec![record(
            "GHSA-1",
            Ecosystem::Npm,
            "lodash",
            &[&["< 4.17.12"], &[">= 5.0.0", "< 5.0.3"]],
        )]);
        let pkg = |v: &str| PackageRecord::new(Ecosystem::Npm, "lodash", v, "registry.npmjs.org", SchemeKind::Semver);

        assert_eq!(m.match_package(&pkg("4.17.11"), VerificationOutcome::SignatureMissing).len(), 1);
        assert_eq!(m.match_package(&pkg("5.0.1"), VerificationOutcome::SignatureMissing).len(), 1);
        assert!(m.match_package(&pkg("4.17.21"), VerificationOutcome::SignatureMissing).is_empty());
    }

    #[test]
    fn test_empty_ranges_affect_every_version() {
        let m = matcher(vec![record("MAL-1", Ecosystem::Npm, "event-stream", &[])]);
        let pkg = PackageRecord::new(Ecosystem::Npm, "event-stream", "3.3.6", "registry.npmjs.org", SchemeKind::Semver);
        let findings = m.match_package(&pkg, VerificationOutcome::SignatureMissing);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].matched_range, "*");
    }

    #[test]
    fn test_pattern_records() {
        let m = matcher(vec![record(
            "CVE-2024-9999",
            Ecosystem::Debian,
            "linux-image-*",
            &[&["< 6.1.0-20"]],
        )]);
        let findings = m.match_package(&deb("linux-image-6.1.0-13-amd64", "6.1.0-13"), VerificationOutcome::Verified);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Exact);
        assert!(m.match_package(&deb("bash", "5.0-1"), VerificationOutcome::Verified).is_empty());
    }

    #[test]
    fn test_alias_match_is_probable() {
        let mut aliases = AliasTable::new();
        aliases.add_group(Ecosystem::Debian, ["openssl", "libssl3"]);
        let m = matcher(vec![record("CVE-2023-5678", Ecosystem::Debian, "openssl", &[&["< 3.0.12-1"]])])
            .with_aliases(aliases);

        let findings = m.match_package(&deb("libssl3", "3.0.11-1"), VerificationOutcome::Verified);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Probable);
        assert_eq!(findings[0].alias.as_deref(), Some("openssl"));
    }

    #[test]
    fn test_lexical_fallback_is_unreliable() {
        let m = matcher(vec![record("CVE-2024-0002", Ecosystem::Debian, "weird", &[&["< 2.0"]])]);
        // Upstream must start with a digit, so this only parses lexically.
        let findings = m.match_package(&deb("weird", "1.0 beta"), VerificationOutcome::Verified);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Unreliable);
    }

    #[test]
    fn test_ecosystems_do_not_cross() {
        let m = matcher(vec![record("GHSA-2", Ecosystem::Npm, "bash", &[])]);
        assert!(m.match_package(&deb("bash", "5.2-1"), VerificationOutcome::Verified).is_empty());
    }

    #[test]
    fn test_ignore_list() {
        let ignore = IgnoreConfig {
            packages: vec!["bash".to_string()],
            vulnerabilities: vec!["CVE-2".to_string()],
        };
        let m = matcher(vec![
            record("CVE-1", Ecosystem::Debian, "bash", &[]),
            record("CVE-2", Ecosystem::Debian, "zlib1g", &[]),
            record("CVE-3", Ecosystem::Debian, "zlib1g", &[]),
        ])
        .with_ignore(ignore);

        assert!(m.match_package(&deb("bash", "5.2-1"), VerificationOutcome::Verified).is_empty());
        let zlib = m.match_package(&deb("zlib1g", "1:1.2.13-1"), VerificationOutcome::Verified);
        assert_eq!(zlib.len(), 1);
        assert_eq!(zlib[0].vulnerability.id, "CVE-3");
    }

    #[test]
    fn test_match_all_carries_verification() {
        let m = matcher(vec![record("CVE-1", Ecosystem::Debian, "bash", &[&["< 6.0"]])]);
        let packages = vec![deb("bash", "5.2.15-2+b2"), deb("zsh", "5.9-4")];
        let mut outcomes = HashMap::new();
        outcomes.insert(packages[0].identity(), VerificationOutcome::HashMismatch);

        let findings = m.match_all(&packages, &outcomes);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].verification, VerificationOutcome::HashMismatch);
    }
}
