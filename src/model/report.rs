use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    PackageRecord, PackageRef, PolicyDescriptor, ServiceRecord, Severity,
    VerificationOutcome, VerificationResult, VulnerabilityRef,
};

/// How much a finding can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// A version could only be compared lexically.
    Unreliable,
    /// The package name matched through the alias table.
    Probable,
    Exact,
}

/// A package matched against a vulnerability record of the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub package: PackageRef,
    pub vulnerability: VulnerabilityRef,
    pub confidence: Confidence,
    /// Verification outcome of the package when it was matched.
    pub verification: VerificationOutcome,
    pub matched_range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A recoverable problem recorded during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Plugin or component the warning is about.
    pub source: String,
    pub message: String,
}

impl Warning {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Logical processors.
    pub count: usize,
}

/// Bytes, as reported by the kernel at collection time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub kernel: String,
    pub distribution: String,
    pub distribution_version: String,
    pub architecture: String,
    #[serde(default)]
    pub cpu: CpuInfo,
    #[serde(default)]
    pub memory: MemoryInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_time: Option<DateTime<Utc>>,
    /// Account names from the passwd database.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersion {
    pub name: String,
    pub version: String,
    /// Ecosystem or service manager the plugin covers.
    pub capability: String,
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Discovering,
    Enumerating,
    Verifying,
    Matching,
    Finalizing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub host: HostIdentity,
    pub plugins: Vec<PluginVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_version: Option<String>,
    pub state: RunState,
    pub run_cancelled: bool,
    /// The audit trail or the stored snapshot could not be written.
    pub audit_incomplete: bool,
}

impl RunMetadata {
    pub fn new(run_id: Uuid, host: HostIdentity) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            host,
            plugins: Vec::new(),
            feed_version: None,
            state: RunState::Idle,
            run_cancelled: false,
            audit_incomplete: false,
        }
    }
}

/// Immutable snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_metadata: RunMetadata,
    pub packages: Vec<PackageRecord>,
    pub services: Vec<ServiceRecord>,
    #[serde(default)]
    pub security_policy: Vec<PolicyDescriptor>,
    pub verification: Vec<VerificationResult>,
    pub findings: Vec<Finding>,
    pub warnings: Vec<Warning>,
}

impl Report {
    pub fn new(run_metadata: RunMetadata) -> Self {
        Self {
            run_metadata,
            packages: Vec::new(),
            services: Vec::new(),
            security_policy: Vec::new(),
            verification: Vec::new(),
            findings: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Puts every collection in its canonical order so the snapshot does
    /// not depend on task completion order.
    pub(crate) fn canonicalize(&mut self) {
        self.packages.sort_by(|a, b| {
            (a.ecosystem, &a.name, &a.version.raw, &a.origin)
                .cmp(&(b.ecosystem, &b.name, &b.version.raw, &b.origin))
        });
        self.services.sort_by(|a, b| a.name.cmp(&b.name));
        self.verification.sort_by(|a, b| a.subject.cmp(&b.subject));
        self.findings.sort_by(|a, b| {
            (
                &a.package.name,
                &a.vulnerability.id,
                a.package.ecosystem,
                &a.package.version,
                &a.package.origin,
            )
                .cmp(&(
                    &b.package.name,
                    &b.vulnerability.id,
                    b.package.ecosystem,
                    &b.package.version,
                    &b.package.origin,
                ))
        });
    }

    pub fn run_cancelled(&self) -> bool {
        self.run_metadata.run_cancelled
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.vulnerability.severity).max()
    }

    /// True when any finding is at or above `threshold`. The CLI derives
    /// its exit status from this.
    pub fn exceeds_threshold(&self, threshold: Severity) -> bool {
        self.findings
            .iter()
            .any(|f| f.vulnerability.severity >= threshold)
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.vulnerability.severity == severity)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ecosystem, Evidence, SignatureFault, Subject};
    use crate::version::SchemeKind;

    fn finding(name: &str, id: &str, severity: Severity) -> Finding {
        Finding {
            package: PackageRef {
                ecosystem: Ecosystem::Debian,
                name: name.to_string(),
                version: "1.0-1".to_string(),
                origin: "local".to_string(),
            },
            vulnerability: VulnerabilityRef {
                id: id.to_string(),
                severity,
                score: None,
                fixed_version: None,
            },
            confidence: Confidence::Exact,
            verification: VerificationOutcome::Verified,
            matched_range: "< 2.0".to_string(),
            alias: None,
        }
    }

    fn sample_report() -> Report {
        let mut report = Report::new(RunMetadata::new(Uuid::new_v4(), HostIdentity::default()));
        report.packages.push(PackageRecord::new(
            Ecosystem::Debian,
            "zlib1g",
            "1:1.2.13.dfsg-1",
            "local",
            SchemeKind::Debian,
        ));
        report.findings.push(finding("zlib1g", "CVE-2023-45853", Severity::Critical));
        report.findings.push(finding("bash", "CVE-2019-18276", Severity::High));
        report.verification.push(VerificationResult::new(
            Subject::Package("debian/zlib1g@1:1.2.13.dfsg-1#local".to_string()),
            VerificationOutcome::SignatureInvalid(SignatureFault::BadSignature),
            Evidence::default(),
        ));
        report.warnings.push(Warning::new("npm", "timed out after 30s"));
        report
    }

    #[test]
    fn test_report_json_round_trip() {
        let report = sample_report();
        let json = report.to_json().unwrap();
        let back = Report::from_json(&json).unwrap();

        assert_eq!(back.findings, report.findings);
        assert_eq!(back.verification, report.verification);
        assert_eq!(back.warnings, report.warnings);
        assert_eq!(back, report);
    }

    #[test]
    fn test_report_top_level_fields() {
        let json = serde_json::to_value(sample_report()).unwrap();
        for field in ["packages", "services", "verification", "findings", "warnings", "run_metadata"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_canonicalize_orders_findings() {
        let mut report = sample_report();
        report.canonicalize();
        let names: Vec<_> = report.findings.iter().map(|f| f.package.name.as_str()).collect();
        assert_eq!(names, vec!["bash", "zlib1g"]);
    }

    #[test]
    fn test_canonicalize_separates_ecosystems() {
        let mut report = Report::new(RunMetadata::new(Uuid::new_v4(), HostIdentity::default()));
        let mut npm = finding("ws", "CVE-2024-37890", Severity::High);
        npm.package.ecosystem = Ecosystem::Npm;
        report.findings.push(npm);
        report.findings.push(finding("ws", "CVE-2024-37890", Severity::High));

        report.canonicalize();
        let ecosystems: Vec<_> = report.findings.iter().map(|f| f.package.ecosystem).collect();
        assert_eq!(ecosystems, vec![Ecosystem::Debian, Ecosystem::Npm]);
    }

    #[test]
    fn test_exceeds_threshold() {
        let report = sample_report();
        assert!(report.exceeds_threshold(Severity::Critical));
        assert!(report.exceeds_threshold(Severity::Low));

        let mut clean = sample_report();
        clean.findings.retain(|f| f.vulnerability.severity < Severity::Critical);
        assert!(!clean.exceeds_threshold(Severity::Critical));
        assert_eq!(clean.highest_severity(), Some(Severity::High));
    }
}
