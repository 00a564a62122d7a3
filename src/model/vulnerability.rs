use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::Ecosystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// CVSS base score bands.
    pub fn from_score(score: f32) -> Self {
        match score {
            s if s >= 9.0 => Severity::Critical,
            s if s >= 7.0 => Severity::High,
            s if s >= 4.0 => Severity::Medium,
            s if s > 0.0 => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" | "moderate" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "unknown" | "none" => Ok(Severity::Unknown),
            _ => Err(format!(
                "Unknown severity: {}. Use 'critical', 'high', 'medium', 'low' or 'unknown'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ConstraintOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintOp::Lt => "<",
            ConstraintOp::Le => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Ge => ">=",
            ConstraintOp::Eq => "=",
            ConstraintOp::Ne => "!=",
        }
    }

    /// Whether `ordering` (installed compared to the constraint version)
    /// satisfies this operator.
    pub fn accepts(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            ConstraintOp::Lt => ordering == Less,
            ConstraintOp::Le => ordering != Greater,
            ConstraintOp::Gt => ordering == Greater,
            ConstraintOp::Ge => ordering != Less,
            ConstraintOp::Eq => ordering == Equal,
            ConstraintOp::Ne => ordering != Equal,
        }
    }
}

/// One `(operator, version)` bound, written `">= 1:2.0-1"` in feeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub op: ConstraintOp,
    pub version: String,
}

impl FromStr for Constraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Two-character operators first so "<=" is not read as "<".
        let (op, rest) = if let Some(rest) = s.strip_prefix("<=") {
            (ConstraintOp::Le, rest)
        } else if let Some(rest) = s.strip_prefix(">=") {
            (ConstraintOp::Ge, rest)
        } else if let Some(rest) = s.strip_prefix("!=") {
            (ConstraintOp::Ne, rest)
        } else if let Some(rest) = s.strip_prefix("==") {
            (ConstraintOp::Eq, rest)
        } else if let Some(rest) = s.strip_prefix("<<") {
            // dpkg spelling of strict less-than
            (ConstraintOp::Lt, rest)
        } else if let Some(rest) = s.strip_prefix(">>") {
            (ConstraintOp::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (ConstraintOp::Lt, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (ConstraintOp::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (ConstraintOp::Eq, rest)
        } else {
            return Err(format!("constraint `{}` has no operator", s));
        };

        let version = rest.trim();
        if version.is_empty() || version.contains(char::is_whitespace) {
            return Err(format!("constraint `{}` has no usable version", s));
        }

        Ok(Constraint {
            op,
            version: version.to_string(),
        })
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}

impl Serialize for Constraint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Conjunction of constraints; all must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionRange(pub Vec<Constraint>);

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("*");
        }
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(", "))
    }
}

/// A vulnerability feed entry. Loaded read-only per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub id: String,
    pub ecosystem: Ecosystem,
    /// Package name, or a pattern with `*` wildcards.
    pub package: String,
    /// Any range matching makes the package affected. Empty means every
    /// version is affected.
    #[serde(default)]
    pub ranges: Vec<VersionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
}

impl VulnerabilityRecord {
    pub fn reference(&self) -> VulnerabilityRef {
        VulnerabilityRef {
            id: self.id.clone(),
            severity: self.severity,
            score: self.score,
            fixed_version: self.fixed_version.clone(),
        }
    }

    pub fn is_pattern(&self) -> bool {
        self.package.contains('*')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRef {
    pub id: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
}
