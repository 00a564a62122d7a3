use crate::model::{
    Confidence, PolicyDescriptor, Report, Severity, Subject, VerificationOutcome,
};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct PackageRow {
    #[tabled(rename = "Ecosystem")]
    ecosystem: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Origin")]
    origin: String,
    #[tabled(rename = "Verification")]
    verification: String,
}

#[derive(Tabled)]
struct FindingRow {
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Fixed In")]
    fixed_in: String,
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "Service")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Hardening")]
    hardening: String,
}

#[derive(Tabled)]
struct WarningRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Message")]
    message: String,
}

pub fn print_cli_table(report: &Report) -> Result<()> {
    let meta = &report.run_metadata;
    println!();
    println!(
        "Run {} on {} ({} {}) finished at: {}",
        meta.run_id,
        meta.host.hostname,
        meta.host.distribution,
        meta.host.distribution_version,
        meta.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let host = &meta.host;
    if host.cpu.count > 0 || host.memory.total_bytes > 0 {
        println!(
            "Host: {} ({} CPUs), {:.1} GiB memory, {} users",
            host.cpu.model.as_deref().unwrap_or("unknown CPU"),
            host.cpu.count,
            host.memory.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            host.users.len()
        );
    }
    if meta.run_cancelled {
        println!("\x1b[33mRun was cancelled; results are partial.\x1b[0m");
    }
    println!();

    print_packages(report);
    print_findings(report);
    print_services(report);
    for policy in &report.security_policy {
        print_policy(policy);
    }
    print_warnings(report);

    println!();
    print_summary(report);

    Ok(())
}

fn print_packages(report: &Report) {
    if report.packages.is_empty() {
        println!("No packages found.");
        return;
    }

    let outcomes: HashMap<&str, VerificationOutcome> = report
        .verification
        .iter()
        .filter_map(|r| match &r.subject {
            Subject::Package(id) => Some((id.as_str(), r.outcome)),
            Subject::Repository(_) => None,
        })
        .collect();

    println!("Found {} packages:", report.packages.len());
    println!();

    let rows: Vec<PackageRow> = report
        .packages
        .iter()
        .map(|p| PackageRow {
            ecosystem: p.ecosystem.display_name().to_string(),
            name: truncate(&p.name, 40),
            version: truncate(&p.version.raw, 30),
            origin: truncate(&p.origin, 40),
            verification: outcomes
                .get(p.identity().as_str())
                .map(format_outcome)
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

fn print_findings(report: &Report) {
    if report.findings.is_empty() {
        return;
    }

    println!();
    println!("Found {} vulnerabilities:", report.findings.len());
    println!();

    let mut findings: Vec<_> = report.findings.iter().collect();
    findings.sort_by(|a, b| b.vulnerability.severity.cmp(&a.vulnerability.severity));

    let rows: Vec<FindingRow> = findings
        .iter()
        .map(|f| FindingRow {
            severity: format_severity(&f.vulnerability.severity),
            package: match &f.alias {
                Some(alias) => format!("{} (as {})", f.package, alias),
                None => f.package.to_string(),
            },
            id: f.vulnerability.id.clone(),
            range: truncate(&f.matched_range, 40),
            confidence: format_confidence(f.confidence),
            fixed_in: f
                .vulnerability
                .fixed_version
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

fn print_services(report: &Report) {
    if report.services.is_empty() {
        return;
    }

    println!();
    println!("Found {} services:", report.services.len());
    println!();

    let rows: Vec<ServiceRow> = report
        .services
        .iter()
        .map(|s| ServiceRow {
            name: truncate(&s.name, 40),
            state: s.state.as_str().to_string(),
            user: s
                .security_context
                .user
                .clone()
                .unwrap_or_else(|| "root".to_string()),
            hardening: format!("{}%", s.hardening.score()),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

fn print_policy(policy: &PolicyDescriptor) {
    let flag = |on: bool| if on { "yes" } else { "no" };
    println!();
    println!("Security policy ({}):", policy.source);
    println!("  SELinux:             {}", flag(policy.selinux_enabled));
    println!("  AppArmor:            {}", flag(policy.apparmor_enabled));
    println!("  Firewall active:     {}", flag(policy.firewall_active));
    println!("  SSH running:         {}", flag(policy.ssh_running));
    println!("  Root login disabled: {}", flag(policy.root_login_disabled));
}

fn print_warnings(report: &Report) {
    if report.warnings.is_empty() {
        return;
    }

    println!();
    println!("{} warnings:", report.warnings.len());
    println!();

    let rows: Vec<WarningRow> = report
        .warnings
        .iter()
        .map(|w| WarningRow {
            source: w.source.clone(),
            message: truncate(&w.message, 80),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

fn format_severity(severity: &Severity) -> String {
    match severity {
        Severity::Critical => "\x1b[31mCRITICAL\x1b[0m".to_string(),
        Severity::High => "\x1b[91mHIGH\x1b[0m".to_string(),
        Severity::Medium => "\x1b[33mMEDIUM\x1b[0m".to_string(),
        Severity::Low => "\x1b[32mLOW\x1b[0m".to_string(),
        Severity::Unknown => "UNKNOWN".to_string(),
    }
}

fn format_outcome(outcome: &VerificationOutcome) -> String {
    match outcome {
        VerificationOutcome::Verified => "\x1b[32mverified\x1b[0m".to_string(),
        VerificationOutcome::SignatureMissing => "unsigned".to_string(),
        other => format!("\x1b[31m{}\x1b[0m", other.label()),
    }
}

fn format_confidence(confidence: Confidence) -> String {
    match confidence {
        Confidence::Exact => "exact".to_string(),
        Confidence::Probable => "probable".to_string(),
        Confidence::Unreliable => "\x1b[33munreliable\x1b[0m".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

fn print_summary(report: &Report) {
    let mut by_ecosystem = BTreeMap::new();
    for pkg in &report.packages {
        *by_ecosystem.entry(pkg.ecosystem).or_insert(0usize) += 1;
    }

    println!("Summary:");
    println!("  Total packages: {}", report.packages.len());
    if by_ecosystem.len() > 1 {
        let parts: Vec<String> = by_ecosystem
            .iter()
            .map(|(e, c)| format!("{} {}", c, e.display_name()))
            .collect();
        println!("  By ecosystem: {}", parts.join(", "));
    }

    let failed = report
        .verification
        .iter()
        .filter(|r| {
            !matches!(
                r.outcome,
                VerificationOutcome::Verified | VerificationOutcome::SignatureMissing
            )
        })
        .count();
    if failed > 0 {
        println!("  Failed verification: {}", failed);
    }

    if !report.findings.is_empty() {
        println!(
            "  Vulnerabilities: {} critical, {} high, {} medium, {} low",
            report.count_by_severity(Severity::Critical),
            report.count_by_severity(Severity::High),
            report.count_by_severity(Severity::Medium),
            report.count_by_severity(Severity::Low)
        );
    }

    if !report.services.is_empty() {
        let as_root = report
            .services
            .iter()
            .filter(|s| s.hardening.runs_as_root)
            .count();
        println!("  Services: {} ({} running as root)", report.services.len(), as_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("openssl", 10), "openssl");
        assert_eq!(truncate("libreoffice-common", 10), "libreof...");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
