//! Runs one enumeration pass end to end.
//!
//! ```text
//! Idle -> Discovering -> Enumerating -> Verifying -> Matching -> Finalizing -> Complete
//! ```
//!
//! Every plugin call runs as its own task, bounded by a semaphore, under a
//! timeout and raced against the run's cancellation token. A plugin that
//! fails or times out costs the run a warning, not the run itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EnumerationError, OrchestrationError};
use crate::matcher::{LoadedFeed, VulnerabilityMatcher};
use crate::model::{
    AuditEvent, AuditOutcome, DigestSource, Finding, PackageRecord, Platform, PolicyDescriptor,
    RepositoryRecord, Report, RunMetadata, RunState, ServiceRecord, Subject, VerificationOutcome,
    Warning,
};
use crate::platform;
use crate::plugin::{Enumerable, Enumeration, PlatformAdapter};
use crate::registry::PluginRegistry;
use crate::store::{AuditSink, SecureStore, DIGESTS_KEY};
use crate::verify::{TrustStore, Verifier};

const ACTOR: &str = "orchestrator";

/// What a run collects beyond the package inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Query platform adapters for services and the security policy.
    pub include_services: bool,
    /// Match packages against the loaded feed.
    pub match_vulnerabilities: bool,
}

impl RunOptions {
    /// Inventory and verification, no matching.
    pub fn scan() -> Self {
        Self {
            include_services: true,
            match_vulnerabilities: false,
        }
    }

    /// Package verification and matching; `full` adds services and policy.
    pub fn assess(full: bool) -> Self {
        Self {
            include_services: full,
            match_vulnerabilities: true,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::assess(true)
    }
}

/// Data returned by one plugin task.
enum Collected {
    Packages {
        packages: Enumeration<PackageRecord>,
        repositories: Result<Enumeration<RepositoryRecord>, EnumerationError>,
    },
    Services {
        services: Enumeration<ServiceRecord>,
        policy: Result<PolicyDescriptor, EnumerationError>,
    },
}

enum TaskFailure {
    Failed(EnumerationError),
    TimedOut(Duration),
    Cancelled,
}

struct TaskOutcome {
    plugin: String,
    result: Result<Collected, TaskFailure>,
}

/// Everything gathered during the enumerating stage.
#[derive(Default)]
struct Gathered {
    packages: Vec<PackageRecord>,
    repositories: Vec<RepositoryRecord>,
    services: Vec<ServiceRecord>,
    policy: Vec<PolicyDescriptor>,
    warnings: Vec<Warning>,
    failures: Vec<String>,
    cancelled: bool,
}

impl Gathered {
    fn is_empty(&self) -> bool {
        self.packages.is_empty()
            && self.repositories.is_empty()
            && self.services.is_empty()
            && self.policy.is_empty()
    }

    fn notes<T>(&mut self, plugin: &str, enumeration: &Enumeration<T>) {
        for note in &enumeration.notes {
            self.warnings.push(Warning::new(plugin, note.clone()));
        }
    }
}

pub struct Orchestrator {
    registry: Arc<PluginRegistry>,
    config: Config,
    platform: Platform,
    trust: Arc<TrustStore>,
    matcher: Option<Arc<VulnerabilityMatcher>>,
    feed_revision: Option<String>,
    feed_notes: Vec<String>,
    store: Option<Arc<SecureStore>>,
    cancel: Mutex<CancellationToken>,
}

impl Orchestrator {
    pub fn new(registry: PluginRegistry, config: Config) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            platform: Platform::current(),
            trust: Arc::new(TrustStore::default()),
            matcher: None,
            feed_revision: None,
            feed_notes: Vec::new(),
            store: None,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_trust_store(mut self, trust: Arc<TrustStore>) -> Self {
        self.trust = trust;
        self
    }

    /// Indexes the feed for matching. Skipped feed records surface as
    /// warnings in every report.
    pub fn with_feed(mut self, feed: LoadedFeed) -> Self {
        self.matcher = Some(Arc::new(VulnerabilityMatcher::from_config(
            feed.records,
            &self.config,
        )));
        self.feed_revision = feed.revision;
        self.feed_notes = feed.skipped;
        self
    }

    pub fn with_store(mut self, store: Arc<SecureStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Token that cancels the current run, or the next one if none is in
    /// progress. A run that observed a fired token replaces it on return,
    /// so fetch a new token before each later run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn rearm(&self, fired: &CancellationToken) {
        let mut current = self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.is_cancelled() && fired.is_cancelled() {
            *current = CancellationToken::new();
        }
    }

    fn audit(&self, action: impl Into<String>, outcome: AuditOutcome, detail: Option<String>) {
        let Some(store) = &self.store else {
            return;
        };
        let mut event = AuditEvent::new(ACTOR, action, outcome);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        let _ = store.record(&event);
    }

    fn advance(&self, metadata: &mut RunMetadata, state: RunState) {
        debug!(run_id = %metadata.run_id, from = ?metadata.state, to = ?state, "run state");
        metadata.state = state;
    }

    pub async fn run(&self, options: RunOptions) -> Result<Report, OrchestrationError> {
        let run_id = Uuid::new_v4();
        let mut metadata = RunMetadata::new(run_id, platform::host_identity(&self.config.root));
        metadata.feed_version = self.feed_revision.clone();
        let audit_baseline = self.store.as_ref().map(|s| s.failures()).unwrap_or(0);
        let cancel = self.cancellation_token();

        info!(%run_id, ?options, "run started");
        self.audit(format!("run {} started", run_id), AuditOutcome::Success, None);

        self.advance(&mut metadata, RunState::Discovering);
        let mut resolved = self.registry.resolve(self.platform).await;
        if !options.include_services {
            resolved.adapters.clear();
        }
        if resolved.is_empty() {
            self.advance(&mut metadata, RunState::Failed);
            self.audit(
                format!("run {} failed", run_id),
                AuditOutcome::Failure,
                Some("no applicable plugin".to_string()),
            );
            return Err(OrchestrationError::NoApplicablePlugin {
                platform: self.platform,
            });
        }
        metadata.plugins = resolved.versions();
        let plugin_count = resolved.len();

        self.advance(&mut metadata, RunState::Enumerating);
        let gathered = self.enumerate(resolved.packages, resolved.adapters, &cancel).await;

        if gathered.is_empty() && !gathered.cancelled && gathered.failures.len() == plugin_count {
            self.advance(&mut metadata, RunState::Failed);
            self.audit(
                format!("run {} failed", run_id),
                AuditOutcome::Failure,
                Some("every plugin failed".to_string()),
            );
            return Err(OrchestrationError::NoData {
                failures: gathered.failures,
            });
        }

        let mut report = Report::new(metadata);
        report.packages = gathered.packages;
        report.services = gathered.services;
        report.security_policy = gathered.policy;
        report.warnings = gathered.warnings;
        report
            .warnings
            .extend(self.feed_notes.iter().map(|n| Warning::new("feed", n.clone())));

        let mut cancelled = gathered.cancelled || cancel.is_cancelled();

        if !cancelled {
            self.advance(&mut report.run_metadata, RunState::Verifying);
            match self.verify(&gathered.repositories, &mut report, &cancel).await {
                Some(outcomes) => {
                    if options.match_vulnerabilities {
                        self.advance(&mut report.run_metadata, RunState::Matching);
                        self.match_findings(&mut report, outcomes).await;
                    }
                }
                None => cancelled = true,
            }
        }

        if cancelled {
            warn!(%run_id, "run cancelled, verification and matching skipped");
            report.warnings.push(Warning::new(
                ACTOR,
                "run cancelled: verification and matching were skipped",
            ));
            report.verification.clear();
            report.findings.clear();
            report.run_metadata.run_cancelled = true;
        }

        self.advance(&mut report.run_metadata, RunState::Finalizing);
        report.canonicalize();
        self.finalize(&mut report, audit_baseline);
        self.rearm(&cancel);
        Ok(report)
    }

    /// Fans every plugin call out onto its own task and collects the results.
    async fn enumerate(
        &self,
        packages: Vec<Arc<dyn Enumerable>>,
        adapters: Vec<Arc<dyn PlatformAdapter>>,
        cancel: &CancellationToken,
    ) -> Gathered {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_plugins.max(1)));
        let timeout = self.config.plugin_timeout();
        let mut tasks = JoinSet::new();

        for plugin in packages {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = plugin.name().to_string();
                let result = guarded(&semaphore, &cancel, timeout, async {
                    let packages = plugin.list_packages().await?;
                    let repositories = plugin.list_repositories().await;
                    Ok::<_, EnumerationError>(Collected::Packages {
                        packages,
                        repositories,
                    })
                })
                .await;
                TaskOutcome {
                    plugin: name,
                    result,
                }
            });
        }

        for adapter in adapters {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = adapter.name().to_string();
                let result = guarded(&semaphore, &cancel, timeout, async {
                    let services = adapter.list_services().await?;
                    let policy = adapter.security_policy_snapshot().await;
                    Ok::<_, EnumerationError>(Collected::Services { services, policy })
                })
                .await;
                TaskOutcome {
                    plugin: name,
                    result,
                }
            });
        }

        let mut gathered = Gathered::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "plugin task aborted");
                    gathered.failures.push(format!("plugin task aborted: {}", e));
                    gathered
                        .warnings
                        .push(Warning::new(ACTOR, format!("plugin task aborted: {}", e)));
                    continue;
                }
            };
            self.absorb(&mut gathered, outcome);
        }

        info!(
            packages = gathered.packages.len(),
            repositories = gathered.repositories.len(),
            services = gathered.services.len(),
            failures = gathered.failures.len(),
            "enumeration finished"
        );
        gathered
    }

    fn absorb(&self, gathered: &mut Gathered, outcome: TaskOutcome) {
        let plugin = outcome.plugin;
        match outcome.result {
            Ok(Collected::Packages {
                packages,
                repositories,
            }) => {
                gathered.notes(&plugin, &packages);
                match repositories {
                    Ok(repositories) => {
                        gathered.notes(&plugin, &repositories);
                        gathered.repositories.extend(repositories.items);
                    }
                    Err(e) => gathered
                        .warnings
                        .push(Warning::new(&plugin, format!("repositories unavailable: {}", e))),
                }
                let outcome = if packages.partial {
                    AuditOutcome::Warning
                } else {
                    AuditOutcome::Success
                };
                self.audit(
                    format!("enumerate {}", plugin),
                    outcome,
                    Some(format!("{} packages", packages.items.len())),
                );
                gathered.packages.extend(packages.items);
            }
            Ok(Collected::Services { services, policy }) => {
                gathered.notes(&plugin, &services);
                match policy {
                    Ok(policy) => gathered.policy.push(policy),
                    Err(e) => gathered
                        .warnings
                        .push(Warning::new(&plugin, format!("security policy unavailable: {}", e))),
                }
                let outcome = if services.partial {
                    AuditOutcome::Warning
                } else {
                    AuditOutcome::Success
                };
                self.audit(
                    format!("enumerate {}", plugin),
                    outcome,
                    Some(format!("{} services", services.items.len())),
                );
                gathered.services.extend(services.items);
            }
            Err(TaskFailure::Cancelled) => {
                gathered.cancelled = true;
                gathered
                    .warnings
                    .push(Warning::new(&plugin, "cancelled before completion"));
                self.audit(format!("enumerate {}", plugin), AuditOutcome::Warning, Some("cancelled".to_string()));
            }
            Err(TaskFailure::TimedOut(after)) => {
                self.plugin_failed(gathered, &plugin, format!("timed out after {}s", after.as_secs()))
            }
            Err(TaskFailure::Failed(e)) => self.plugin_failed(gathered, &plugin, e.to_string()),
        }
    }

    fn plugin_failed(&self, gathered: &mut Gathered, plugin: &str, message: String) {
        warn!(plugin, %message, "plugin failed");
        self.audit(format!("enumerate {}", plugin), AuditOutcome::Failure, Some(message.clone()));
        gathered.failures.push(format!("{}: {}", plugin, message));
        gathered.warnings.push(Warning::new(plugin, message));
    }

    /// Verifies repositories and packages into `report`. Returns the
    /// per-package outcomes, or `None` when cancelled midway.
    async fn verify(
        &self,
        repositories: &[RepositoryRecord],
        report: &mut Report,
        cancel: &CancellationToken,
    ) -> Option<HashMap<String, VerificationOutcome>> {
        let mut cached: HashMap<String, String> = HashMap::new();
        if let Some(store) = &self.store {
            match store.get::<HashMap<String, String>>(DIGESTS_KEY) {
                Ok(Some(digests)) => cached = digests,
                Ok(None) => {}
                Err(e) => report
                    .warnings
                    .push(Warning::new("store", format!("cached digests unreadable: {}", e))),
            }
        }

        let mut verifier = Verifier::new(Arc::clone(&self.trust))
            .with_cached_digests(cached.clone())
            .require_secure_transport(self.config.require_secure_transport)
            .with_root(&self.config.root)
            .with_concurrency(self.config.max_concurrent_verifications);
        if let Some(store) = &self.store {
            verifier = verifier.with_audit(Arc::clone(store) as Arc<dyn AuditSink>);
        }

        let summary = tokio::select! {
            summary = verifier.verify_all(repositories, &report.packages) => summary,
            _ = cancel.cancelled() => return None,
        };

        let unchecked = summary
            .results
            .iter()
            .filter(|r| {
                matches!(r.subject, Subject::Package(_))
                    && r.outcome.is_verified()
                    && r.evidence.digest_source == DigestSource::Unavailable
            })
            .count();
        if unchecked > 0 {
            report.warnings.push(Warning::new(
                "verifier",
                format!(
                    "{} packages verified by signature chain only, content not checked",
                    unchecked
                ),
            ));
        }

        if let Some(store) = &self.store {
            if !summary.computed_digests.is_empty() {
                cached.extend(summary.computed_digests);
                if let Err(e) = store.put(DIGESTS_KEY, &cached) {
                    report.run_metadata.audit_incomplete = true;
                    report
                        .warnings
                        .push(Warning::new("store", format!("digests not saved: {}", e)));
                }
            }
        }

        report.verification = summary.results;
        Some(summary.package_outcomes)
    }

    async fn match_findings(
        &self,
        report: &mut Report,
        outcomes: HashMap<String, VerificationOutcome>,
    ) {
        let Some(matcher) = &self.matcher else {
            report.warnings.push(Warning::new(
                "matcher",
                "no vulnerability feed loaded, matching skipped",
            ));
            return;
        };

        let matcher = Arc::clone(matcher);
        apply_matching(report, move |packages| matcher.match_all(packages, &outcomes)).await;
    }

    fn finalize(&self, report: &mut Report, audit_baseline: usize) {
        let run_id = report.run_metadata.run_id;
        self.audit(
            format!("run {} finished", run_id),
            if report.run_metadata.run_cancelled {
                AuditOutcome::Warning
            } else {
                AuditOutcome::Success
            },
            Some(format!(
                "{} packages, {} findings, {} warnings",
                report.packages.len(),
                report.findings.len(),
                report.warnings.len()
            )),
        );

        report.run_metadata.finished_at = Utc::now();
        self.advance(&mut report.run_metadata, RunState::Complete);

        if let Some(store) = &self.store {
            let lost = store.failures().saturating_sub(audit_baseline);
            if lost > 0 {
                report.run_metadata.audit_incomplete = true;
                report.warnings.push(Warning::new(
                    "store",
                    format!("{} audit events could not be recorded", lost),
                ));
            }
            if let Err(e) = store.save_report(report) {
                report.run_metadata.audit_incomplete = true;
                report
                    .warnings
                    .push(Warning::new("store", format!("report not saved: {}", e)));
            }
        }

        info!(
            %run_id,
            packages = report.packages.len(),
            services = report.services.len(),
            findings = report.findings.len(),
            warnings = report.warnings.len(),
            cancelled = report.run_metadata.run_cancelled,
            "run finished"
        );
    }
}

/// Runs `work` on the blocking pool over a copy of the inventory. The
/// report keeps its packages whatever happens to the task.
async fn apply_matching<F>(report: &mut Report, work: F)
where
    F: FnOnce(&[PackageRecord]) -> Vec<Finding> + Send + 'static,
{
    let packages = report.packages.clone();
    match tokio::task::spawn_blocking(move || work(&packages)).await {
        Ok(findings) => report.findings = findings,
        Err(e) => {
            warn!(error = %e, "matching task aborted");
            report
                .warnings
                .push(Warning::new("matcher", format!("matching aborted: {}", e)));
        }
    }
}

/// Runs `work` once a permit is free, under `timeout`, unless `cancel`
/// fires first.
async fn guarded<F>(
    semaphore: &Semaphore,
    cancel: &CancellationToken,
    timeout: Duration,
    work: F,
) -> Result<Collected, TaskFailure>
where
    F: std::future::Future<Output = Result<Collected, EnumerationError>>,
{
    let run = async {
        let _permit = semaphore.acquire().await;
        tokio::time::timeout(timeout, work).await
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(TaskFailure::Cancelled),
        result = run => match result {
            Ok(Ok(collected)) => Ok(collected),
            Ok(Err(e)) => Err(TaskFailure::Failed(e)),
            Err(_) => Err(TaskFailure::TimedOut(timeout)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::parse_feed;
    use crate::model::{Ecosystem, RunningState, SecurityContext, ServiceManager, Severity};
    use crate::plugin::{SecurityContextProvider, ServiceEnumerable};
    use crate::store::StoreKey;
    use crate::version::SchemeKind;
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    struct StubPackages {
        name: &'static str,
        ecosystem: Ecosystem,
        behavior: Behavior,
    }

    #[async_trait]
    impl Enumerable for StubPackages {
        fn name(&self) -> &str {
            self.name
        }

        fn ecosystem(&self) -> Ecosystem {
            self.ecosystem
        }

        fn platforms(&self) -> &[Platform] {
            &[Platform::Linux]
        }

        async fn is_applicable(&self) -> bool {
            true
        }

        async fn list_packages(&self) -> Result<Enumeration<PackageRecord>, EnumerationError> {
            match self.behavior {
                Behavior::Succeed => {
                    let scheme = SchemeKind::default_for(self.ecosystem);
                    let mut result = Enumeration::complete(vec![
                        PackageRecord::new(self.ecosystem, "openssl", "3.0.11-1", "local", scheme),
                        PackageRecord::new(self.ecosystem, "bash", "5.2.15-2", "local", scheme),
                    ]);
                    result.skip("status stanza 7 has no Version field");
                    Ok(result)
                }
                Behavior::Fail => Err(EnumerationError::Command {
                    program: "npm".to_string(),
                    message: "exit status 1".to_string(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Enumeration::default())
                }
            }
        }
    }

    struct StubAdapter;

    #[async_trait]
    impl ServiceEnumerable for StubAdapter {
        async fn list_services(&self) -> Result<Enumeration<ServiceRecord>, EnumerationError> {
            Ok(Enumeration::complete(vec![ServiceRecord::new(
                "sshd",
                RunningState::Running,
                SecurityContext::default(),
            )]))
        }
    }

    #[async_trait]
    impl SecurityContextProvider for StubAdapter {
        async fn security_policy_snapshot(&self) -> Result<PolicyDescriptor, EnumerationError> {
            Ok(PolicyDescriptor {
                source: "stub".to_string(),
                firewall_active: true,
                ..PolicyDescriptor::default()
            })
        }
    }

    #[async_trait]
    impl PlatformAdapter for StubAdapter {
        fn name(&self) -> &str {
            "stub-services"
        }

        fn service_manager(&self) -> ServiceManager {
            ServiceManager::Systemd
        }

        fn platforms(&self) -> &[Platform] {
            &[Platform::Linux]
        }

        async fn is_applicable(&self) -> bool {
            true
        }
    }

    fn registry(debian: Behavior, npm: Behavior, adapter: bool) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register_package_plugin(Arc::new(StubPackages {
                name: "stub-dpkg",
                ecosystem: Ecosystem::Debian,
                behavior: debian,
            }))
            .unwrap();
        registry
            .register_package_plugin(Arc::new(StubPackages {
                name: "stub-npm",
                ecosystem: Ecosystem::Npm,
                behavior: npm,
            }))
            .unwrap();
        if adapter {
            registry.register_adapter(Arc::new(StubAdapter)).unwrap();
        }
        registry
    }

    fn config(root: &TempDir) -> Config {
        Config {
            root: root.path().to_path_buf(),
            plugin_timeout_secs: 5,
            ..Config::default()
        }
    }

    const FEED: &str = r#"{"version": 1, "revision": "r1", "records": [
        {"id": "CVE-2023-5678", "ecosystem": "debian", "package": "openssl",
         "ranges": [["< 3.0.11-1~deb12u2"], [">= 3.0.11-1", "< 3.0.12-1"]], "score": 7.5}
    ]}"#;

    #[tokio::test]
    async fn test_one_failing_plugin_becomes_a_warning() {
        let root = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            registry(Behavior::Succeed, Behavior::Fail, true),
            config(&root),
        )
        .with_platform(Platform::Linux)
        .with_feed(parse_feed(FEED.as_bytes()).unwrap());

        let report = orchestrator.run(RunOptions::assess(true)).await.unwrap();

        assert_eq!(report.run_metadata.state, RunState::Complete);
        assert_eq!(report.run_metadata.plugins.len(), 3);
        assert_eq!(report.run_metadata.feed_version.as_deref(), Some("r1"));
        assert_eq!(report.packages.len(), 2);
        assert_eq!(report.services.len(), 1);
        assert_eq!(report.security_policy.len(), 1);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.source == "stub-npm" && w.message.contains("exit status 1")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.source == "stub-dpkg" && w.message.contains("stanza 7")));

        // Every package gets a verification result before matching.
        assert_eq!(report.verification.len(), 2);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].package.name, "openssl");
        assert!(report.exceeds_threshold(Severity::High));
        assert!(!report.exceeds_threshold(Severity::Critical));
    }

    #[tokio::test]
    async fn test_scan_skips_matching() {
        let root = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            registry(Behavior::Succeed, Behavior::Succeed, true),
            config(&root),
        )
        .with_platform(Platform::Linux)
        .with_feed(parse_feed(FEED.as_bytes()).unwrap());

        let report = orchestrator.run(RunOptions::scan()).await.unwrap();
        assert_eq!(report.packages.len(), 4);
        assert_eq!(report.verification.len(), 4);
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_data() {
        let root = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            registry(Behavior::Succeed, Behavior::Hang, false),
            config(&root),
        )
        .with_platform(Platform::Linux);

        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let report = orchestrator.run(RunOptions::assess(false)).await.unwrap();
        assert!(report.run_cancelled());
        assert_eq!(report.packages.len(), 2);
        assert!(report.verification.is_empty());
        assert!(report.findings.is_empty());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.message.contains("verification and matching were skipped")));
        assert!(report.warnings.iter().any(|w| w.source == "stub-npm"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_by_plugin() {
        let root = TempDir::new().unwrap();
        let config = Config {
            plugin_timeout_secs: 1,
            ..config(&root)
        };
        let orchestrator = Orchestrator::new(registry(Behavior::Succeed, Behavior::Hang, false), config)
            .with_platform(Platform::Linux);

        let report = orchestrator.run(RunOptions::scan()).await.unwrap();
        assert!(!report.run_cancelled());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.source == "stub-npm" && w.message.contains("timed out")));
    }

    #[tokio::test]
    async fn test_no_applicable_plugin() {
        let root = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(PluginRegistry::new(), config(&root)).with_platform(Platform::Linux);
        assert!(matches!(
            orchestrator.run(RunOptions::default()).await,
            Err(OrchestrationError::NoApplicablePlugin { platform: Platform::Linux })
        ));
    }

    #[tokio::test]
    async fn test_every_plugin_failing_is_no_data() {
        let root = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(registry(Behavior::Fail, Behavior::Fail, false), config(&root))
            .with_platform(Platform::Linux);

        match orchestrator.run(RunOptions::scan()).await {
            Err(OrchestrationError::NoData { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("expected NoData, got {:?}", other.map(|r| r.packages.len())),
        }
    }

    #[tokio::test]
    async fn test_run_is_journaled_and_persisted() {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = Arc::new(SecureStore::open(store_dir.path(), &StoreKey::from_bytes([5; 32])).unwrap());

        let orchestrator = Orchestrator::new(
            registry(Behavior::Succeed, Behavior::Succeed, false),
            config(&root),
        )
        .with_platform(Platform::Linux)
        .with_store(Arc::clone(&store));

        let report = orchestrator.run(RunOptions::scan()).await.unwrap();
        assert!(!report.run_metadata.audit_incomplete);

        let saved = store.load_report(&report.run_metadata.run_id).unwrap().unwrap();
        assert_eq!(saved, report);

        let events = store.read_audit().unwrap();
        assert!(events.iter().any(|e| e.actor == "orchestrator" && e.action.ends_with("started")));
        assert!(events.iter().any(|e| e.action == "enumerate stub-npm"));
        // One event per verified package.
        assert_eq!(events.iter().filter(|e| e.actor == "verifier").count(), 4);
    }

    #[tokio::test]
    async fn test_store_write_failure_keeps_report() {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = Arc::new(SecureStore::open(store_dir.path(), &StoreKey::from_bytes([6; 32])).unwrap());
        std::fs::remove_dir_all(store_dir.path().join("entries")).unwrap();
        std::fs::write(store_dir.path().join("entries"), b"not a directory").unwrap();
        std::fs::create_dir(store_dir.path().join("audit.log")).unwrap();

        let orchestrator = Orchestrator::new(
            registry(Behavior::Succeed, Behavior::Succeed, false),
            config(&root),
        )
        .with_platform(Platform::Linux)
        .with_store(store);

        let report = orchestrator.run(RunOptions::scan()).await.unwrap();
        assert_eq!(report.run_metadata.state, RunState::Complete);
        assert!(report.run_metadata.audit_incomplete);
        assert_eq!(report.packages.len(), 4);
        assert_eq!(report.verification.len(), 4);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.source == "store" && w.message.contains("audit events could not be recorded")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.source == "store" && w.message.starts_with("report not saved")));
    }

    #[tokio::test]
    async fn test_failed_matching_keeps_inventory() {
        let scheme = SchemeKind::Debian;
        let mut report = Report::new(RunMetadata::new(
            Uuid::new_v4(),
            platform::host_identity(std::path::Path::new("/nonexistent")),
        ));
        report.packages = vec![
            PackageRecord::new(Ecosystem::Debian, "openssl", "3.0.11-1", "local", scheme),
            PackageRecord::new(Ecosystem::Debian, "bash", "5.2.15-2", "local", scheme),
        ];

        apply_matching(&mut report, |_| panic!("matcher blew up")).await;

        assert_eq!(report.packages.len(), 2);
        assert!(report.findings.is_empty());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.source == "matcher" && w.message.starts_with("matching aborted")));
    }

    #[tokio::test]
    async fn test_next_run_after_cancellation_starts_fresh() {
        let root = TempDir::new().unwrap();
        let config = Config {
            plugin_timeout_secs: 1,
            ..config(&root)
        };
        let orchestrator = Orchestrator::new(registry(Behavior::Succeed, Behavior::Hang, false), config)
            .with_platform(Platform::Linux);

        let token = orchestrator.cancellation_token();
        token.cancel();
        let first = orchestrator.run(RunOptions::scan()).await.unwrap();
        assert!(first.run_cancelled());

        let fresh = orchestrator.cancellation_token();
        assert!(!fresh.is_cancelled());
        let second = orchestrator.run(RunOptions::scan()).await.unwrap();
        assert!(!second.run_cancelled());
        assert_eq!(second.verification.len(), 2);
        assert!(second
            .warnings
            .iter()
            .any(|w| w.source == "stub-npm" && w.message.contains("timed out")));
    }
}
