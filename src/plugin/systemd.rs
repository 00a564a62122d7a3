use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{CommandRunner, Enumeration};
use crate::error::EnumerationError;
use crate::model::{
    Platform, PolicyDescriptor, ResourceUsage, RunningState, SecurityContext, ServiceManager,
    ServiceRecord,
};

const SYSTEMCTL: &str = "systemctl";

/// systemd services via `systemctl`, security posture via config files
/// under the configured root.
pub struct SystemdAdapter {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl SystemdAdapter {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    async fn unit_names(&self) -> Result<Vec<String>, EnumerationError> {
        let output = self
            .runner
            .run(
                SYSTEMCTL,
                &["list-units", "--type=service", "--all", "--plain", "--no-legend"],
            )
            .await?;

        if !output.success() {
            return Err(EnumerationError::Command {
                program: SYSTEMCTL.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        let names: BTreeSet<String> = output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|unit| unit.strip_suffix(".service"))
            .map(str::to_string)
            .collect();

        Ok(names.into_iter().collect())
    }

    async fn unit_properties(&self, name: &str) -> Result<HashMap<String, String>, EnumerationError> {
        let unit = format!("{}.service", name);
        let output = self.runner.run(SYSTEMCTL, &["show", &unit]).await?;
        if !output.success() {
            return Err(EnumerationError::Command {
                program: SYSTEMCTL.to_string(),
                message: format!("show {}: {}", unit, output.stderr.trim()),
            });
        }

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    async fn command_succeeds(&self, program: &str, args: &[&str]) -> bool {
        self.runner
            .run(program, args)
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root.join(rel)).ok()
    }
}

fn non_empty(props: &HashMap<String, String>, key: &str) -> Option<String> {
    props
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != "[not set]")
        .map(str::to_string)
}

fn flag(props: &HashMap<String, String>, key: &str) -> bool {
    matches!(props.get(key).map(String::as_str), Some("yes") | Some("true"))
}

fn number<T: std::str::FromStr>(props: &HashMap<String, String>, key: &str) -> Option<T> {
    non_empty(props, key).and_then(|v| v.parse().ok())
}

/// Builds a service record from `systemctl show` properties.
fn service_from_properties(name: &str, props: &HashMap<String, String>) -> ServiceRecord {
    let state = RunningState::from_systemd(
        props.get("ActiveState").map(String::as_str).unwrap_or(""),
        props.get("SubState").map(String::as_str).unwrap_or(""),
    );

    let restrict_namespaces = props
        .get("RestrictNamespaces")
        .map(|v| !v.is_empty() && v != "no")
        .unwrap_or(false);

    let context = SecurityContext {
        user: non_empty(props, "User"),
        group: non_empty(props, "Group"),
        mac_label: non_empty(props, "SELinuxContext")
            .map(|l| format!("SELinux: {}", l))
            .or_else(|| non_empty(props, "AppArmorProfile").map(|p| format!("AppArmor: {}", p))),
        no_new_privileges: flag(props, "NoNewPrivileges"),
        protect_system: non_empty(props, "ProtectSystem").filter(|v| v != "no"),
        private_tmp: flag(props, "PrivateTmp"),
        restrict_namespaces,
    };

    let mut record = ServiceRecord::new(name, state, context);
    record.description = non_empty(props, "Description");
    record.resources = ResourceUsage {
        pid: number::<u32>(props, "MainPID").filter(|pid| *pid != 0),
        memory_bytes: number(props, "MemoryCurrent"),
        cpu_nanos: number(props, "CPUUsageNSec"),
        restarts: number(props, "NRestarts").unwrap_or(0),
    };
    record.dependencies = ["Requires", "Wants"]
        .iter()
        .filter_map(|key| props.get(*key))
        .flat_map(|units| units.split_whitespace())
        .filter_map(|unit| unit.strip_suffix(".service"))
        .filter(|dep| *dep != name)
        .map(str::to_string)
        .collect();

    record
}

#[async_trait]
impl super::ServiceEnumerable for SystemdAdapter {
    async fn list_services(&self) -> Result<Enumeration<ServiceRecord>, EnumerationError> {
        let names = self.unit_names().await?;
        let mut result = Enumeration::default();

        for name in names {
            match self.unit_properties(&name).await {
                Ok(props) => result.items.push(service_from_properties(&name, &props)),
                Err(e) => {
                    warn!(service = %name, error = %e, "could not read unit properties");
                    result.skip(format!("{}: {}", name, e));
                }
            }
        }

        debug!(services = result.items.len(), partial = result.partial, "systemd units listed");
        Ok(result)
    }
}

#[async_trait]
impl super::SecurityContextProvider for SystemdAdapter {
    async fn security_policy_snapshot(&self) -> Result<PolicyDescriptor, EnumerationError> {
        let selinux_enabled = self
            .read("etc/selinux/config")
            .map(|cfg| {
                cfg.lines()
                    .map(str::trim)
                    .filter(|l| l.starts_with("SELINUX="))
                    .any(|l| l != "SELINUX=disabled")
            })
            .unwrap_or(false);

        let apparmor_enabled = self
            .read("sys/module/apparmor/parameters/enabled")
            .map(|v| v.trim() == "Y")
            .unwrap_or_else(|| self.root.join("etc/apparmor.d").is_dir());

        let firewall_active = self
            .runner
            .run("ufw", &["status"])
            .await
            .map(|out| out.stdout.to_lowercase().contains("status: active"))
            .unwrap_or(false);

        let ssh_running = self
            .command_succeeds(SYSTEMCTL, &["is-active", "--quiet", "ssh"])
            .await
            || self
                .command_succeeds(SYSTEMCTL, &["is-active", "--quiet", "sshd"])
                .await;

        let root_login_disabled = self
            .read("etc/ssh/sshd_config")
            .map(|cfg| {
                cfg.lines().any(|line| {
                    let mut parts = line.split_whitespace();
                    matches!(
                        (parts.next(), parts.next()),
                        (Some(key), Some("no")) if key.eq_ignore_ascii_case("PermitRootLogin")
                    )
                })
            })
            .unwrap_or(false);

        Ok(PolicyDescriptor {
            source: "systemd".to_string(),
            selinux_enabled,
            apparmor_enabled,
            firewall_active,
            ssh_running,
            root_login_disabled,
        })
    }
}

#[async_trait]
impl super::PlatformAdapter for SystemdAdapter {
    fn name(&self) -> &str {
        "systemd"
    }

    fn service_manager(&self) -> ServiceManager {
        ServiceManager::Systemd
    }

    fn platforms(&self) -> &[Platform] {
        &[Platform::Linux]
    }

    async fn is_applicable(&self) -> bool {
        self.root.join("run/systemd/system").is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{FakeRunner, PlatformAdapter, SecurityContextProvider, ServiceEnumerable};
    use tempfile::TempDir;

    const UNITS: &str = "\
cron.service      loaded active running Regular background program processing daemon
nginx.service     loaded active running A high performance web server
broken.service    loaded failed failed  Broken unit
systemd-tmpfiles-setup.service loaded active exited Create Volatile Files
";

    const NGINX: &str = "\
Type=forking
ActiveState=active
SubState=running
Description=A high performance web server
MainPID=812
MemoryCurrent=10485760
CPUUsageNSec=[not set]
NRestarts=2
User=www-data
NoNewPrivileges=yes
ProtectSystem=strict
PrivateTmp=yes
RestrictNamespaces=no
Requires=system.slice sysinit.target
Wants=network-online.target php-fpm.service
";

    const CRON: &str = "\
ActiveState=active
SubState=running
MainPID=455
NoNewPrivileges=no
";

    const TMPFILES: &str = "\
ActiveState=active
SubState=exited
MainPID=0
";

    fn runner() -> FakeRunner {
        FakeRunner::new()
            .respond(
                "systemctl list-units --type=service --all --plain --no-legend",
                UNITS,
            )
            .respond("systemctl show nginx.service", NGINX)
            .respond("systemctl show cron.service", CRON)
            .respond("systemctl show systemd-tmpfiles-setup.service", TMPFILES)
            .fail("systemctl show broken.service", 1)
            .respond("ufw status", "Status: active\n")
            .fail("systemctl is-active --quiet ssh", 3)
            .respond("systemctl is-active --quiet sshd", "")
    }

    #[tokio::test]
    async fn test_list_services_with_partial_failure() {
        let dir = TempDir::new().unwrap();
        let adapter = SystemdAdapter::new(Arc::new(runner()), dir.path());

        let result = adapter.list_services().await.unwrap();
        assert!(result.partial);
        assert_eq!(result.notes.len(), 1);
        assert!(result.notes[0].starts_with("broken:"));

        let names: Vec<_> = result.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cron", "nginx", "systemd-tmpfiles-setup"]);

        let nginx = &result.items[1];
        assert_eq!(nginx.state, RunningState::Running);
        assert_eq!(nginx.resources.pid, Some(812));
        assert_eq!(nginx.resources.memory_bytes, Some(10_485_760));
        assert_eq!(nginx.resources.cpu_nanos, None);
        assert_eq!(nginx.resources.restarts, 2);
        assert!(nginx.dependencies.contains("php-fpm"));
        assert_eq!(nginx.dependencies.len(), 1);
        assert!(!nginx.hardening.runs_as_root);
        assert!(nginx.hardening.protect_system);
        assert!(!nginx.hardening.restrict_namespaces);

        let cron = &result.items[0];
        assert!(cron.hardening.runs_as_root);

        assert_eq!(result.items[2].state, RunningState::Exited);
        assert_eq!(result.items[2].resources.pid, None);
    }

    #[tokio::test]
    async fn test_listing_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let adapter = SystemdAdapter::new(Arc::new(FakeRunner::new()), dir.path());
        assert!(adapter.list_services().await.is_err());
    }

    #[tokio::test]
    async fn test_security_policy_snapshot() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("etc/ssh")).unwrap();
        fs::write(
            root.join("etc/ssh/sshd_config"),
            "#PermitRootLogin yes\nPermitRootLogin no\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("etc/selinux")).unwrap();
        fs::write(root.join("etc/selinux/config"), "SELINUX=disabled\n").unwrap();
        fs::create_dir_all(root.join("etc/apparmor.d")).unwrap();

        let adapter = SystemdAdapter::new(Arc::new(runner()), root);
        let policy = adapter.security_policy_snapshot().await.unwrap();

        assert!(!policy.selinux_enabled);
        assert!(policy.apparmor_enabled);
        assert!(policy.firewall_active);
        assert!(policy.ssh_running);
        assert!(policy.root_login_disabled);
    }

    #[tokio::test]
    async fn test_applicability_probe() {
        let dir = TempDir::new().unwrap();
        let adapter = SystemdAdapter::new(Arc::new(FakeRunner::new()), dir.path());
        assert!(!adapter.is_applicable().await);

        fs::create_dir_all(dir.path().join("run/systemd/system")).unwrap();
        assert!(adapter.is_applicable().await);
    }
}
