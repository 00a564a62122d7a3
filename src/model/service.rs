use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    Running,
    Exited,
    Activating,
    Inactive,
    Failed,
    Unknown,
}

impl RunningState {
    /// Maps systemd `ActiveState`/`SubState` to a running state.
    pub fn from_systemd(active: &str, sub: &str) -> Self {
        match (active, sub) {
            ("active", "exited") => RunningState::Exited,
            ("active", _) | ("reloading", _) => RunningState::Running,
            ("activating", _) | ("deactivating", _) => RunningState::Activating,
            ("inactive", _) => RunningState::Inactive,
            ("failed", _) => RunningState::Failed,
            _ => RunningState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunningState::Running => "running",
            RunningState::Exited => "exited",
            RunningState::Activating => "activating",
            RunningState::Inactive => "inactive",
            RunningState::Failed => "failed",
            RunningState::Unknown => "unknown",
        }
    }
}

/// Identity and sandboxing a service runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// SELinux label or AppArmor profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_label: Option<String>,
    pub no_new_privileges: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protect_system: Option<String>,
    pub private_tmp: bool,
    pub restrict_namespaces: bool,
}

impl SecurityContext {
    /// Unset `User=` means the unit runs as root.
    pub fn runs_as_root(&self) -> bool {
        matches!(self.user.as_deref(), None | Some("") | Some("root") | Some("0"))
    }

    pub fn hardening(&self) -> ServiceHardening {
        ServiceHardening {
            runs_as_root: self.runs_as_root(),
            has_security_policy: self.mac_label.is_some(),
            protect_system: matches!(self.protect_system.as_deref(), Some("strict")),
            private_tmp: self.private_tmp,
            no_new_privileges: self.no_new_privileges,
            restrict_namespaces: self.restrict_namespaces,
        }
    }
}

/// Per-service hardening checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHardening {
    pub runs_as_root: bool,
    pub has_security_policy: bool,
    pub protect_system: bool,
    pub private_tmp: bool,
    pub no_new_privileges: bool,
    pub restrict_namespaces: bool,
}

impl ServiceHardening {
    /// Percentage of passed checks; running as root counts as a failed check.
    pub fn score(&self) -> u8 {
        let checks = [
            !self.runs_as_root,
            self.has_security_policy,
            self.protect_system,
            self.private_tmp,
            self.no_new_privileges,
            self.restrict_namespaces,
        ];
        let passed = checks.iter().filter(|c| **c).count();
        ((passed * 100) / checks.len()) as u8
    }
}

/// Resource usage at enumeration time. Volatile across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_nanos: Option<u64>,
    pub restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub state: RunningState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub security_context: SecurityContext,
    pub resources: ResourceUsage,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub hardening: ServiceHardening,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, state: RunningState, context: SecurityContext) -> Self {
        let hardening = context.hardening();
        Self {
            name: name.into(),
            state,
            description: None,
            security_context: context,
            resources: ResourceUsage::default(),
            dependencies: BTreeSet::new(),
            hardening,
        }
    }
}

/// Host-wide security configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDescriptor {
    /// Adapter that produced the snapshot.
    pub source: String,
    pub selinux_enabled: bool,
    pub apparmor_enabled: bool,
    pub firewall_active: bool,
    pub ssh_running: bool,
    pub root_login_disabled: bool,
}
