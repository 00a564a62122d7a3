//! Package manager plugins and platform adapters.
//!
//! Every backend implements one of two capability contracts:
//!
//! - [`Enumerable`] lists installed packages (and the repositories that
//!   vouch for them) for one ecosystem.
//! - [`PlatformAdapter`] lists services and the host security policy for
//!   one service manager.
//!
//! # Available Plugins
//!
//! | Plugin | Capability | Platforms |
//! |--------|------------|-----------|
//! | [`AptPlugin`] | Debian packages (dpkg/APT) | Linux |
//! | [`NpmPlugin`] | npm global packages | All |
//! | [`SystemdAdapter`] | systemd services | Linux |
//!
//! A backend never fails its whole call because one entry is unreadable:
//! it skips the entry and returns an [`Enumeration`] flagged `partial`.

mod apt;
mod command;
mod npm;
mod systemd;

pub use apt::AptPlugin;
pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use npm::NpmPlugin;
pub use systemd::SystemdAdapter;

#[cfg(test)]
pub(crate) use command::fake::FakeRunner;

use crate::error::EnumerationError;
use crate::model::{
    Ecosystem, PackageRecord, Platform, PolicyDescriptor, RepositoryRecord, ServiceManager,
    ServiceRecord,
};
use async_trait::async_trait;

/// Result of one enumeration call.
#[derive(Debug, Clone, PartialEq)]
pub struct Enumeration<T> {
    pub items: Vec<T>,
    /// Some entries of the backing store could not be read.
    pub partial: bool,
    /// One note per skipped entry.
    pub notes: Vec<String>,
}

impl<T> Enumeration<T> {
    pub fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            partial: false,
            notes: Vec::new(),
        }
    }

    /// Records a skipped entry and marks the result partial.
    pub fn skip(&mut self, note: impl Into<String>) {
        self.partial = true;
        self.notes.push(note.into());
    }
}

impl<T> Default for Enumeration<T> {
    fn default() -> Self {
        Self::complete(Vec::new())
    }
}

/// Lists installed packages for one ecosystem.
///
/// Implementations must be idempotent: listing twice on an unchanged host
/// yields the same records in the same order.
#[async_trait]
pub trait Enumerable: Send + Sync {
    fn name(&self) -> &str;

    /// Reported in the run metadata.
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn ecosystem(&self) -> Ecosystem;

    fn platforms(&self) -> &[Platform];

    /// Probes the host for the backing package manager.
    async fn is_applicable(&self) -> bool;

    async fn list_packages(&self) -> Result<Enumeration<PackageRecord>, EnumerationError>;

    /// Repository metadata whose signatures cover the listed packages.
    async fn list_repositories(&self) -> Result<Enumeration<RepositoryRecord>, EnumerationError> {
        Ok(Enumeration::default())
    }
}

#[async_trait]
pub trait ServiceEnumerable: Send + Sync {
    async fn list_services(&self) -> Result<Enumeration<ServiceRecord>, EnumerationError>;
}

#[async_trait]
pub trait SecurityContextProvider: Send + Sync {
    async fn security_policy_snapshot(&self) -> Result<PolicyDescriptor, EnumerationError>;
}

/// Lists services and security configuration for one operating system.
#[async_trait]
pub trait PlatformAdapter: ServiceEnumerable + SecurityContextProvider {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn service_manager(&self) -> ServiceManager;

    fn platforms(&self) -> &[Platform];

    async fn is_applicable(&self) -> bool;
}
