//! Static capability tables mapping a platform and a capability to the one
//! plugin that provides it.
//!
//! Conflicts are caught when a plugin is registered, never at run time.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::RegistrationConflict;
use crate::model::{Ecosystem, Platform, PluginVersion, ServiceManager};
use crate::plugin::{
    AptPlugin, CommandRunner, Enumerable, NpmPlugin, PlatformAdapter, SystemCommandRunner,
    SystemdAdapter,
};

#[derive(Default)]
pub struct PluginRegistry {
    packages: BTreeMap<(Platform, Ecosystem), Arc<dyn Enumerable>>,
    adapters: BTreeMap<(Platform, ServiceManager), Arc<dyn PlatformAdapter>>,
}

/// Plugins that answered their applicability probe for one platform.
#[derive(Default, Clone)]
pub struct ResolvedPlugins {
    pub packages: Vec<Arc<dyn Enumerable>>,
    pub adapters: Vec<Arc<dyn PlatformAdapter>>,
}

impl ResolvedPlugins {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packages.len() + self.adapters.len()
    }

    /// Names and versions for the run metadata.
    pub fn versions(&self) -> Vec<PluginVersion> {
        let packages = self.packages.iter().map(|p| PluginVersion {
            name: p.name().to_string(),
            version: p.version().to_string(),
            capability: p.ecosystem().as_str().to_string(),
        });
        let adapters = self.adapters.iter().map(|a| PluginVersion {
            name: a.name().to_string(),
            version: a.version().to_string(),
            capability: a.service_manager().as_str().to_string(),
        });
        packages.chain(adapters).collect()
    }
}

/// One row of the capability tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredPlugin {
    pub platform: Platform,
    pub capability: String,
    pub name: String,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a package plugin under every platform it declares. Nothing
    /// is registered when any of those keys is already taken.
    pub fn register_package_plugin(
        &mut self,
        plugin: Arc<dyn Enumerable>,
    ) -> Result<(), RegistrationConflict> {
        let ecosystem = plugin.ecosystem();
        for platform in plugin.platforms() {
            if let Some(existing) = self.packages.get(&(*platform, ecosystem)) {
                return Err(RegistrationConflict::packages(
                    *platform,
                    ecosystem,
                    existing.name(),
                    plugin.name(),
                ));
            }
        }

        for platform in plugin.platforms() {
            debug!(plugin = plugin.name(), ?platform, %ecosystem, "registered package plugin");
            self.packages.insert((*platform, ecosystem), Arc::clone(&plugin));
        }
        Ok(())
    }

    pub fn register_adapter(
        &mut self,
        adapter: Arc<dyn PlatformAdapter>,
    ) -> Result<(), RegistrationConflict> {
        let manager = adapter.service_manager();
        for platform in adapter.platforms() {
            if let Some(existing) = self.adapters.get(&(*platform, manager)) {
                return Err(RegistrationConflict::services(
                    *platform,
                    manager,
                    existing.name(),
                    adapter.name(),
                ));
            }
        }

        for platform in adapter.platforms() {
            debug!(adapter = adapter.name(), ?platform, manager = manager.as_str(), "registered platform adapter");
            self.adapters.insert((*platform, manager), Arc::clone(&adapter));
        }
        Ok(())
    }

    /// Bundled plugins reading from `config.root`.
    pub fn builtin(config: &Config) -> Result<Self, RegistrationConflict> {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(SystemCommandRunner::new(config.plugin_timeout()));
        Self::with_runner(config, runner)
    }

    /// Bundled plugins with a caller-supplied command runner.
    pub fn with_runner(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, RegistrationConflict> {
        let mut registry = Self::new();
        registry.register_package_plugin(Arc::new(
            AptPlugin::new(&config.root).with_scheme(config.scheme_for(Ecosystem::Debian)),
        ))?;
        registry.register_package_plugin(Arc::new(
            NpmPlugin::new(Arc::clone(&runner)).with_scheme(config.scheme_for(Ecosystem::Npm)),
        ))?;
        registry.register_adapter(Arc::new(SystemdAdapter::new(runner, &config.root)))?;
        Ok(registry)
    }

    /// Every registered row, in table order.
    pub fn entries(&self) -> Vec<RegisteredPlugin> {
        let packages = self.packages.iter().map(|((platform, eco), p)| RegisteredPlugin {
            platform: *platform,
            capability: eco.as_str().to_string(),
            name: p.name().to_string(),
        });
        let adapters = self.adapters.iter().map(|((platform, mgr), a)| RegisteredPlugin {
            platform: *platform,
            capability: mgr.as_str().to_string(),
            name: a.name().to_string(),
        });
        packages.chain(adapters).collect()
    }

    /// Probes each plugin registered for `platform` and keeps the ones
    /// whose backing tool is present.
    pub async fn resolve(&self, platform: Platform) -> ResolvedPlugins {
        let packages: Vec<_> = self
            .packages
            .iter()
            .filter(|((p, _), _)| *p == platform)
            .map(|(_, plugin)| Arc::clone(plugin))
            .collect();
        let adapters: Vec<_> = self
            .adapters
            .iter()
            .filter(|((p, _), _)| *p == platform)
            .map(|(_, adapter)| Arc::clone(adapter))
            .collect();

        let package_probes = join_all(packages.iter().map(|p| p.is_applicable())).await;
        let adapter_probes = join_all(adapters.iter().map(|a| a.is_applicable())).await;

        let resolved = ResolvedPlugins {
            packages: packages
                .into_iter()
                .zip(package_probes)
                .filter_map(|(plugin, ok)| ok.then_some(plugin))
                .collect(),
            adapters: adapters
                .into_iter()
                .zip(adapter_probes)
                .filter_map(|(adapter, ok)| ok.then_some(adapter))
                .collect(),
        };

        info!(
            ?platform,
            packages = resolved.packages.len(),
            adapters = resolved.adapters.len(),
            "resolved applicable plugins"
        );
        resolved
    }
}
