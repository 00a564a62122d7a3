//! Configuration file handling.
//!
//! # Configuration Location
//!
//! - Linux: `~/.config/secenum/config.toml`
//! - macOS: `~/Library/Application Support/secenum/config.toml`
//! - Windows: `%APPDATA%\secenum\config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! root = "/"
//! plugin_timeout_secs = 60
//! max_concurrent_plugins = 4
//! severity_threshold = "high"
//! feed_path = "/var/lib/secenum/feed.json"
//! trust_store = "/etc/secenum/trust.toml"
//! require_secure_transport = true
//!
//! [version_schemes]
//! debian = "debian"
//!
//! [[aliases]]
//! ecosystem = "debian"
//! names = ["openssl", "libssl3", "libssl1.1"]
//!
//! [ignore]
//! packages = ["linux-image-*"]
//! vulnerabilities = ["CVE-2021-12345"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{Ecosystem, Severity};
use crate::platform;
use crate::version::SchemeKind;

/// Application configuration. Every field has a default, so a partial file
/// is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem root the plugins read from. Point it at a mounted image
    /// to scan something other than the running host.
    pub root: PathBuf,

    /// Per-plugin deadline, in seconds.
    pub plugin_timeout_secs: u64,

    pub max_concurrent_plugins: usize,

    pub max_concurrent_verifications: usize,

    /// Findings at or above this severity make the CLI exit nonzero.
    pub severity_threshold: Severity,

    /// Local vulnerability feed (JSON).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_path: Option<PathBuf>,

    /// Remote vulnerability feed, used when `feed_path` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,

    /// How long a fetched feed stays cached in the store.
    pub feed_ttl_hours: u64,

    /// TOML file of trusted signing keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_store: Option<PathBuf>,

    /// Secure Store directory. Defaults to the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,

    /// Reject repositories fetched over plain `http` even when signed.
    pub require_secure_transport: bool,

    /// Valid values: "table", "json"
    pub default_format: String,

    /// Version grammar per ecosystem, keyed by ecosystem name.
    pub version_schemes: BTreeMap<String, SchemeKind>,

    /// Groups of names that refer to the same software.
    pub aliases: Vec<AliasGroup>,

    #[serde(default)]
    pub ignore: IgnoreConfig,
}

/// Names that refer to the same upstream software within one ecosystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasGroup {
    pub ecosystem: Ecosystem,
    pub names: Vec<String>,
}

/// Suppresses known false positives or accepted risks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Package names to leave out of matching. Supports `*` wildcards
    /// (e.g. "linux-image-*", "@types/*").
    pub packages: Vec<String>,

    /// Vulnerability IDs that are never reported.
    pub vulnerabilities: Vec<String>,
}

impl IgnoreConfig {
    pub fn should_ignore_package(&self, name: &str) -> bool {
        self.packages.iter().any(|pattern| {
            if pattern.contains('*') {
                glob_match(pattern, name)
            } else {
                pattern == name
            }
        })
    }

    pub fn should_ignore_vulnerability(&self, vuln_id: &str) -> bool {
        self.vulnerabilities.iter().any(|id| id == vuln_id)
    }
}

/// Simple glob matching (supports * as wildcard).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;

    // Prefix before the first *
    if !parts[0].is_empty() {
        if !remaining.starts_with(parts[0]) {
            return false;
        }
        remaining = &remaining[parts[0].len()..];
    }

    // Suffix after the last *
    let last_part = parts[parts.len() - 1];
    if !last_part.is_empty() {
        if !remaining.ends_with(last_part) {
            return false;
        }
        remaining = &remaining[..remaining.len() - last_part.len()];
    }

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        if let Some(pos) = remaining.find(part) {
            remaining = &remaining[pos + part.len()..];
        } else {
            return false;
        }
    }

    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            plugin_timeout_secs: 60,
            max_concurrent_plugins: 4,
            max_concurrent_verifications: 8,
            severity_threshold: Severity::High,
            feed_path: None,
            feed_url: None,
            feed_ttl_hours: 24,
            trust_store: None,
            store_dir: None,
            require_secure_transport: false,
            default_format: "table".to_string(),
            version_schemes: BTreeMap::new(),
            aliases: Vec::new(),
            ignore: IgnoreConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the default path, falling back to defaults
    /// when no file exists.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use secenum::Config;
    ///
    /// let config = Config::load()?;
    /// println!("Timeout: {}s", config.plugin_timeout_secs);
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Saves the configuration to the default path, creating the parent
    /// directory if needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// # Example
    ///
    /// ```
    /// use secenum::Config;
    ///
    /// let path = Config::config_path();
    /// assert!(path.ends_with("secenum/config.toml"));
    /// ```
    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    pub fn feed_ttl(&self) -> Duration {
        Duration::from_secs(self.feed_ttl_hours * 3600)
    }

    /// Version grammar for `ecosystem`, honoring overrides.
    pub fn scheme_for(&self, ecosystem: Ecosystem) -> SchemeKind {
        self.version_schemes
            .get(ecosystem.as_str())
            .copied()
            .unwrap_or_else(|| SchemeKind::default_for(ecosystem))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(platform::data_dir)
    }
}
