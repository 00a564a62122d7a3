use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{CommandRunner, Enumeration};
use crate::error::EnumerationError;
use crate::model::{Ecosystem, PackageMetadata, PackageRecord, Platform, SignatureStatus};
use crate::version::SchemeKind;

const REGISTRY_ORIGIN: &str = "registry.npmjs.org";

pub struct NpmPlugin {
    runner: Arc<dyn CommandRunner>,
    scheme: SchemeKind,
}

impl NpmPlugin {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            scheme: SchemeKind::Semver,
        }
    }

    pub fn with_scheme(mut self, scheme: SchemeKind) -> Self {
        self.scheme = scheme;
        self
    }

    fn command() -> &'static str {
        if cfg!(target_os = "windows") {
            "npm.cmd"
        } else {
            "npm"
        }
    }
}

#[derive(Deserialize)]
struct NpmListOutput {
    dependencies: Option<BTreeMap<String, NpmPackage>>,
}

#[derive(Deserialize)]
struct NpmPackage {
    version: Option<String>,
    resolved: Option<String>,
}

#[async_trait]
impl super::Enumerable for NpmPlugin {
    fn name(&self) -> &str {
        "npm"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    fn platforms(&self) -> &[Platform] {
        &[Platform::Linux, Platform::MacOS, Platform::Windows]
    }

    async fn is_applicable(&self) -> bool {
        self.runner
            .run(Self::command(), &["--version"])
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    async fn list_packages(&self) -> Result<Enumeration<PackageRecord>, EnumerationError> {
        let output = self
            .runner
            .run(Self::command(), &["list", "-g", "--json", "--depth=0"])
            .await?;

        // npm exits 1 on peer dependency problems but still prints the tree
        if !output.success() && output.stdout.trim().is_empty() {
            return Err(EnumerationError::Command {
                program: Self::command().to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        let npm_list: NpmListOutput = serde_json::from_str(&output.stdout)
            .map_err(|e| EnumerationError::parse("npm list output", e))?;

        let mut result = Enumeration::default();

        for (name, pkg) in npm_list.dependencies.unwrap_or_default() {
            if name == "npm" {
                continue;
            }

            let Some(version) = pkg.version else {
                result.skip(format!("{} has no installed version", name));
                continue;
            };

            let metadata = PackageMetadata {
                homepage: Some(format!("https://www.npmjs.com/package/{}", name)),
                ..PackageMetadata::default()
            };

            // Registry tarballs are not kept after install, so there is no
            // artifact or signed index to check against.
            let origin = pkg
                .resolved
                .as_deref()
                .and_then(|url| url.split("://").nth(1))
                .and_then(|rest| rest.split('/').next())
                .unwrap_or(REGISTRY_ORIGIN);

            let package = PackageRecord::new(Ecosystem::Npm, &name, version, origin, self.scheme)
                .with_signature_status(SignatureStatus::Unknown)
                .with_metadata(metadata);

            result.items.push(package);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Enumerable, FakeRunner};

    const LIST: &str = r#"{
      "dependencies": {
        "npm": {"version": "10.2.4"},
        "typescript": {"version": "5.3.3", "resolved": "https://registry.npmjs.org/typescript/-/typescript-5.3.3.tgz"},
        "lodash": {"version": "4.17.20"},
        "broken": {}
      }
    }"#;

    #[tokio::test]
    async fn test_list_packages() {
        let runner = FakeRunner::new()
            .respond("npm --version", "10.2.4\n")
            .respond("npm list -g --json --depth=0", LIST);
        let plugin = NpmPlugin::new(Arc::new(runner));

        assert!(plugin.is_applicable().await);

        let result = plugin.list_packages().await.unwrap();
        assert!(result.partial);
        assert_eq!(result.notes, vec!["broken has no installed version".to_string()]);

        let names: Vec<_> = result.items.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["lodash", "typescript"]);
        assert_eq!(result.items[1].origin, "registry.npmjs.org");
        assert!(result.items[0].version.is_reliable());
    }

    #[tokio::test]
    async fn test_not_applicable_without_npm() {
        let plugin = NpmPlugin::new(Arc::new(FakeRunner::new()));
        assert!(!plugin.is_applicable().await);
        assert!(plugin.list_packages().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_command_without_output_is_an_error() {
        let runner = FakeRunner::new().fail("npm list -g --json --depth=0", 1);
        let plugin = NpmPlugin::new(Arc::new(runner));
        assert!(matches!(
            plugin.list_packages().await,
            Err(EnumerationError::Command { .. })
        ));
    }
}
