//! Debian/Ubuntu packages from the dpkg database and APT lists.
//!
//! Everything is read from files under a configurable root, so a mounted
//! image can be scanned as well as the running host:
//!
//! - `var/lib/dpkg/status`: installed packages
//! - `var/lib/dpkg/info/<pkg>[:<arch>].md5sums`: per-file digests
//! - `var/lib/apt/lists/*_Packages`: declared SHA-256 per package version
//! - `var/lib/apt/lists/*_Release`, `*_InRelease`: repository metadata,
//!   signed by a detached `<file>.sig`
//! - `var/cache/apt/archives/*.deb`: cached artifacts
//! - `etc/apt/sources.list[.d]`: repository URIs

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::Enumeration;
use crate::error::EnumerationError;
use crate::model::{
    Ecosystem, InstalledFile, PackageMetadata, PackageRecord, Platform, RepositoryRecord,
    SignatureStatus,
};
use crate::version::SchemeKind;

const DPKG_STATUS: &str = "var/lib/dpkg/status";
const DPKG_INFO: &str = "var/lib/dpkg/info";
const APT_LISTS: &str = "var/lib/apt/lists";
const APT_ARCHIVES: &str = "var/cache/apt/archives";
const APT_SOURCES: &str = "etc/apt/sources.list";
const APT_SOURCES_DIR: &str = "etc/apt/sources.list.d";

/// Origin of packages no repository index lists.
pub const LOCAL_ORIGIN: &str = "local";

pub struct AptPlugin {
    root: PathBuf,
    scheme: SchemeKind,
}

impl AptPlugin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scheme: SchemeKind::Debian,
        }
    }

    pub fn with_scheme(mut self, scheme: SchemeKind) -> Self {
        self.scheme = scheme;
        self
    }
}

#[async_trait]
impl super::Enumerable for AptPlugin {
    fn name(&self) -> &str {
        "apt"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Debian
    }

    fn platforms(&self) -> &[Platform] {
        &[Platform::Linux]
    }

    async fn is_applicable(&self) -> bool {
        self.root.join(DPKG_STATUS).is_file()
    }

    async fn list_packages(&self) -> Result<Enumeration<PackageRecord>, EnumerationError> {
        let root = self.root.clone();
        let scheme = self.scheme;
        tokio::task::spawn_blocking(move || collect_packages(&root, scheme))
            .await
            .map_err(|e| EnumerationError::Command {
                program: "apt".to_string(),
                message: e.to_string(),
            })?
    }

    async fn list_repositories(&self) -> Result<Enumeration<RepositoryRecord>, EnumerationError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || collect_repositories(&root))
            .await
            .map_err(|e| EnumerationError::Command {
                program: "apt".to_string(),
                message: e.to_string(),
            })?
    }
}

/// A deb822 paragraph. Field names are kept as written.
type Stanza = HashMap<String, String>;

/// Splits a deb822 document into paragraphs. A paragraph with a line that
/// is neither `Field: value` nor a continuation is returned as an error
/// carrying its starting line number.
fn parse_stanzas(content: &str) -> Vec<Result<Stanza, usize>> {
    let mut stanzas = Vec::new();
    let mut current = Stanza::new();
    let mut last_field: Option<String> = None;
    let mut malformed = false;
    let mut start_line = 1;

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            if malformed {
                stanzas.push(Err(start_line));
            } else if !current.is_empty() {
                stanzas.push(Ok(std::mem::take(&mut current)));
            }
            current.clear();
            last_field = None;
            malformed = false;
            start_line = idx + 2;
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            match last_field.as_ref().and_then(|f| current.get_mut(f)) {
                Some(value) => {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                None => malformed = true,
            }
            continue;
        }

        match line.split_once(':') {
            Some((field, value)) if !field.is_empty() && !field.contains(' ') => {
                current.insert(field.to_string(), value.trim().to_string());
                last_field = Some(field.to_string());
            }
            _ => malformed = true,
        }
    }

    if malformed {
        stanzas.push(Err(start_line));
    } else if !current.is_empty() {
        stanzas.push(Ok(current));
    }

    stanzas
}

/// Repository id from an APT list file name:
/// `deb.debian.org_debian_dists_bookworm_main_binary-amd64_Packages`
/// becomes `deb.debian.org_debian_dists_bookworm`.
fn repository_id(file_name: &str) -> Option<String> {
    let (prefix, rest) = file_name.split_once("_dists_")?;
    let suite = rest.split('_').next()?;
    if prefix.is_empty() || suite.is_empty() {
        return None;
    }
    Some(format!("{}_dists_{}", prefix, suite))
}

/// Same id derived from a sources.list entry, the way APT names its lists.
fn repository_id_for_source(uri: &str, suite: &str) -> Option<String> {
    let without_scheme = uri.split_once("://").map(|(_, rest)| rest)?;
    let prefix = without_scheme.trim_end_matches('/').replace('/', "_");
    let suite = suite.trim_end_matches('/').replace('/', "_");
    Some(format!("{}_dists_{}", prefix, suite))
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// Declared digests: `(name, version, arch)` to `(sha256, repository id)`.
type DigestIndex = HashMap<(String, String, String), (String, String)>;

fn load_digest_index(root: &Path, out: &mut Enumeration<PackageRecord>) -> DigestIndex {
    let mut index = DigestIndex::new();
    let lists = root.join(APT_LISTS);
    if !lists.is_dir() {
        return index;
    }

    for path in list_files(&lists) {
        let name = file_name(&path);
        if !name.ends_with("_Packages") {
            continue;
        }
        let Some(repo) = repository_id(name) else {
            continue;
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable package index");
                out.skip(format!("unreadable package index {}: {}", path.display(), e));
                continue;
            }
        };

        for stanza in parse_stanzas(&content).into_iter().flatten() {
            let (Some(pkg), Some(version), Some(sha)) =
                (stanza.get("Package"), stanza.get("Version"), stanza.get("SHA256"))
            else {
                continue;
            };
            let arch = stanza.get("Architecture").cloned().unwrap_or_default();
            index
                .entry((pkg.clone(), version.clone(), arch))
                .or_insert_with(|| (sha.to_lowercase(), repo.clone()));
        }
    }

    index
}

fn read_md5sums(root: &Path, name: &str, arch: Option<&str>) -> Vec<InstalledFile> {
    let info = root.join(DPKG_INFO);
    let mut candidates = vec![info.join(format!("{}.md5sums", name))];
    if let Some(arch) = arch {
        candidates.push(info.join(format!("{}:{}.md5sums", name, arch)));
    }

    let Some(content) = candidates.iter().find_map(|p| fs::read_to_string(p).ok()) else {
        return Vec::new();
    };

    content
        .lines()
        .filter_map(|line| {
            let (md5, path) = line.split_once(char::is_whitespace)?;
            let path = path.trim();
            if md5.len() != 32 || path.is_empty() {
                return None;
            }
            Some(InstalledFile {
                path: PathBuf::from("/").join(path),
                md5: md5.to_lowercase(),
            })
        })
        .collect()
}

fn artifact_path(root: &Path, name: &str, version: &str, arch: Option<&str>) -> Option<PathBuf> {
    let arch = arch?;
    let path = root.join(APT_ARCHIVES).join(format!(
        "{}_{}_{}.deb",
        name,
        version.replace(':', "%3a"),
        arch
    ));
    path.is_file().then_some(path)
}

fn collect_packages(
    root: &Path,
    scheme: SchemeKind,
) -> Result<Enumeration<PackageRecord>, EnumerationError> {
    let status_path = root.join(DPKG_STATUS);
    let content =
        fs::read_to_string(&status_path).map_err(|e| EnumerationError::io(&status_path, e))?;

    let mut out = Enumeration::default();
    let index = load_digest_index(root, &mut out);

    for stanza in parse_stanzas(&content) {
        let stanza = match stanza {
            Ok(stanza) => stanza,
            Err(line) => {
                out.skip(format!("malformed dpkg status entry at line {}", line));
                continue;
            }
        };

        let installed = stanza
            .get("Status")
            .map(|s| s.ends_with(" installed"))
            .unwrap_or(false);
        if !installed {
            continue;
        }

        let (Some(name), Some(version)) = (stanza.get("Package"), stanza.get("Version")) else {
            out.skip(format!(
                "dpkg status entry without Package or Version ({})",
                stanza.get("Package").map(String::as_str).unwrap_or("unnamed")
            ));
            continue;
        };

        let arch = stanza.get("Architecture").map(String::as_str);
        let metadata = PackageMetadata {
            description: stanza
                .get("Description")
                .and_then(|d| d.lines().next())
                .map(str::to_string),
            maintainer: stanza.get("Maintainer").cloned(),
            homepage: stanza.get("Homepage").cloned(),
            installed_size: stanza
                .get("Installed-Size")
                .and_then(|s| s.parse::<u64>().ok())
                .map(|kib| kib * 1024),
        };

        let indexed = index.get(&(
            name.clone(),
            version.clone(),
            arch.unwrap_or_default().to_string(),
        ));
        let origin = indexed.map(|(_, repo)| repo.as_str()).unwrap_or(LOCAL_ORIGIN);

        let mut record = PackageRecord::new(Ecosystem::Debian, name, version, origin, scheme)
            .with_files(read_md5sums(root, name, arch))
            .with_metadata(metadata);

        if let Some(arch) = arch {
            record = record.with_architecture(arch);
        }
        record = match indexed {
            Some((sha, _)) => record
                .with_digest(sha.clone())
                .with_signature_status(SignatureStatus::RepositoryIndexed),
            None => record.with_signature_status(SignatureStatus::LocalOnly),
        };
        if let Some(path) = artifact_path(root, name, version, arch) {
            record = record.with_artifact(path);
        }

        out.items.push(record);
    }

    out.items.sort_by(|a, b| {
        (&a.name, &a.architecture, &a.version.raw).cmp(&(&b.name, &b.architecture, &b.version.raw))
    });

    debug!(
        packages = out.items.len(),
        partial = out.partial,
        "dpkg status parsed"
    );

    Ok(out)
}

/// `deb [options] uri suite components...` lines from sources files.
fn source_uris(root: &Path) -> HashMap<String, String> {
    let mut files = vec![root.join(APT_SOURCES)];
    let dir = root.join(APT_SOURCES_DIR);
    if dir.is_dir() {
        files.extend(
            list_files(&dir)
                .into_iter()
                .filter(|p| p.extension().map(|e| e == "list").unwrap_or(false)),
        );
    }

    let mut uris = HashMap::new();
    for path in files {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            if fields.next() != Some("deb") {
                continue;
            }
            let mut uri = fields.next();
            // Skip `[arch=amd64 signed-by=...]`, which may span several tokens.
            if uri.map(|u| u.starts_with('[')).unwrap_or(false) {
                let mut token = uri;
                while let Some(t) = token {
                    if t.ends_with(']') {
                        break;
                    }
                    token = fields.next();
                }
                uri = fields.next();
            }
            let (Some(uri), Some(suite)) = (uri, fields.next()) else {
                continue;
            };
            if let Some(id) = repository_id_for_source(uri, suite) {
                uris.insert(id, uri.to_string());
            }
        }
    }
    uris
}

fn collect_repositories(root: &Path) -> Result<Enumeration<RepositoryRecord>, EnumerationError> {
    let lists = root.join(APT_LISTS);
    if !lists.is_dir() {
        return Ok(Enumeration::default());
    }

    let uris = source_uris(root);
    let mut repos: BTreeMap<String, RepositoryRecord> = BTreeMap::new();

    for path in list_files(&lists) {
        let name = file_name(&path);
        let inline = name.ends_with("_InRelease");
        if !inline && !name.ends_with("_Release") {
            continue;
        }
        let Some(id) = repository_id(name) else {
            continue;
        };
        if !inline && repos.contains_key(&id) {
            continue;
        }

        let suite = id.rsplit_once("_dists_").map(|(_, s)| s.replace('_', "/"));
        let mut signature_path = path.clone().into_os_string();
        signature_path.push(".sig");

        repos.insert(
            id.clone(),
            RepositoryRecord {
                uri: uris.get(&id).cloned(),
                id,
                suite,
                release_path: path.clone(),
                signature_path: PathBuf::from(signature_path),
            },
        );
    }

    Ok(Enumeration::complete(repos.into_values().collect()))
}
