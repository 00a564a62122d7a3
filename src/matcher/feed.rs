//! Vulnerability feed loading.
//!
//! # Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "revision": "2024-06-01",
//!   "records": [
//!     {
//!       "id": "CVE-2023-5678",
//!       "ecosystem": "debian",
//!       "package": "openssl",
//!       "ranges": [[">= 3.0.0-1", "< 3.0.11-1~deb12u2"]],
//!       "score": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:N/I:N/A:L",
//!       "description": "Excessive time spent in DH check",
//!       "fixed_version": "3.0.11-1~deb12u2"
//!     }
//!   ]
//! }
//! ```
//!
//! `score` is either a numeric CVSS base score or a CVSS vector. An
//! explicit `severity` wins over the score. Records that fail to decode are
//! skipped and reported; the rest of the feed is still used.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::model::{Ecosystem, Severity, VersionRange, VulnerabilityRecord};
use crate::store::{feed_key, SecureStore};

pub const FEED_FORMAT_VERSION: u32 = 1;

/// A decoded feed.
#[derive(Debug, Clone, Default)]
pub struct LoadedFeed {
    pub records: Vec<VulnerabilityRecord>,
    /// Revision label reported in the run metadata.
    pub revision: Option<String>,
    /// One note per skipped record or fallback taken.
    pub skipped: Vec<String>,
}

#[derive(Deserialize)]
struct FeedDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    records: Vec<Value>,
}

fn default_version() -> u32 {
    FEED_FORMAT_VERSION
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScoreField {
    Numeric(f32),
    Text(String),
}

#[derive(Deserialize)]
struct FeedRecord {
    id: String,
    ecosystem: Ecosystem,
    package: String,
    #[serde(default)]
    ranges: Vec<VersionRange>,
    #[serde(default)]
    score: Option<ScoreField>,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fixed_version: Option<String>,
}

/// Parses a CVSS score or vector into a severity band.
pub fn parse_cvss_score(score: &str) -> Severity {
    if let Ok(cvss) = score.trim().parse::<f32>() {
        return Severity::from_score(cvss);
    }

    // Vectors like "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H" carry no
    // base score; rate them by their impact metrics.
    if score.contains("CVSS:") {
        if score.contains("/C:H") || score.contains("/I:H") || score.contains("/A:H") {
            return Severity::High;
        }
        if score.contains("/C:L") || score.contains("/I:L") || score.contains("/A:L") {
            return Severity::Medium;
        }
        return Severity::Low;
    }

    Severity::Unknown
}

impl FeedRecord {
    fn into_record(self) -> Result<VulnerabilityRecord, String> {
        if self.id.trim().is_empty() {
            return Err("record has an empty id".to_string());
        }
        if self.package.trim().is_empty() {
            return Err(format!("{} has an empty package name", self.id));
        }

        let (score, score_severity) = match self.score {
            Some(ScoreField::Numeric(s)) => (Some(s), Severity::from_score(s)),
            Some(ScoreField::Text(text)) => (text.trim().parse::<f32>().ok(), parse_cvss_score(&text)),
            None => (None, Severity::Unknown),
        };

        Ok(VulnerabilityRecord {
            id: self.id,
            ecosystem: self.ecosystem,
            package: self.package,
            ranges: self.ranges,
            score,
            severity: self.severity.unwrap_or(score_severity),
            description: self.description,
            fixed_version: self.fixed_version,
        })
    }
}

/// Decodes a feed document record by record.
pub fn parse_document(document: Value) -> Result<LoadedFeed, FeedError> {
    let document: FeedDocument = serde_json::from_value(document)?;
    if document.version > FEED_FORMAT_VERSION {
        return Err(FeedError::UnsupportedVersion(document.version));
    }

    let mut feed = LoadedFeed {
        revision: document.revision,
        ..LoadedFeed::default()
    };

    for (idx, raw) in document.records.into_iter().enumerate() {
        let decoded = serde_json::from_value::<FeedRecord>(raw)
            .map_err(|e| e.to_string())
            .and_then(FeedRecord::into_record);
        match decoded {
            Ok(record) => feed.records.push(record),
            Err(reason) => {
                warn!(record = idx, %reason, "skipping feed record");
                feed.skipped.push(format!("record {}: {}", idx, reason));
            }
        }
    }

    debug!(records = feed.records.len(), skipped = feed.skipped.len(), "feed decoded");
    Ok(feed)
}

pub fn parse_feed(bytes: &[u8]) -> Result<LoadedFeed, FeedError> {
    parse_document(serde_json::from_slice(bytes)?)
}

pub async fn load_file(path: &Path) -> Result<LoadedFeed, FeedError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| FeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let feed = parse_feed(&bytes)?;
    info!(path = %path.display(), records = feed.records.len(), "feed loaded");
    Ok(feed)
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Value, FeedError> {
    let http = |source| FeedError::Http {
        url: url.to_string(),
        source,
    };
    client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(http)?
        .json::<Value>()
        .await
        .map_err(http)
}

/// Fetches `url`, serving from the store while the cached copy is younger
/// than `ttl`. A stale copy is used when the fetch fails.
pub async fn load_remote(
    client: &reqwest::Client,
    url: &str,
    store: Option<&SecureStore>,
    ttl: Duration,
) -> Result<LoadedFeed, FeedError> {
    let key = feed_key(url);

    if let Some(store) = store {
        match store.get_fresh::<Value>(&key, ttl) {
            Ok(Some(document)) => {
                debug!(url, "feed served from store");
                return parse_document(document);
            }
            Ok(None) => {}
            Err(e) => warn!(url, error = %e, "cached feed unreadable"),
        }
    }

    match fetch(client, url).await {
        Ok(document) => {
            if let Some(store) = store {
                if let Err(e) = store.put(&key, &document) {
                    warn!(url, error = %e, "could not cache feed");
                }
            }
            let feed = parse_document(document)?;
            info!(url, records = feed.records.len(), "feed fetched");
            Ok(feed)
        }
        Err(fetch_error) => {
            let stale = store.and_then(|s| s.get::<Value>(&key).ok().flatten());
            match stale {
                Some(document) => {
                    warn!(url, error = %fetch_error, "fetch failed, using stale cached feed");
                    let mut feed = parse_document(document)?;
                    feed.skipped
                        .push(format!("fetch failed ({}), using stale cached copy", fetch_error));
                    Ok(feed)
                }
                None => Err(fetch_error),
            }
        }
    }
}
