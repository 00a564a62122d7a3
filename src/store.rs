//! Encrypted persistence for reports, cached feeds and digests, plus the
//! append-only audit trail.
//!
//! # Layout
//!
//! ```text
//! <store dir>/
//!   store.key            hex key, created on first use (unless SECENUM_STORE_KEY is set)
//!   entries/<key>.bin    nonce(12) || ciphertext || tag(16), AAD = entry key
//!   audit.log            one hex-encoded sealed event per line, AAD = "audit"
//! ```
//!
//! Binding the entry key as associated data means a file copied under a
//! different name fails to decrypt.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{AuditEvent, Report};

/// Environment variable holding a hex-encoded 32-byte store key.
pub const STORE_KEY_ENV: &str = "SECENUM_STORE_KEY";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_FILE: &str = "store.key";
const ENTRIES_DIR: &str = "entries";
const AUDIT_FILE: &str = "audit.log";
const AUDIT_AAD: &[u8] = b"audit";

/// Entry holding the cached artifact digests from earlier runs.
pub const DIGESTS_KEY: &str = "digests";

pub fn report_key(run_id: &Uuid) -> String {
    format!("report/{}", run_id)
}

pub fn feed_key(source: &str) -> String {
    format!("feed/{}", source)
}

/// 256-bit AES key. Never printed.
#[derive(Clone)]
pub struct StoreKey([u8; 32]);

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(..)")
    }
}

impl StoreKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, StoreError> {
        let bytes = hex::decode(encoded.trim()).map_err(|e| StoreError::Key(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Key(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    /// Reads the key file at `path`, creating it with a fresh key when it
    /// does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
            return Self::from_hex(&content);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let key = Self::generate();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(|e| StoreError::io(path, e))?;
        file.write_all(hex::encode(key.0).as_bytes())
            .map_err(|e| StoreError::io(path, e))?;

        debug!(path = %path.display(), "generated store key");
        Ok(key)
    }

    /// Key from [`STORE_KEY_ENV`], else the key file inside `dir`.
    pub fn resolve(dir: &Path) -> Result<Self, StoreError> {
        match std::env::var(STORE_KEY_ENV) {
            Ok(encoded) if !encoded.trim().is_empty() => Self::from_hex(&encoded),
            _ => Self::load_or_create(&dir.join(KEY_FILE)),
        }
    }
}

/// Append-only destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Number of events that could not be recorded.
    fn failures(&self) -> usize {
        0
    }
}

pub struct SecureStore {
    dir: PathBuf,
    cipher: Aes256Gcm,
    audit_lock: Mutex<()>,
    audit_failures: AtomicUsize,
}

impl SecureStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, key: &StoreKey) -> Result<Self, StoreError> {
        let dir = dir.into();
        let entries = dir.join(ENTRIES_DIR);
        fs::create_dir_all(&entries).map_err(|e| StoreError::io(&entries, e))?;

        let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|e| StoreError::Key(e.to_string()))?;

        Ok(Self {
            dir,
            cipher,
            audit_lock: Mutex::new(()),
            audit_failures: AtomicUsize::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let safe_key: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(ENTRIES_DIR).join(format!("{}.bin", safe_key))
    }

    fn seal(&self, aad: &[u8], plaintext: &[u8], what: &str) -> Result<Vec<u8>, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| StoreError::Encrypt(what.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, aad: &[u8], sealed: &[u8], what: &str) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StoreError::Decrypt(what.to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| StoreError::Decrypt(what.to_string()))
    }

    /// Encrypts and writes `value` under `key`, replacing any previous entry.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = self.seal(key.as_bytes(), &plaintext, key)?;

        let path = self.entry_path(key);
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, &sealed).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;

        debug!(key, bytes = sealed.len(), "stored entry");
        Ok(())
    }

    /// Reads `key`. `Ok(None)` when there is no such entry; a tampered or
    /// foreign entry is an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.entry_path(key);
        let sealed = match fs::read(&path) {
            Ok(sealed) => sealed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let plaintext = self.unseal(key.as_bytes(), &sealed, key)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Like [`get`](Self::get), but treats entries older than `ttl` as
    /// absent.
    pub fn get_fresh<T: DeserializeOwned>(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<T>, StoreError> {
        let path = self.entry_path(key);
        let expired = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|elapsed| elapsed > ttl)
            .unwrap_or(false);

        if expired {
            debug!(key, "entry expired");
            return Ok(None);
        }
        self.get(key)
    }

    pub fn save_report(&self, report: &Report) -> Result<(), StoreError> {
        self.put(&report_key(&report.run_metadata.run_id), report)
    }

    pub fn load_report(&self, run_id: &Uuid) -> Result<Option<Report>, StoreError> {
        self.get(&report_key(run_id))
    }

    /// Appends one sealed event to the audit log.
    pub fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(event)?;
        let line = hex::encode(self.seal(AUDIT_AAD, &plaintext, "audit event")?);

        let _guard = self.audit_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let path = self.dir.join(AUDIT_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        writeln!(file, "{}", line).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Decrypts the whole audit trail in append order.
    pub fn read_audit(&self) -> Result<Vec<AuditEvent>, StoreError> {
        let path = self.dir.join(AUDIT_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| -> Result<AuditEvent, StoreError> {
                let what = format!("audit line {}", idx + 1);
                let sealed = hex::decode(line.trim()).map_err(|_| StoreError::Decrypt(what.clone()))?;
                let plaintext = self.unseal(AUDIT_AAD, &sealed, &what)?;
                Ok(serde_json::from_slice(&plaintext)?)
            })
            .collect()
    }
}

impl AuditSink for SecureStore {
    fn record(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.append_audit(event).inspect_err(|e| {
            self.audit_failures.fetch_add(1, Ordering::Relaxed);
            warn!(action = %event.action, error = %e, "audit event not recorded");
        })
    }

    fn failures(&self) -> usize {
        self.audit_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditOutcome, HostIdentity, RunMetadata};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SecureStore {
        SecureStore::open(dir.path(), &StoreKey::from_bytes([7; 32])).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut digests = HashMap::new();
        digests.insert("debian/bash@5.2.15-2+b2#local".to_string(), "00ff".to_string());
        store.put(DIGESTS_KEY, &digests).unwrap();

        let back: HashMap<String, String> = store.get(DIGESTS_KEY).unwrap().unwrap();
        assert_eq!(back, digests);
        assert!(store.get::<String>("absent").unwrap().is_none());
    }

    #[test]
    fn test_entries_are_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put("feed/local", &"CVE-2024-0001").unwrap();

        let raw = fs::read(store.entry_path("feed/local")).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("CVE-2024-0001"));
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let dir = TempDir::new().unwrap();
        open(&dir).put("digests", &1u32).unwrap();

        let other = SecureStore::open(dir.path(), &StoreKey::from_bytes([8; 32])).unwrap();
        assert!(matches!(other.get::<u32>("digests"), Err(StoreError::Decrypt(_))));
    }

    #[test]
    fn test_entry_bound_to_its_key() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put("feed/a", &"a").unwrap();
        fs::copy(store.entry_path("feed/a"), store.entry_path("feed/b")).unwrap();

        assert!(matches!(store.get::<String>("feed/b"), Err(StoreError::Decrypt(_))));
    }

    #[test]
    fn test_tampered_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put("digests", &"value").unwrap();

        let path = store.entry_path("digests");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 1;
        fs::write(&path, raw).unwrap();

        assert!(store.get::<String>("digests").is_err());
    }

    #[test]
    fn test_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put("feed/remote", &"doc").unwrap();

        let hour = Duration::from_secs(3600);
        assert!(store.get_fresh::<String>("feed/remote", hour).unwrap().is_some());

        let file = fs::File::options()
            .write(true)
            .open(store.entry_path("feed/remote"))
            .unwrap();
        file.set_modified(SystemTime::now() - 2 * hour).unwrap();

        assert!(store.get_fresh::<String>("feed/remote", hour).unwrap().is_none());
    }

    #[test]
    fn test_audit_append_and_read() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store
            .record(&AuditEvent::new("orchestrator", "run started", AuditOutcome::Success))
            .unwrap();
        store
            .record(
                &AuditEvent::new("verifier", "verify package", AuditOutcome::Failure)
                    .with_detail("hash mismatch"),
            )
            .unwrap();

        let events = store.read_audit().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "run started");
        assert_eq!(events[1].detail.as_deref(), Some("hash mismatch"));
        assert_eq!(store.failures(), 0);

        let raw = fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        assert!(!raw.contains("run started"));
    }

    #[test]
    fn test_report_persistence() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let report = Report::new(RunMetadata::new(Uuid::new_v4(), HostIdentity::default()));

        store.save_report(&report).unwrap();
        let back = store.load_report(&report.run_metadata.run_id).unwrap().unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_key_file_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join(KEY_FILE);

        let first = StoreKey::load_or_create(&path).unwrap();
        let second = StoreKey::load_or_create(&path).unwrap();
        assert_eq!(first.0, second.0);
        assert!(StoreKey::from_hex("abcd").is_err());
    }
}
