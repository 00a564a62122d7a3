//! Per-user directories and host identity.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::model::{CpuInfo, HostIdentity, MemoryInfo};

const APP_DIR: &str = "secenum";

/// Returns the configuration directory.
///
/// - Linux: `~/.config/secenum/`
/// - macOS: `~/Library/Application Support/secenum/`
/// - Windows: `%APPDATA%\secenum\`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Returns the default Secure Store directory.
///
/// - Linux: `~/.local/share/secenum/`
/// - macOS: `~/Library/Application Support/secenum/`
/// - Windows: `%APPDATA%\secenum\`
///
/// Falls back to `/tmp/secenum/` if no data directory can be determined.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

/// `KEY=value` pairs of an os-release file, quotes stripped.
fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_cpuinfo(content: &str) -> CpuInfo {
    let mut cpu = CpuInfo::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => cpu.count += 1,
            "model name" | "cpu model" | "Model" if cpu.model.is_none() => {
                let value = value.trim();
                if !value.is_empty() {
                    cpu.model = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    cpu
}

fn parse_meminfo(content: &str) -> MemoryInfo {
    let mut memory = MemoryInfo::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(kib) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let bytes = kib.saturating_mul(1024);
        match key.trim() {
            "MemTotal" => memory.total_bytes = bytes,
            "MemFree" => memory.free_bytes = bytes,
            "MemAvailable" => memory.available_bytes = bytes,
            _ => {}
        }
    }
    memory
}

fn parse_uptime(content: &str) -> Option<u64> {
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then_some(secs as u64)
}

fn parse_boot_time(stat: &str) -> Option<DateTime<Utc>> {
    let secs = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse::<i64>()
        .ok()?;
    DateTime::from_timestamp(secs, 0)
}

fn parse_passwd(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
        .collect()
}

/// Identifies the host under `root`: hostname, kernel release,
/// distribution from os-release, CPU, memory, uptime and local accounts.
/// Anything unreadable is left at its default.
pub fn host_identity(root: &Path) -> HostIdentity {
    let os_release = ["etc/os-release", "usr/lib/os-release"]
        .iter()
        .find_map(|rel| fs::read_to_string(root.join(rel)).ok())
        .map(|content| parse_os_release(&content))
        .unwrap_or_default();

    let hostname = read_trimmed(&root.join("etc/hostname"))
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string());

    let kernel = read_trimmed(&root.join("proc/sys/kernel/osrelease"))
        .unwrap_or_else(|| "unknown".to_string());

    HostIdentity {
        hostname,
        kernel,
        distribution: os_release
            .get("NAME")
            .cloned()
            .unwrap_or_else(|| std::env::consts::OS.to_string()),
        distribution_version: os_release
            .get("VERSION_ID")
            .cloned()
            .unwrap_or_default(),
        architecture: std::env::consts::ARCH.to_string(),
        cpu: fs::read_to_string(root.join("proc/cpuinfo"))
            .map(|c| parse_cpuinfo(&c))
            .unwrap_or_default(),
        memory: fs::read_to_string(root.join("proc/meminfo"))
            .map(|c| parse_meminfo(&c))
            .unwrap_or_default(),
        uptime_secs: fs::read_to_string(root.join("proc/uptime"))
            .ok()
            .and_then(|c| parse_uptime(&c)),
        boot_time: fs::read_to_string(root.join("proc/stat"))
            .ok()
            .and_then(|c| parse_boot_time(&c)),
        users: fs::read_to_string(root.join("etc/passwd"))
            .map(|c| parse_passwd(&c))
            .unwrap_or_default(),
    }
}
