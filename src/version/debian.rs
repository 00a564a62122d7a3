//! dpkg version ordering.
//!
//! A version is `[epoch:]upstream[-revision]`. Versions compare by epoch,
//! then upstream, then revision. Upstream and revision are compared as
//! alternating runs of non-digits and digits: non-digit runs character by
//! character (`~` sorts before everything, even the end of the string;
//! letters sort before other symbols), digit runs numerically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::VersionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebianVersion {
    pub epoch: u32,
    pub upstream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl DebianVersion {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let fail = |reason: &str| VersionError {
            scheme: "debian",
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let s = raw.trim();
        if s.is_empty() {
            return Err(fail("version string is empty"));
        }
        if s.contains(char::is_whitespace) {
            return Err(fail("version string has embedded spaces"));
        }

        let (epoch, rest) = match s.split_once(':') {
            Some((epoch, rest)) => {
                if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(fail("epoch in version is not a number"));
                }
                let epoch = epoch
                    .parse::<u32>()
                    .map_err(|_| fail("epoch in version is too big"))?;
                (epoch, rest)
            }
            None => (0, s),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((_, "")) => return Err(fail("revision number is empty")),
            Some((upstream, revision)) => (upstream, Some(revision)),
            None => (rest, None),
        };

        if upstream.is_empty() {
            return Err(fail("version number is empty"));
        }
        if !upstream.as_bytes()[0].is_ascii_digit() {
            return Err(fail("version number does not start with digit"));
        }
        if let Some(bad) = upstream
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | '-')))
        {
            return Err(fail(&format!("invalid character `{}` in version number", bad)));
        }
        if let Some(revision) = revision {
            if let Some(bad) = revision
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~')))
            {
                return Err(fail(&format!("invalid character `{}` in revision number", bad)));
            }
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision: revision.map(str::to_string),
        })
    }
}

impl std::fmt::Display for DebianVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        f.write_str(&self.upstream)?;
        if let Some(revision) = &self.revision {
            write!(f, "-{}", revision)?;
        }
        Ok(())
    }
}

impl Ord for DebianVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_fragments(&self.upstream, &other.upstream))
            .then_with(|| {
                compare_fragments(
                    self.revision.as_deref().unwrap_or(""),
                    other.revision.as_deref().unwrap_or(""),
                )
            })
    }
}

impl PartialOrd for DebianVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equal means equal under dpkg ordering, so `1.0` == `1.0-0` == `0:1.0`.
impl PartialEq for DebianVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DebianVersion {}

fn at(s: &[u8], i: usize) -> Option<u8> {
    s.get(i).copied()
}

fn is_digit(c: Option<u8>) -> bool {
    matches!(c, Some(c) if c.is_ascii_digit())
}

/// Weight of a character inside a non-digit run.
fn order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(b'~') => -1,
        Some(c) => c as i32 + 256,
    }
}

/// Compares an upstream version or revision the way dpkg's `verrevcmp`
/// does.
pub fn compare_fragments(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() || j < b.len() {
        while (i < a.len() && !is_digit(at(a, i))) || (j < b.len() && !is_digit(at(b, j))) {
            let ac = order(at(a, i));
            let bc = order(at(b, j));
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while at(a, i) == Some(b'0') {
            i += 1;
        }
        while at(b, j) == Some(b'0') {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while is_digit(at(a, i)) && is_digit(at(b, j)) {
            if first_diff == Ordering::Equal {
                first_diff = at(a, i).cmp(&at(b, j));
            }
            i += 1;
            j += 1;
        }

        if is_digit(at(a, i)) {
            return Ordering::Greater;
        }
        if is_digit(at(b, j)) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}
