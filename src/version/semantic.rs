use crate::error::VersionError;

/// Parses a semantic version, tolerating a leading `v` and missing minor
/// or patch components (`1.2` reads as `1.2.0`).
pub fn parse_semver(raw: &str) -> Result<semver::Version, VersionError> {
    let trimmed = raw.trim().trim_start_matches('v').trim_start_matches('=');

    if let Ok(version) = semver::Version::parse(trimmed) {
        return Ok(version);
    }

    // Pad only plain numeric cores; anything else is a real parse error.
    let core_end = trimmed
        .find(|c: char| c == '-' || c == '+')
        .unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_end);
    let parts: Vec<&str> = core.split('.').collect();
    let numeric = !core.is_empty()
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));

    if numeric && parts.len() < 3 {
        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        padded.push_str(suffix);
        if let Ok(version) = semver::Version::parse(&padded) {
            return Ok(version);
        }
    }

    Err(VersionError {
        scheme: "semver",
        raw: raw.to_string(),
        reason: "not a semantic version".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let v = parse_semver("4.17.21").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (4, 17, 21));
    }

    #[test]
    fn test_parse_with_prefix() {
        assert_eq!(parse_semver("v1.2.3").unwrap(), semver::Version::new(1, 2, 3));
    }

    #[test]
    fn test_parse_pads_short_versions() {
        assert_eq!(parse_semver("1.2").unwrap(), semver::Version::new(1, 2, 0));
        assert_eq!(parse_semver("3").unwrap(), semver::Version::new(3, 0, 0));
        assert!(parse_semver("1.2-beta.1").unwrap().pre.as_str() == "beta.1");
    }

    #[test]
    fn test_prerelease_orders_first() {
        assert!(parse_semver("1.0.0-rc.1").unwrap() < parse_semver("1.0.0").unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_semver("unknown").is_err());
        assert!(parse_semver("1.x").is_err());
        assert!(parse_semver("").is_err());
    }
}
