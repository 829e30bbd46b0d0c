//! Version parsing and update planning.
//!
//! A plan is the ordered list of versions to apply between the installed
//! version and the latest published one. The walk advances the patch field
//! one step at a time because every intermediate release publishes its own
//! file list and archive under its exact version string.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::utils::errors::{Result, UpdateError};

/// A `major.minor.patch` version with numeric ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extract the first `\d+.\d+.\d+` token from arbitrary text.
    pub fn extract(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if bytes[start].is_ascii_digit() && (start == 0 || !bytes[start - 1].is_ascii_digit()) {
                if let Some(version) = parse_triple_at(&text[start..]) {
                    return Some(version);
                }
            }
            start += 1;
        }
        None
    }

    pub fn next_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }

    pub fn same_series(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

/// Parse `digits.digits.digits` at the start of `s`, ignoring trailing text.
fn parse_triple_at(s: &str) -> Option<Version> {
    let mut parts = [0u64; 3];
    let mut rest = s;
    for (i, part) in parts.iter_mut().enumerate() {
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        *part = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        if i < 2 {
            rest = rest.strip_prefix('.')?;
        }
    }
    Some(Version::new(parts[0], parts[1], parts[2]))
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Version::extract(s).ok_or_else(|| UpdateError::Version(format!("unparsable version '{}'", s)))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

/// Expand `current -> latest` into the versions to install, in order.
///
/// Within one `major.minor` series this is every patch after `current` up to
/// and including `latest`. A target in a different series cannot be reached
/// by patch increments, so the plan is the single step `[latest]`.
/// Unparsable input yields an empty plan.
pub fn resolve_plan(current: &str, latest: &str) -> Vec<String> {
    let (Some(current), Some(latest)) = (Version::extract(current), Version::extract(latest)) else {
        warn!("Cannot resolve update plan from '{}' to '{}'", current, latest);
        return Vec::new();
    };

    if current >= latest {
        return Vec::new();
    }

    if !current.same_series(&latest) {
        warn!(
            "Target {} is outside the {}.{} series; planning a direct step",
            latest, current.major, current.minor
        );
        return vec![latest.to_string()];
    }

    let mut plan = Vec::new();
    let mut step = current;
    while step < latest {
        step = step.next_patch();
        plan.push(step.to_string());
    }
    plan
}

/// Parsed contents of the remote `version.txt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version of the managed content tree
    pub content_version: Option<String>,

    /// Version of the launcher binary itself (`LauncherVersion=`)
    pub launcher_version: Option<String>,
}

impl VersionInfo {
    /// `Version=` wins for the content version; otherwise the first version
    /// token on any line other than `LauncherVersion=`.
    pub fn parse(text: &str) -> Self {
        let mut info = VersionInfo::default();
        let mut fallback = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(value) = line.strip_prefix("LauncherVersion=") {
                info.launcher_version = Version::extract(value).map(|v| v.to_string());
            } else if let Some(value) = line.strip_prefix("Version=") {
                info.content_version = Version::extract(value).map(|v| v.to_string());
            } else if fallback.is_none() {
                fallback = Version::extract(line).map(|v| v.to_string());
            }
        }

        if info.content_version.is_none() {
            info.content_version = fallback;
        }
        info
    }
}

/// True when `remote` is strictly newer than `local`.
pub fn is_newer(remote: &str, local: &str) -> bool {
    match (Version::extract(remote), Version::extract(local)) {
        (Some(remote), Some(local)) => remote > local,
        _ => false,
    }
}
