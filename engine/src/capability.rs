//! Server capability versions and the bulk/sequential gate.
//!
//! Bulk endpoints were introduced incrementally, so every collection type
//! carries its own minimum version for bulk create and bulk delete. Version
//! parsing is lenient: anything unparsable is the lowest possible version,
//! which simply forces the sequential path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dotted numeric version such as `4.2.1`.
///
/// Trailing zero components are dropped, so `4.2` and `4.2.0` are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version(Vec<u64>);

impl Version {
    /// The lowest possible version.
    pub fn lowest() -> Self {
        Self(Vec::new())
    }

    /// Parse a version, never failing.
    ///
    /// Accepts an optional `v` prefix and ignores pre-release or build
    /// suffixes (`-beta`, `+42`). Any other malformed input yields
    /// [`Version::lowest`].
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        if core.is_empty() {
            return Self::lowest();
        }

        let parts: Result<Vec<u64>, _> = core.split('.').map(str::parse::<u64>).collect();
        match parts {
            Ok(mut parts) => {
                while parts.last() == Some(&0) {
                    parts.pop();
                }
                Self(parts)
            }
            Err(_) => Self::lowest(),
        }
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for Version {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "0");
        }
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// How a set of operations is sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// One request per batch
    Bulk,
    /// One request per item
    Sequential,
}

/// Pick bulk execution iff the server is at least `min_bulk`.
pub fn select_strategy(server: &Version, min_bulk: &Version) -> Strategy {
    if server >= min_bulk {
        Strategy::Bulk
    } else {
        Strategy::Sequential
    }
}

/// Minimum server versions for the bulk variants of one collection type.
///
/// `None` means the collection has no bulk variant at all.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSupport {
    #[serde(default)]
    pub create: Option<Version>,
    #[serde(default)]
    pub delete: Option<Version>,
}

impl BulkSupport {
    /// No bulk variants.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(create: Option<Version>, delete: Option<Version>) -> Self {
        Self { create, delete }
    }

    pub fn create_strategy(&self, server: &Version) -> Strategy {
        gate(server, self.create.as_ref())
    }

    pub fn delete_strategy(&self, server: &Version) -> Strategy {
        gate(server, self.delete.as_ref())
    }
}

fn gate(server: &Version, min: Option<&Version>) -> Strategy {
    match min {
        Some(min) => select_strategy(server, min),
        None => Strategy::Sequential,
    }
}
