//! Release version parsing and ordering.
//!
//! Published firmware tags are dotted numeric strings, optionally prefixed
//! with `v` (`v1.4.0`) and optionally carrying a build suffix after `-` or
//! `+` (`1.4.0-rc1`). Ordering compares numeric components left to right
//! with missing components treated as zero, so `1.4` and `1.4.0` are the
//! same version. Suffixes do not participate in ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors from parsing a version string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The string contained no components at all.
    #[error("Empty version string")]
    Empty,

    /// A dotted component was not a decimal number.
    #[error("Invalid version component: {0:?}")]
    InvalidComponent(String),
}

/// A parsed release version with a strict total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseVersion {
    components: Vec<u64>,
}

impl ReleaseVersion {
    /// Parses a version string like `1.4.0`, `v2.0`, or `1.4.0-rc1`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] for empty input or non-numeric components.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let without_prefix = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = without_prefix
            .split_once(['-', '+'])
            .map_or(without_prefix, |(core, _suffix)| core);
        if core.is_empty() {
            return Err(VersionError::Empty);
        }

        let mut components = Vec::new();
        for part in core.split('.') {
            let value: u64 = part
                .parse()
                .map_err(|_| VersionError::InvalidComponent(part.to_string()))?;
            components.push(value);
        }

        // Normalize so ordering and equality agree: 1.4.0 == 1.4.
        while components.len() > 1 && components.last() == Some(&0) {
            components.pop();
        }

        Ok(Self { components })
    }

    /// The normalized numeric components, most significant first.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Compares two raw version strings, if both parse.
    pub fn try_compare(a: &str, b: &str) -> Option<Ordering> {
        let a = Self::parse(a).ok()?;
        let b = Self::parse(b).ok()?;
        Some(a.cmp(&b))
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for component in &self.components {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{component}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ReleaseVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ReleaseVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReleaseVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
