use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a single attempted transition, written to the
/// intent log before the side effect and used to correlate recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A path relative to a library root, normalized with forward slashes.
///
/// This is the primary key of [`crate::record::FileRecord`]; two
/// `RelPath`s are equal iff they refer to the same catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelPath(String);

impl RelPath {
    /// Normalize a path string: backslashes to forward slashes, no leading
    /// slash, no trailing slash, no `.`/`..` components.
    pub fn normalize(raw: &str) -> Self {
        let replaced = raw.replace('\\', "/");
        let normalized: Vec<&str> = replaced
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect();
        Self(normalized.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RelPath {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl From<String> for RelPath {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
