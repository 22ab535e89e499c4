use crate::ids::RelPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A candidate file emitted by the external file scanner:
/// `(file_path, size, mtime, path_derived_metadata)`. The core treats
/// `path_derived_metadata` as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub file_path: RelPath,
    pub size: u64,
    pub mtime: f64,
    #[serde(default)]
    pub path_derived_metadata: Value,
}
