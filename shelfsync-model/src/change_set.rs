use serde::{Deserialize, Serialize};

use crate::ids::RelPath;

/// Result of walking the library root and comparing it against the
/// Catalog. Drives what the Orchestrator is handed next and what
/// bookkeeping SyncReconciler performs directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub new: Vec<RelPath>,
    pub modified: Vec<RelPath>,
    pub missing: Vec<RelPath>,
    pub unchanged: Vec<RelPath>,
    pub mtime_skipped: Vec<RelPath>,
}

impl ChangeSet {
    pub fn total_touched(&self) -> usize {
        self.new.len() + self.modified.len() + self.missing.len()
    }

    /// Paths that need to go through the upload pipeline: new and modified.
    pub fn pending_paths(&self) -> impl Iterator<Item = &RelPath> {
        self.new.iter().chain(self.modified.iter())
    }
}
