use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AttemptId, RelPath};

/// Lifecycle state of a single file. `FAILED` is the only escape hatch;
/// every other edge is listed in the FSM transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    Untracked,
    Uploading,
    Processing,
    Indexed,
    Failed,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Untracked => "UNTRACKED",
            FsmState::Uploading => "UPLOADING",
            FsmState::Processing => "PROCESSING",
            FsmState::Indexed => "INDEXED",
            FsmState::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "UNTRACKED" => FsmState::Untracked,
            "UPLOADING" => FsmState::Uploading,
            "PROCESSING" => FsmState::Processing,
            "INDEXED" => FsmState::Indexed,
            "FAILED" => FsmState::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a record ended up in FAILED, persisted alongside `error_reason` so a
/// later retry pass can tell a rate-limited or server-side failure from a
/// permanent one without re-parsing free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    RateLimited,
    ServerError,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::ServerError => "SERVER_ERROR",
            ErrorClass::Permanent => "PERMANENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "RATE_LIMITED" => ErrorClass::RateLimited,
            "SERVER_ERROR" => ErrorClass::ServerError,
            "PERMANENT" => ErrorClass::Permanent,
            _ => return None,
        })
    }

    /// Whether a FAILED record carrying this classification should be
    /// picked up by the post-batch retry pass.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The optimistic-concurrency token returned by `begin_transition` and
/// required by `commit_transition`. A commit only applies if the record
/// still matches `(state, version)` at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccToken {
    pub state: FsmState,
    pub version: i64,
}

/// Durable per-file record, keyed by `file_path` relative to a library root.
///
/// Mutated exclusively through FSM transitions — never by ad-hoc writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_path: RelPath,
    pub content_hash: String,
    pub size: u64,
    pub mtime: f64,
    pub fsm_state: FsmState,
    pub version: i64,
    pub remote_raw_id: Option<String>,
    pub remote_doc_id: Option<String>,
    pub orphan_raw_id: Option<String>,
    pub missing_since: Option<DateTime<Utc>>,
    pub upload_hash: Option<String>,
    pub enrichment_version: Option<String>,
    pub error_reason: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub attempt_count: i64,
    pub remote_expiration: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Construct a brand-new UNTRACKED record for a file the scanner has
    /// just discovered. `version` starts at 0; the first successful
    /// transition bumps it to 1.
    pub fn new_untracked(file_path: RelPath, content_hash: String, size: u64, mtime: f64) -> Self {
        Self {
            file_path,
            content_hash,
            size,
            mtime,
            fsm_state: FsmState::Untracked,
            version: 0,
            remote_raw_id: None,
            remote_doc_id: None,
            orphan_raw_id: None,
            missing_since: None,
            upload_hash: None,
            enrichment_version: None,
            error_reason: None,
            error_class: None,
            attempt_count: 0,
            remote_expiration: None,
        }
    }

    pub fn occ_token(&self) -> OccToken {
        OccToken {
            state: self.fsm_state,
            version: self.version,
        }
    }

    /// INDEXED implies both remote ids are present.
    pub fn invariant_i1_holds(&self) -> bool {
        self.fsm_state != FsmState::Indexed
            || (self.remote_raw_id.is_some() && self.remote_doc_id.is_some())
    }

    /// UNTRACKED/FAILED implies no indexed store document.
    pub fn invariant_i2_holds(&self) -> bool {
        !matches!(self.fsm_state, FsmState::Untracked | FsmState::Failed) || self.remote_doc_id.is_none()
    }

    /// Re-submitting bytes whose digest matches `upload_hash` is a no-op.
    pub fn upload_hash_matches(&self, desired_hash: &str) -> bool {
        self.upload_hash.as_deref() == Some(desired_hash)
    }

    pub fn has_pending_orphan(&self) -> bool {
        self.orphan_raw_id.is_some()
    }
}

/// Write-ahead record of "about to perform side effect X", written before
/// the side effect and finalized after: an append-only log keyed by
/// `file_path`, not a back-pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadIntent {
    pub file_path: RelPath,
    pub intended_state: FsmState,
    pub attempt_id: AttemptId,
    pub started_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl UploadIntent {
    pub fn open(file_path: RelPath, intended_state: FsmState) -> Self {
        Self {
            file_path,
            intended_state,
            attempt_id: AttemptId::new(),
            started_at: Utc::now(),
            finalized_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.finalized_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_without_remote_ids_violates_i1() {
        let mut record = FileRecord::new_untracked(RelPath::from("a.txt"), "h".into(), 1, 0.0);
        record.fsm_state = FsmState::Indexed;
        assert!(!record.invariant_i1_holds());
        record.remote_raw_id = Some("raw-1".into());
        record.remote_doc_id = Some("doc-1".into());
        assert!(record.invariant_i1_holds());
    }

    #[test]
    fn upload_hash_noop_detection() {
        let mut record = FileRecord::new_untracked(RelPath::from("a.txt"), "h".into(), 1, 0.0);
        assert!(!record.upload_hash_matches("abc"));
        record.upload_hash = Some("abc".into());
        assert!(record.upload_hash_matches("abc"));
        assert!(!record.upload_hash_matches("def"));
    }
}
