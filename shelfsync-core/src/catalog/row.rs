use chrono::{DateTime, Utc};
use shelfsync_model::{ErrorClass, FileRecord, FsmState, RelPath};

use crate::error::{CoreError, Result};

/// Raw row shape as stored in SQLite. Timestamps are persisted as RFC 3339
/// strings; `fsm_state` as its `SCREAMING_SNAKE_CASE` tag.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FileRecordRow {
    pub file_path: String,
    pub content_hash: String,
    pub size: i64,
    pub mtime: f64,
    pub fsm_state: String,
    pub version: i64,
    pub remote_raw_id: Option<String>,
    pub remote_doc_id: Option<String>,
    pub orphan_raw_id: Option<String>,
    pub missing_since: Option<String>,
    pub upload_hash: Option<String>,
    pub enrichment_version: Option<String>,
    pub error_reason: Option<String>,
    pub error_class: Option<String>,
    pub attempt_count: i64,
    pub remote_expiration: Option<String>,
}

fn parse_timestamp(raw: &Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| CoreError::Internal(format!("malformed {field} timestamp {s:?}: {e}"))),
    }
}

impl FileRecordRow {
    pub(crate) fn into_record(self) -> Result<FileRecord> {
        let fsm_state = FsmState::parse(&self.fsm_state)
            .ok_or_else(|| CoreError::Internal(format!("unknown fsm_state {:?}", self.fsm_state)))?;
        let error_class = match &self.error_class {
            None => None,
            Some(s) => Some(ErrorClass::parse(s).ok_or_else(|| CoreError::Internal(format!("unknown error_class {s:?}")))?),
        };
        Ok(FileRecord {
            file_path: RelPath::from(self.file_path),
            content_hash: self.content_hash,
            size: self.size as u64,
            mtime: self.mtime,
            fsm_state,
            version: self.version,
            remote_raw_id: self.remote_raw_id,
            remote_doc_id: self.remote_doc_id,
            orphan_raw_id: self.orphan_raw_id,
            missing_since: parse_timestamp(&self.missing_since, "missing_since")?,
            upload_hash: self.upload_hash,
            enrichment_version: self.enrichment_version,
            error_reason: self.error_reason,
            error_class,
            attempt_count: self.attempt_count,
            remote_expiration: parse_timestamp(&self.remote_expiration, "remote_expiration")?,
        })
    }
}

pub(crate) fn fmt_timestamp(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}
