//! Sole owner of durable state.
//!
//! Every mutation to a [`shelfsync_model::FileRecord`] goes through
//! [`Catalog::begin_transition`] / [`Catalog::commit_transition`], which
//! enforce optimistic concurrency and maintain the append-only intent
//! log and transition audit trail in the same database transaction as the
//! state change itself.

mod row;

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use shelfsync_model::{AttemptId, FileRecord, FsmState, OccToken, RelPath};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, Result};
use row::{fmt_timestamp, FileRecordRow};

/// An open write-ahead-log intent together with the OCC snapshot it was
/// opened against. Returned by [`Catalog::begin_transition`] and required
/// by [`Catalog::commit_transition`].
#[derive(Debug, Clone)]
pub struct TransitionSnapshot {
    pub record: FileRecord,
    pub token: OccToken,
    pub attempt_id: AttemptId,
}

/// Field-level updates applied by a successful [`Catalog::commit_transition`].
/// `None` leaves the corresponding column untouched.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub fsm_state: FsmState,
    pub remote_raw_id: Option<Option<String>>,
    pub remote_doc_id: Option<Option<String>>,
    pub orphan_raw_id: Option<Option<String>>,
    pub upload_hash: Option<Option<String>>,
    pub enrichment_version: Option<Option<String>>,
    pub error_reason: Option<Option<String>>,
    pub error_class: Option<Option<String>>,
    pub remote_expiration: Option<Option<chrono::DateTime<Utc>>>,
    pub bump_attempt_count: bool,
}

impl TransitionUpdate {
    pub fn to(fsm_state: FsmState) -> Self {
        Self {
            fsm_state,
            ..Default::default()
        }
    }

    pub fn with_remote_raw_id(mut self, id: impl Into<String>) -> Self {
        self.remote_raw_id = Some(Some(id.into()));
        self
    }

    pub fn with_remote_doc_id(mut self, id: impl Into<String>) -> Self {
        self.remote_doc_id = Some(Some(id.into()));
        self
    }

    pub fn with_orphan_raw_id(mut self, id: Option<String>) -> Self {
        self.orphan_raw_id = Some(id);
        self
    }

    pub fn with_upload_hash(mut self, hash: impl Into<String>) -> Self {
        self.upload_hash = Some(Some(hash.into()));
        self
    }

    pub fn with_enrichment_version(mut self, version: impl Into<String>) -> Self {
        self.enrichment_version = Some(Some(version.into()));
        self
    }

    pub fn with_error_reason(mut self, reason: impl Into<String>) -> Self {
        self.error_reason = Some(Some(reason.into()));
        self
    }

    pub fn clearing_error_reason(mut self) -> Self {
        self.error_reason = Some(None);
        self
    }

    pub fn with_error_class(mut self, class: shelfsync_model::ErrorClass) -> Self {
        self.error_class = Some(Some(class.as_str().to_string()));
        self
    }

    pub fn clearing_error_class(mut self) -> Self {
        self.error_class = Some(None);
        self
    }

    pub fn with_remote_expiration(mut self, expires_at: chrono::DateTime<Utc>) -> Self {
        self.remote_expiration = Some(Some(expires_at));
        self
    }

    pub fn counting_attempt(mut self) -> Self {
        self.bump_attempt_count = true;
        self
    }
}

/// Outcome of [`Catalog::commit_transition`]: either the snapshot still
/// matched and the update applied, or another writer raced ahead.
#[derive(Debug)]
pub enum CommitOutcome {
    Committed(FileRecord),
    Conflict,
}

/// An intent row whose side effect was never finalized, surfaced to the
/// Orchestrator's startup recovery sweep.
#[derive(Debug, Clone)]
pub struct OpenIntent {
    pub file_path: RelPath,
    pub intended_state: FsmState,
    pub attempt_id: AttemptId,
    pub current_state: FsmState,
}

/// Durable per-file record store, backed by a local SQLite database running
/// in write-ahead-log mode.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

impl Catalog {
    /// Open (creating if absent) the catalog database at `path` and run any
    /// pending migrations. The schema version is tracked via SQLite's
    /// `user_version` pragma, auto-migrated on open.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| CoreError::Config(format!("invalid catalog path {path:?}: {e}")))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("journal_mode", "WAL")
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!("catalog opened and migrated");
        Ok(Self { pool })
    }

    /// Open an in-memory catalog, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Records whose `fsm_state` is one of `states`, oldest-touched first,
    /// limited to `limit`. Applies the idempotency gate: a record whose
    /// `upload_hash` already matches its current `content_hash` is
    /// excluded (it has nothing new to submit).
    #[instrument(skip(self))]
    pub async fn load_pending(&self, states: &[FsmState], limit: i64) -> Result<Vec<FileRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT file_path, content_hash, size, mtime, fsm_state, version, remote_raw_id, \
             remote_doc_id, orphan_raw_id, missing_since, upload_hash, enrichment_version, \
             error_reason, error_class, attempt_count, remote_expiration FROM file_records WHERE fsm_state IN (",
        );
        let mut separated = qb.separated(", ");
        for state in states {
            separated.push_bind(state.as_str());
        }
        qb.push(") AND (upload_hash IS NULL OR upload_hash <> content_hash) ORDER BY file_path LIMIT ");
        qb.push_bind(limit);

        let rows: Vec<FileRecordRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(FileRecordRow::into_record).collect()
    }

    /// All records whose `fsm_state` is one of `states`, with no idempotency
    /// filtering — used by bookkeeping passes (missing detection, TTL
    /// requeue) that need the full set rather than the dispatch-eligible
    /// subset.
    pub async fn load_by_states(&self, states: &[FsmState], limit: i64) -> Result<Vec<FileRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT file_path, content_hash, size, mtime, fsm_state, version, remote_raw_id, \
             remote_doc_id, orphan_raw_id, missing_since, upload_hash, enrichment_version, \
             error_reason, error_class, attempt_count, remote_expiration FROM file_records WHERE fsm_state IN (",
        );
        let mut separated = qb.separated(", ");
        for state in states {
            separated.push_bind(state.as_str());
        }
        qb.push(") ORDER BY file_path LIMIT ");
        qb.push_bind(limit);

        let rows: Vec<FileRecordRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(FileRecordRow::into_record).collect()
    }

    /// Records with a pending orphan cleanup obligation.
    pub async fn load_orphans(&self) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRecordRow> = sqlx::query_as(
            "SELECT file_path, content_hash, size, mtime, fsm_state, version, remote_raw_id, \
             remote_doc_id, orphan_raw_id, missing_since, upload_hash, enrichment_version, \
             error_reason, error_class, attempt_count, remote_expiration FROM file_records \
             WHERE orphan_raw_id IS NOT NULL ORDER BY file_path",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FileRecordRow::into_record).collect()
    }

    /// Insert a brand-new UNTRACKED record discovered by change classification.
    pub async fn insert_new(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_records (file_path, content_hash, size, mtime, fsm_state, version, \
             attempt_count) VALUES (?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(record.file_path.as_str())
        .bind(&record.content_hash)
        .bind(record.size as i64)
        .bind(record.mtime)
        .bind(record.fsm_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, file_path: &RelPath) -> Result<Option<FileRecord>> {
        let row: Option<FileRecordRow> = sqlx::query_as(
            "SELECT file_path, content_hash, size, mtime, fsm_state, version, remote_raw_id, \
             remote_doc_id, orphan_raw_id, missing_since, upload_hash, enrichment_version, \
             error_reason, error_class, attempt_count, remote_expiration FROM file_records WHERE file_path = ?",
        )
        .bind(file_path.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileRecordRow::into_record).transpose()
    }

    /// Read the current record and open a write-ahead intent for
    /// `intended_state`, both within the same transaction.
    #[instrument(skip(self))]
    pub async fn begin_transition(
        &self,
        file_path: &RelPath,
        intended_state: FsmState,
    ) -> Result<TransitionSnapshot> {
        let mut tx = self.pool.begin().await?;

        let row: Option<FileRecordRow> = sqlx::query_as(
            "SELECT file_path, content_hash, size, mtime, fsm_state, version, remote_raw_id, \
             remote_doc_id, orphan_raw_id, missing_since, upload_hash, enrichment_version, \
             error_reason, error_class, attempt_count, remote_expiration FROM file_records WHERE file_path = ?",
        )
        .bind(file_path.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let record = row
            .ok_or_else(|| CoreError::Internal(format!("no such record: {file_path}")))?
            .into_record()?;
        let token = record.occ_token();
        let attempt_id = AttemptId::new();

        sqlx::query(
            "INSERT INTO upload_intents (file_path, intended_state, attempt_id, started_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(file_path.as_str())
        .bind(intended_state.as_str())
        .bind(attempt_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TransitionSnapshot {
            record,
            token,
            attempt_id,
        })
    }

    /// Apply `update` iff the record still matches `snapshot.token`.
    /// On success: bumps `version`, finalizes the matching intent row, and
    /// appends a `state_transitions` audit row, all in one transaction.
    #[instrument(skip(self, snapshot, update))]
    pub async fn commit_transition(
        &self,
        snapshot: &TransitionSnapshot,
        update: TransitionUpdate,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;
        let path = snapshot.record.file_path.as_str();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE file_records SET ");
        let mut separated = qb.separated(", ");
        separated.push("fsm_state = ");
        separated.push_bind_unseparated(update.fsm_state.as_str());
        separated.push("version = version + 1");
        if update.bump_attempt_count {
            separated.push("attempt_count = attempt_count + 1");
        }
        if let Some(v) = &update.remote_raw_id {
            separated.push("remote_raw_id = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.remote_doc_id {
            separated.push("remote_doc_id = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.orphan_raw_id {
            separated.push("orphan_raw_id = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.upload_hash {
            separated.push("upload_hash = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.enrichment_version {
            separated.push("enrichment_version = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.error_reason {
            separated.push("error_reason = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.error_class {
            separated.push("error_class = ");
            separated.push_bind_unseparated(v.clone());
        }
        if let Some(v) = &update.remote_expiration {
            separated.push("remote_expiration = ");
            separated.push_bind_unseparated(fmt_timestamp(*v));
        }
        qb.push(" WHERE file_path = ");
        qb.push_bind(path);
        qb.push(" AND fsm_state = ");
        qb.push_bind(snapshot.token.state.as_str());
        qb.push(" AND version = ");
        qb.push_bind(snapshot.token.version);

        let outcome = qb.build().execute(&mut *tx).await?;
        if outcome.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(file_path = %path, "transition conflict");
            return Ok(CommitOutcome::Conflict);
        }

        sqlx::query(
            "INSERT INTO state_transitions (file_path, from_state, to_state, occurred_at, attempt_id) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(path)
        .bind(snapshot.token.state.as_str())
        .bind(update.fsm_state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(snapshot.attempt_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE upload_intents SET finalized_at = ? WHERE file_path = ? AND attempt_id = ? \
             AND finalized_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(path)
        .bind(snapshot.attempt_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let new_record = self
            .get(&snapshot.record.file_path)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("record vanished after commit: {path}")))?;
        Ok(CommitOutcome::Committed(new_record))
    }

    /// Mark paths absent from the last scan. This is bookkeeping, not an
    /// FSM transition, so it does not bump `version` or write an intent.
    pub async fn mark_missing(&self, paths: &[RelPath]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for path in paths {
            sqlx::query(
                "UPDATE file_records SET missing_since = ? WHERE file_path = ? AND missing_since IS NULL",
            )
            .bind(&now)
            .bind(path.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Clear the missing flag for a path that has reappeared on disk.
    pub async fn clear_missing(&self, path: &RelPath) -> Result<()> {
        sqlx::query("UPDATE file_records SET missing_since = NULL WHERE file_path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Paths missing longer than `window`, for the operator-opted prune step.
    pub async fn load_missing_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRecordRow> = sqlx::query_as(
            "SELECT file_path, content_hash, size, mtime, fsm_state, version, remote_raw_id, \
             remote_doc_id, orphan_raw_id, missing_since, upload_hash, enrichment_version, \
             error_reason, error_class, attempt_count, remote_expiration FROM file_records \
             WHERE missing_since IS NOT NULL AND missing_since < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FileRecordRow::into_record).collect()
    }

    /// Delete a record outright, used by the prune step after the remote
    /// document has been removed.
    pub async fn delete(&self, path: &RelPath) -> Result<()> {
        sqlx::query("DELETE FROM file_records WHERE file_path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Force a record directly to FAILED outside the normal begin/commit
    /// cycle, used by the startup recovery sweep when an open intent's
    /// side effect is confirmed not to have happened.
    pub async fn mark_error(&self, path: &RelPath, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE file_records SET fsm_state = ?, error_reason = ?, version = version + 1 \
             WHERE file_path = ?",
        )
        .bind(FsmState::Failed.as_str())
        .bind(reason)
        .bind(path.as_str())
        .execute(&self.pool)
        .await?;
        warn!(file_path = %path, reason, "record marked FAILED by recovery sweep");
        Ok(())
    }

    /// Force a record directly to a resolved state, used by the recovery
    /// sweep when it confirms the intended side effect did happen.
    pub async fn force_state(&self, path: &RelPath, state: FsmState, remote_doc_id: Option<String>) -> Result<()> {
        sqlx::query(
            "UPDATE file_records SET fsm_state = ?, remote_doc_id = COALESCE(?, remote_doc_id), \
             version = version + 1 WHERE file_path = ?",
        )
        .bind(state.as_str())
        .bind(remote_doc_id)
        .bind(path.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open (unfinalized) intents whose owning record is still in a
    /// non-terminal pre-state, surfaced to the startup recovery sweep.
    pub async fn load_open_intents(&self) -> Result<Vec<OpenIntent>> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT i.file_path, i.intended_state, i.attempt_id, r.fsm_state \
             FROM upload_intents i JOIN file_records r ON r.file_path = i.file_path \
             WHERE i.finalized_at IS NULL \
             AND r.fsm_state IN ('UNTRACKED', 'UPLOADING', 'PROCESSING')",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(file_path, intended_state, attempt_id, current_state)| {
                Ok(OpenIntent {
                    file_path: RelPath::from(file_path),
                    intended_state: FsmState::parse(&intended_state)
                        .ok_or_else(|| CoreError::Internal(format!("unknown intended_state {intended_state:?}")))?,
                    attempt_id: AttemptId(
                        uuid::Uuid::parse_str(&attempt_id)
                            .map_err(|e| CoreError::Internal(format!("malformed attempt_id: {e}")))?,
                    ),
                    current_state: FsmState::parse(&current_state)
                        .ok_or_else(|| CoreError::Internal(format!("unknown fsm_state {current_state:?}")))?,
                })
            })
            .collect()
    }

    /// Persistently bind the local corpus to a remote store name, or read
    /// any other library-config key.
    pub async fn set_library_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO library_config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_library_config(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM library_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Counts per `fsm_state`, for the `status` CLI surface.
    pub async fn state_counts(&self) -> Result<Vec<(FsmState, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT fsm_state, COUNT(*) FROM file_records GROUP BY fsm_state")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(state, count)| {
                FsmState::parse(&state)
                    .map(|s| (s, count))
                    .ok_or_else(|| CoreError::Internal(format!("unknown fsm_state {state:?}")))
            })
            .collect()
    }

    pub async fn orphan_backlog(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM file_records WHERE orphan_raw_id IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}
