//! Per-file lifecycle state machine.
//!
//! Each `transition_*` method is one edge of the FSM transition table: it
//! opens an OCC snapshot, performs the transition's side effect against
//! [`RemoteClient`], and commits the result. A conflicting commit is
//! retried internally with jittered exponential back-off, capped at five
//! attempts; conflicts are never surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use shelfsync_model::{ErrorClass, FileRecord, FsmState, RelPath};
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Catalog, CommitOutcome, TransitionSnapshot, TransitionUpdate};
use crate::error::{CoreError, Result};
use crate::rate_guard::{Outcome, RateGuard, Ticket};
use crate::remote::{split_doc_id, DocumentStatus, OperationHandle, RemoteClient};

const MAX_OCC_ATTEMPTS: u32 = 5;
const OCC_BACKOFF_BASE: Duration = Duration::from_millis(20);
const OCC_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Outcome of driving one record through a single FSM edge.
#[derive(Debug)]
pub enum StepOutcome {
    Advanced(FileRecord),
    /// The side effect itself failed (transient or permanent); the record
    /// was moved to FAILED with `error_reason`/`error_class` set.
    Failed(FileRecord),
    /// RateGuard denied every remote call this edge needed before any of
    /// them ran; the record is untouched and stays eligible for the next
    /// dispatch pass.
    Skipped,
}

/// Result of a RateGuard-gated remote call: either it ran (with a typed
/// `Result` of its own), or RateGuard denied it outright.
enum Gated<T> {
    Go(T),
    Skip,
}

fn outcome_for(error: &CoreError) -> Outcome {
    match error.error_class() {
        ErrorClass::RateLimited => Outcome::RateLimited,
        ErrorClass::ServerError => Outcome::ServerError,
        ErrorClass::Permanent => Outcome::OtherError,
    }
}

/// Per-file lifecycle state machine, operating against a [`Catalog`] and a
/// [`RemoteClient`], with every remote call individually paced and
/// circuit-broken through a [`RateGuard`].
#[derive(Clone)]
pub struct Fsm {
    catalog: Catalog,
    remote: Arc<dyn RemoteClient>,
    rate_guard: Arc<RateGuard>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm").finish_non_exhaustive()
    }
}

impl Fsm {
    pub fn new(catalog: Catalog, remote: Arc<dyn RemoteClient>, rate_guard: Arc<RateGuard>) -> Self {
        Self { catalog, remote, rate_guard }
    }

    /// Acquire a RateGuard ticket for one remote call and record its
    /// outcome immediately after, so pacing and circuit-breaking apply per
    /// call rather than once per dispatched record.
    async fn gated<T, F, Fut>(&self, call: F) -> Result<Gated<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if matches!(self.rate_guard.acquire().await, Ticket::Skip) {
            return Ok(Gated::Skip);
        }
        match call().await {
            Ok(value) => {
                self.rate_guard.record(Outcome::Success).await;
                Ok(Gated::Go(value))
            }
            Err(e) => {
                self.rate_guard.record(outcome_for(&e)).await;
                Err(e)
            }
        }
    }

    /// Retry `commit` against a fresh OCC snapshot on conflict: jittered
    /// exponential back-off, cap 1s, at most 5 attempts.
    async fn with_occ_retry<F, Fut>(&self, file_path: &RelPath, intended_state: FsmState, mut op: F) -> Result<FileRecord>
    where
        F: FnMut(TransitionSnapshot) -> Fut,
        Fut: std::future::Future<Output = Result<TransitionUpdate>>,
    {
        let mut attempt = 0u32;
        loop {
            let snapshot = self.catalog.begin_transition(file_path, intended_state).await?;
            let update = op(snapshot.clone()).await?;
            match self.catalog.commit_transition(&snapshot, update).await? {
                CommitOutcome::Committed(record) => return Ok(record),
                CommitOutcome::Conflict => {
                    attempt += 1;
                    if attempt >= MAX_OCC_ATTEMPTS {
                        return Err(CoreError::OccConflict(file_path.to_string()));
                    }
                    let backoff = occ_backoff(attempt);
                    debug!(file_path = %file_path, attempt, ?backoff, "OCC conflict, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// UNTRACKED --begin-upload--> UPLOADING. Guard: `upload_hash ≠
    /// desired_hash`, enforced by the caller via
    /// [`Catalog::load_pending`]'s filter.
    #[instrument(skip(self, bytes))]
    pub async fn transition_begin_upload(
        &self,
        file_path: &RelPath,
        bytes: Vec<u8>,
        upload_hash: String,
        enrichment_version: Option<String>,
    ) -> Result<StepOutcome> {
        let display_name = file_path.to_string();
        match self.gated(|| self.remote.upload_raw(bytes, &display_name)).await {
            Ok(Gated::Go(raw_id)) => {
                let mut update = TransitionUpdate::to(FsmState::Uploading)
                    .with_remote_raw_id(raw_id)
                    .with_upload_hash(upload_hash)
                    .counting_attempt();
                if let Some(v) = enrichment_version {
                    update = update.with_enrichment_version(v);
                }
                let record = self
                    .commit_once(file_path, FsmState::Uploading, update)
                    .await?;
                Ok(StepOutcome::Advanced(record))
            }
            Ok(Gated::Skip) => Ok(StepOutcome::Skipped),
            Err(e) => {
                let record = self.fail(file_path, FsmState::Uploading, &e).await?;
                Ok(StepOutcome::Failed(record))
            }
        }
    }

    /// UPLOADING --raw-accepted--> PROCESSING.
    #[instrument(skip(self))]
    pub async fn transition_raw_accepted(&self, file_path: &RelPath, raw_id: &str, store: &str, timeout: Duration) -> Result<StepOutcome> {
        match self.gated(|| import_with_timeout(&*self.remote, raw_id, store, timeout)).await {
            Ok(Gated::Go(_operation)) => {
                let update = TransitionUpdate::to(FsmState::Processing);
                let record = self
                    .commit_once(file_path, FsmState::Processing, update)
                    .await?;
                Ok(StepOutcome::Advanced(record))
            }
            Ok(Gated::Skip) => Ok(StepOutcome::Skipped),
            Err(e) => {
                let record = self.fail(file_path, FsmState::Processing, &e).await?;
                Ok(StepOutcome::Failed(record))
            }
        }
    }

    /// Re-initiates import on an already-UPLOADING/PROCESSING raw artifact
    /// to obtain a fresh operation handle; the backend treats repeated
    /// imports of an already-active raw artifact as a no-op. `None` means
    /// RateGuard denied the call; the caller should leave the record
    /// untouched for the next pass.
    pub async fn reimport_for_visibility(&self, raw_id: &str, store: &str, timeout: Duration) -> Result<Option<OperationHandle>> {
        match self.gated(|| import_with_timeout(&*self.remote, raw_id, store, timeout)).await? {
            Gated::Go(operation) => Ok(Some(operation)),
            Gated::Skip => Ok(None),
        }
    }

    /// PROCESSING --visible--> INDEXED. Guard: a successful `get_document`
    /// or a positive entry in `list_store_documents` following completed
    /// import.
    #[instrument(skip(self))]
    pub async fn transition_visible(
        &self,
        file_path: &RelPath,
        store: &str,
        operation: &OperationHandle,
        timeout: Duration,
    ) -> Result<StepOutcome> {
        let doc_id = match self.gated(|| self.remote.await_operation(operation, timeout)).await {
            Ok(Gated::Go(id)) => id,
            Ok(Gated::Skip) => return Ok(StepOutcome::Skipped),
            Err(e) => {
                let record = self.fail(file_path, FsmState::Indexed, &e).await?;
                return Ok(StepOutcome::Failed(record));
            }
        };

        match self.gated(|| self.remote.get_document(store, &doc_id)).await {
            Ok(Gated::Go(DocumentStatus::Present)) => {
                let update = TransitionUpdate::to(FsmState::Indexed).with_remote_doc_id(doc_id);
                let record = self
                    .commit_once(file_path, FsmState::Indexed, update)
                    .await?;
                Ok(StepOutcome::Advanced(record))
            }
            Ok(Gated::Go(DocumentStatus::NotFound)) => match self.gated(|| self.remote.list_store_documents(store)).await {
                Ok(Gated::Go(listed)) => {
                    if let Some(found) = listed.into_iter().find(|d| d.doc_id == doc_id) {
                        let update = TransitionUpdate::to(FsmState::Indexed).with_remote_doc_id(found.doc_id);
                        let record = self
                            .commit_once(file_path, FsmState::Indexed, update)
                            .await?;
                        Ok(StepOutcome::Advanced(record))
                    } else {
                        let record = self
                            .fail(file_path, FsmState::Indexed, &CoreError::Internal("import completed but document not visible".into()))
                            .await?;
                        Ok(StepOutcome::Failed(record))
                    }
                }
                Ok(Gated::Skip) => Ok(StepOutcome::Skipped),
                Err(e) => {
                    let record = self.fail(file_path, FsmState::Indexed, &e).await?;
                    Ok(StepOutcome::Failed(record))
                }
            },
            Ok(Gated::Skip) => Ok(StepOutcome::Skipped),
            Err(e) => {
                let record = self.fail(file_path, FsmState::Indexed, &e).await?;
                Ok(StepOutcome::Failed(record))
            }
        }
    }

    /// FAILED --retry--> UNTRACKED. Idempotency-safe reset: counters are
    /// preserved, only `fsm_state` and `error_reason` change.
    #[instrument(skip(self))]
    pub async fn transition_retry_failed(&self, file_path: &RelPath) -> Result<FileRecord> {
        self.with_occ_retry(file_path, FsmState::Untracked, |_snapshot| async move {
            Ok(TransitionUpdate::to(FsmState::Untracked)
                .clearing_error_reason()
                .clearing_error_class())
        })
        .await
    }

    /// INDEXED --replace--> UPLOADING: steps (a)-(c) of the upload-first
    /// replacement protocol. Side effect is the same "upload new raw" as
    /// [`Self::transition_begin_upload`]; the commit additionally moves the
    /// old `remote_raw_id` to `orphan_raw_id` under OCC (step (c)). The
    /// record then re-enters the ordinary pipeline (raw-accepted, visible)
    /// exactly like a fresh upload.
    ///
    /// Once the commit lands, this also attempts steps (d)/(e) inline —
    /// delete the old document and raw artifact, then clear
    /// `orphan_raw_id` — so a normal run finishes cleanup in the same
    /// dispatch rather than waiting on the next reconciliation pass. If
    /// the delete fails (or the process crashes before it runs), the
    /// orphan is left in place and [`crate::reconciler::SyncReconciler`]'s
    /// drain sweeps it up on the next run.
    #[instrument(skip(self, bytes))]
    pub async fn transition_replace(
        &self,
        file_path: &RelPath,
        bytes: Vec<u8>,
        new_upload_hash: String,
        enrichment_version: Option<String>,
        store: &str,
    ) -> Result<StepOutcome> {
        let display_name = file_path.to_string();
        match self.gated(|| self.remote.upload_raw(bytes, &display_name)).await {
            Ok(Gated::Go(new_raw_id)) => {
                let record = self
                    .with_occ_retry(file_path, FsmState::Uploading, |snapshot| {
                        let new_raw_id = new_raw_id.clone();
                        let new_upload_hash = new_upload_hash.clone();
                        let enrichment_version = enrichment_version.clone();
                        async move {
                            let old_raw_id = snapshot.record.remote_raw_id.clone();
                            let mut update = TransitionUpdate::to(FsmState::Uploading)
                                .with_remote_raw_id(new_raw_id)
                                .with_upload_hash(new_upload_hash)
                                .with_orphan_raw_id(old_raw_id)
                                .counting_attempt();
                            if let Some(v) = enrichment_version {
                                update = update.with_enrichment_version(v);
                            }
                            Ok(update)
                        }
                    })
                    .await?;
                self.try_drain_replacement_orphan(&record, store).await;
                Ok(StepOutcome::Advanced(record))
            }
            Ok(Gated::Skip) => Ok(StepOutcome::Skipped),
            Err(e) => {
                let record = self.fail(file_path, FsmState::Uploading, &e).await?;
                Ok(StepOutcome::Failed(record))
            }
        }
    }

    /// Best-effort steps (d)/(e) right after a replacement commit: delete
    /// the record's old document/raw and clear `orphan_raw_id`. Failure is
    /// swallowed — the orphan stays queued for the next reconciliation
    /// sweep rather than failing the record that just successfully
    /// advanced.
    async fn try_drain_replacement_orphan(&self, record: &FileRecord, store: &str) {
        let Some(orphan_raw_id) = record.orphan_raw_id.clone() else {
            return;
        };
        let (doc_prefix, _) = record
            .remote_doc_id
            .as_deref()
            .map(split_doc_id)
            .unwrap_or((orphan_raw_id.as_str(), ""));
        let doc_prefix = doc_prefix.to_string();

        let result = async {
            match self.gated(|| self.remote.delete_document(store, &doc_prefix)).await? {
                Gated::Go(()) => {}
                Gated::Skip => return Ok(false),
            }
            match self.gated(|| self.remote.delete_raw(&orphan_raw_id)).await? {
                Gated::Go(()) => {}
                Gated::Skip => return Ok(false),
            }
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => {
                if let Err(e) = self.clear_orphan(&record.file_path, record.fsm_state).await {
                    warn!(file_path = %record.file_path, error = %e, "failed to clear orphan marker after inline drain");
                }
            }
            Ok(false) => {
                debug!(file_path = %record.file_path, "inline orphan drain rate-limited, leaving for next reconciliation sweep");
            }
            Err(e) => {
                warn!(file_path = %record.file_path, error = %e, "inline orphan drain failed, leaving for next reconciliation sweep");
            }
        }
    }

    async fn clear_orphan(&self, file_path: &RelPath, current_state: FsmState) -> Result<()> {
        let snapshot = self.catalog.begin_transition(file_path, current_state).await?;
        let update = TransitionUpdate::to(snapshot.token.state).with_orphan_raw_id(None);
        match self.catalog.commit_transition(&snapshot, update).await? {
            CommitOutcome::Committed(_) => Ok(()),
            CommitOutcome::Conflict => Ok(()),
        }
    }

    /// Direct commit without OCC retry, for single-shot transitions whose
    /// side effect has already happened and which the caller wants to
    /// surface a conflict for immediately (dispatch loop handles the retry
    /// at a higher level for these).
    async fn commit_once(&self, file_path: &RelPath, intended_state: FsmState, update: TransitionUpdate) -> Result<FileRecord> {
        let snapshot = self.catalog.begin_transition(file_path, intended_state).await?;
        match self.catalog.commit_transition(&snapshot, update).await? {
            CommitOutcome::Committed(record) => Ok(record),
            CommitOutcome::Conflict => Err(CoreError::OccConflict(file_path.to_string())),
        }
    }

    async fn fail(&self, file_path: &RelPath, intended_state: FsmState, error: &CoreError) -> Result<FileRecord> {
        let reason = error.to_string();
        let class = error.error_class();
        warn!(file_path = %file_path, reason = %reason, error_class = %class, "transition failed, record entering FAILED");
        let update = TransitionUpdate::to(FsmState::Failed)
            .with_error_reason(reason)
            .with_error_class(class)
            .counting_attempt();
        self.commit_once(file_path, intended_state, update).await
    }
}

async fn import_with_timeout(remote: &dyn RemoteClient, raw_id: &str, store: &str, timeout: Duration) -> Result<OperationHandle> {
    tokio::time::timeout(timeout, remote.import_into_store(raw_id, store))
        .await
        .map_err(|_| CoreError::Timeout(format!("import_into_store timed out after {timeout:?}")))?
}

fn occ_backoff(attempt: u32) -> Duration {
    let base = OCC_BACKOFF_BASE.mul_f64(2f64.powi(attempt as i32 - 1));
    let capped = base.min(OCC_BACKOFF_CAP);
    let jitter_ms = rand::rng().random_range(0..=(capped.as_millis() as u64 / 4).max(1));
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteClient;
    use shelfsync_model::FsmState;

    #[test]
    fn backoff_never_exceeds_cap_plus_jitter_bound() {
        for attempt in 1..=5 {
            let d = occ_backoff(attempt);
            assert!(d <= OCC_BACKOFF_CAP + Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn begin_upload_advances_untracked_record_to_uploading() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let path = RelPath::from("a.txt");
        let record = FileRecord::new_untracked(path.clone(), "hash-a".into(), 100, 0.0);
        catalog.insert_new(&record).await.unwrap();

        let mut remote = MockRemoteClient::new();
        remote
            .expect_upload_raw()
            .times(1)
            .returning(|_bytes, _name| Ok("raw-123".to_string()));

        let fsm = Fsm::new(catalog.clone(), Arc::new(remote), Arc::new(RateGuard::new(test_rate_guard_config())));
        let outcome = fsm
            .transition_begin_upload(&path, b"hello".to_vec(), "upload-hash-1".into(), None)
            .await
            .unwrap();

        match outcome {
            StepOutcome::Advanced(record) => {
                assert_eq!(record.fsm_state, FsmState::Uploading);
                assert_eq!(record.remote_raw_id.as_deref(), Some("raw-123"));
                assert_eq!(record.version, 1);
            }
            other => panic!("expected advance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn begin_upload_moves_record_to_failed_on_remote_error() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let path = RelPath::from("b.txt");
        let record = FileRecord::new_untracked(path.clone(), "hash-b".into(), 10, 0.0);
        catalog.insert_new(&record).await.unwrap();

        let mut remote = MockRemoteClient::new();
        remote.expect_upload_raw().times(1).returning(|_, _| {
            Err(CoreError::RemotePermanent {
                status: 400,
                body: "bad request".into(),
            })
        });

        let fsm = Fsm::new(catalog.clone(), Arc::new(remote), Arc::new(RateGuard::new(test_rate_guard_config())));
        let outcome = fsm
            .transition_begin_upload(&path, b"bytes".to_vec(), "upload-hash-2".into(), None)
            .await
            .unwrap();

        match outcome {
            StepOutcome::Failed(record) => {
                assert_eq!(record.fsm_state, FsmState::Failed);
                assert!(record.error_reason.is_some());
                assert_eq!(record.error_class, Some(ErrorClass::Permanent));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    fn test_rate_guard_config() -> crate::rate_guard::RateGuardConfig {
        crate::rate_guard::RateGuardConfig {
            min_interval: Duration::from_millis(0),
            ..Default::default()
        }
    }
}
