//! Bounded-concurrency driver: pulls pending work from the Catalog, gates
//! it through RateGuard, and runs each record through the FSM. Owns the
//! startup recovery sweep and the post-batch retry pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shelfsync_model::{ChangeSet, ErrorClass, FileRecord, FsmState, RelPath};
use tokio::sync::Notify;
use tracing::{debug_span, info, instrument, Instrument};

use crate::catalog::Catalog;
use crate::error::{CoreError, Result};
use crate::fsm::{Fsm, StepOutcome};
use crate::rate_guard::RateGuard;
use crate::remote::RemoteClient;

/// Tunables for a single Orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Initial/default value of the dynamic concurrency limit. Empirical
    /// sweet spot is 10; 1 and 50 are the measured bracket.
    pub concurrency_limit: usize,
    pub batch_limit: i64,
    pub import_timeout: Duration,
    pub visibility_timeout: Duration,
    pub post_batch_cooldown: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            batch_limit: 256,
            import_timeout: Duration::from_secs(120),
            visibility_timeout: Duration::from_secs(300),
            post_batch_cooldown: Duration::from_secs(30),
        }
    }
}

/// A shrinkable concurrency limit. `tokio::sync::Semaphore` cannot revoke
/// permits already handed out, so the limit here is advisory: callers check
/// `active < limit` before acquiring, and in-flight work that already holds
/// a permit is never interrupted by a limit decrease.
#[derive(Debug)]
pub struct DynamicSemaphore {
    limit: AtomicUsize,
    active: AtomicUsize,
    notify: Notify,
}

impl DynamicSemaphore {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit.max(1)),
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn set_limit(&self, new_limit: usize) {
        self.limit.store(new_limit.max(1), Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Blocks until `active_count < limit`, then occupies a slot.
    pub async fn acquire(self: &Arc<Self>) -> DynamicPermit {
        loop {
            let limit = self.limit.load(Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst);
            if active < limit {
                return DynamicPermit { sem: self.clone() };
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.notify.notified().await;
        }
    }
}

#[derive(Debug)]
pub struct DynamicPermit {
    sem: Arc<DynamicSemaphore>,
}

impl Drop for DynamicPermit {
    fn drop(&mut self) {
        self.sem.active.fetch_sub(1, Ordering::SeqCst);
        self.sem.notify.notify_waiters();
    }
}

/// Cooperative two-signal cancellation: `stop_accepting` gates input,
/// `force_kill` terminates output.
#[derive(Debug, Default)]
pub struct CancellationSignals {
    stop_accepting: AtomicBool,
    force_kill: AtomicBool,
}

impl CancellationSignals {
    pub fn stop_accepting(&self) {
        self.stop_accepting.store(true, Ordering::SeqCst);
    }

    pub fn force_kill(&self) {
        self.force_kill.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        !self.stop_accepting.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.force_kill.load(Ordering::SeqCst)
    }
}

/// Per-record outcome recorded in a [`BatchSummary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Indexed,
    Failed,
    Skipped,
}

/// A failed record entry with a short, operator-facing reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    pub file_path: String,
    pub reason: String,
}

const MAX_REPORTED_FAILURES: usize = 50;

/// User-visible failure summary for a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub indexed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<FailedEntry>,
}

impl BatchSummary {
    fn record(&mut self, outcome: RecordOutcome, file_path: &RelPath, reason: Option<String>) {
        match outcome {
            RecordOutcome::Indexed => self.indexed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed => {
                self.failed += 1;
                if self.failures.len() < MAX_REPORTED_FAILURES {
                    self.failures.push(FailedEntry {
                        file_path: file_path.to_string(),
                        reason: reason.unwrap_or_default(),
                    });
                }
            }
        }
    }
}

const MAX_DISPATCH_ATTEMPTS: u32 = 5;

/// The per-record driving logic, factored out so a dispatch task can own a
/// cheap clone of it without reconstructing an [`Orchestrator`].
#[derive(Clone)]
struct RecordDriver {
    fsm: Fsm,
    remote: Arc<dyn RemoteClient>,
    store: String,
    config: OrchestratorConfig,
}

impl RecordDriver {
    /// Drive one record through the next appropriate FSM edge(s) until it
    /// reaches INDEXED or FAILED. `bytes`/`hash` are supplied by the caller
    /// (the outer pipeline owns enrichment and byte decoration).
    async fn process_record(
        &self,
        record: &FileRecord,
        bytes: Vec<u8>,
        upload_hash: String,
        enrichment_version: Option<String>,
    ) -> (RecordOutcome, Option<String>, Option<ErrorClass>) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.drive_once(record, bytes.clone(), upload_hash.clone(), enrichment_version.clone()).await;
            match result {
                Ok(outcome) => return outcome,
                Err(CoreError::OccConflict(_)) if attempt < MAX_DISPATCH_ATTEMPTS => {
                    let backoff = Duration::from_millis(50 * attempt as u64).min(Duration::from_secs(1));
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => return (RecordOutcome::Failed, Some(e.to_string()), Some(e.error_class())),
            }
        }
    }

    async fn drive_once(
        &self,
        record: &FileRecord,
        bytes: Vec<u8>,
        upload_hash: String,
        enrichment_version: Option<String>,
    ) -> Result<(RecordOutcome, Option<String>, Option<ErrorClass>)> {
        let step = match record.fsm_state {
            FsmState::Untracked | FsmState::Failed => {
                if record.fsm_state == FsmState::Failed {
                    self.fsm.transition_retry_failed(&record.file_path).await?;
                }
                self.fsm
                    .transition_begin_upload(&record.file_path, bytes, upload_hash, enrichment_version)
                    .await?
            }
            FsmState::Indexed => {
                if record.upload_hash_matches(&upload_hash) {
                    return Ok((RecordOutcome::Skipped, None, None));
                }
                self.fsm
                    .transition_replace(&record.file_path, bytes, upload_hash, enrichment_version, &self.store)
                    .await?
            }
            FsmState::Uploading => {
                let raw_id = record
                    .remote_raw_id
                    .clone()
                    .ok_or_else(|| CoreError::Internal("UPLOADING record missing remote_raw_id".into()))?;
                self.fsm
                    .transition_raw_accepted(&record.file_path, &raw_id, &self.store, self.config.import_timeout)
                    .await?
            }
            FsmState::Processing => {
                // Re-initiate import to obtain a fresh operation handle; the
                // backend treats repeated imports of an already-active raw
                // artifact as a no-op. Rate-gated the same as any other
                // remote call in this chain.
                let raw_id = record
                    .remote_raw_id
                    .clone()
                    .ok_or_else(|| CoreError::Internal("PROCESSING record missing remote_raw_id".into()))?;
                match self
                    .fsm
                    .reimport_for_visibility(&raw_id, &self.store, self.config.import_timeout)
                    .await?
                {
                    Some(op) => {
                        self.fsm
                            .transition_visible(&record.file_path, &self.store, &op, self.config.visibility_timeout)
                            .await?
                    }
                    None => StepOutcome::Skipped,
                }
            }
        };

        match step {
            StepOutcome::Advanced(advanced) if advanced.fsm_state == FsmState::Indexed => Ok((RecordOutcome::Indexed, None, None)),
            StepOutcome::Advanced(advanced) => {
                // Recurse into the next edge synchronously within this
                // dispatch slot: UNTRACKED->UPLOADING->PROCESSING->INDEXED
                // is one logical dispatch unit from the Orchestrator's view.
                Box::pin(self.drive_once(&advanced, Vec::new(), String::new(), None)).await
            }
            StepOutcome::Failed(failed) => Ok((RecordOutcome::Failed, failed.error_reason.clone(), failed.error_class)),
            StepOutcome::Skipped => Ok((RecordOutcome::Skipped, None, None)),
        }
    }
}

/// Bounded-concurrency driver over a batch of pending [`FileRecord`]s.
pub struct Orchestrator {
    catalog: Catalog,
    driver: RecordDriver,
    remote: Arc<dyn RemoteClient>,
    rate_guard: Arc<RateGuard>,
    store: String,
    config: OrchestratorConfig,
    pub signals: Arc<CancellationSignals>,
    semaphore: Arc<DynamicSemaphore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(catalog: Catalog, remote: Arc<dyn RemoteClient>, rate_guard: Arc<RateGuard>, store: String, config: OrchestratorConfig) -> Self {
        let semaphore = DynamicSemaphore::new(config.concurrency_limit);
        let fsm = Fsm::new(catalog.clone(), remote.clone(), rate_guard.clone());
        let driver = RecordDriver {
            fsm,
            remote: remote.clone(),
            store: store.clone(),
            config: config.clone(),
        };
        Self {
            catalog,
            driver,
            rate_guard,
            store,
            config,
            signals: Arc::new(CancellationSignals::default()),
            semaphore,
        }
    }

    /// Adjust the in-flight concurrency bound. In-flight work already
    /// holding a permit is unaffected.
    pub fn set_concurrency_limit(&self, new_limit: usize) {
        self.semaphore.set_limit(new_limit);
    }

    /// Startup recovery sweep: for each open intent whose record is still
    /// in a non-terminal pre-state, consult the backend to discover
    /// whether the intended side effect actually occurred, and
    /// reconcile accordingly. Must complete before dispatch starts.
    #[instrument(skip(self))]
    pub async fn recovery_sweep(&self) -> Result<usize> {
        let open_intents = self.catalog.load_open_intents().await?;
        let mut reconciled = 0usize;

        for intent in open_intents {
            let span = debug_span!("recovery", file_path = %intent.file_path, intended = %intent.intended_state);
            async {
                match intent.intended_state {
                    FsmState::Uploading | FsmState::Processing => {
                        let listed = self.remote.list_store_documents(&self.store).await.unwrap_or_default();
                        let found = listed.iter().find(|d| d.display_name == intent.file_path.to_string());
                        if let Some(doc) = found {
                            self.catalog
                                .force_state(&intent.file_path, FsmState::Indexed, Some(doc.doc_id.clone()))
                                .await?;
                            info!(file_path = %intent.file_path, "recovery: rolled forward to INDEXED");
                        } else {
                            self.catalog
                                .force_state(&intent.file_path, FsmState::Untracked, None)
                                .await?;
                            info!(file_path = %intent.file_path, "recovery: rolled back to UNTRACKED");
                        }
                    }
                    _ => {}
                }
                Ok::<(), CoreError>(())
            }
            .instrument(span)
            .await?;
            reconciled += 1;
        }

        Ok(reconciled)
    }

    /// Run one full dispatch pass over up to `config.batch_limit` pending
    /// records, respecting the dynamic concurrency limit and RateGuard.
    /// Each record is supplied its current bytes/hash via `loader`.
    #[instrument(skip(self, loader))]
    pub async fn run_batch<L, Fut>(&self, change_set: &ChangeSet, loader: L) -> Result<BatchSummary>
    where
        L: Fn(RelPath) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(Vec<u8>, String, Option<String>)>> + Send,
    {
        self.recovery_sweep().await?;

        let loader = Arc::new(loader);
        let pending: VecDeque<RelPath> = change_set.pending_paths().cloned().collect();
        let summary = Arc::new(tokio::sync::Mutex::new(BatchSummary::default()));

        let mut handles = Vec::new();
        let mut queue = pending;

        while let Some(path) = queue.pop_front() {
            if !self.signals.is_accepting() || self.signals.is_killed() {
                let mut s = summary.lock().await;
                s.record(RecordOutcome::Skipped, &path, None);
                continue;
            }

            // RateGuard is consulted per remote call inside the FSM chain
            // (upload, import, await, get_document each gate individually),
            // not once per dispatched record here.
            let permit = self.semaphore.acquire().await;
            let driver = self.driver.clone();
            let catalog = self.catalog.clone();
            let loader = loader.clone();
            let summary = summary.clone();

            let span = debug_span!("dispatch", file_path = %path);
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    let record = match catalog.get(&path).await {
                        Ok(Some(r)) => r,
                        _ => return,
                    };
                    let (bytes, upload_hash, enrichment_version) = match loader(path.clone()).await {
                        Ok(v) => v,
                        Err(e) => {
                            let mut s = summary.lock().await;
                            s.record(RecordOutcome::Failed, &path, Some(e.to_string()));
                            return;
                        }
                    };

                    let (outcome, reason, _error_class) = driver.process_record(&record, bytes, upload_hash, enrichment_version).await;

                    let mut s = summary.lock().await;
                    s.record(outcome, &path, reason);
                }
                .instrument(span),
            );
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        let result = Arc::try_unwrap(summary).map(|m| m.into_inner()).unwrap_or_default();
        info!(indexed = result.indexed, failed = result.failed, skipped = result.skipped, "batch complete");
        Ok(result)
    }

    /// After a batch drains, retry any records in FAILED whose last error
    /// was classified transient, after a fixed cool-down.
    #[instrument(skip(self, loader))]
    pub async fn post_batch_retry<L, Fut>(&self, loader: L) -> Result<BatchSummary>
    where
        L: Fn(RelPath) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(Vec<u8>, String, Option<String>)>> + Send,
    {
        tokio::time::sleep(self.config.post_batch_cooldown).await;
        let failed = self.catalog.load_by_states(&[FsmState::Failed], self.config.batch_limit).await?;
        let mut change_set = ChangeSet::default();
        for record in &failed {
            // A record failed before this column existed, or failed for a
            // reason that predates classification, is retried by default;
            // only a record explicitly classified Permanent is skipped.
            let retryable = record.error_class.map(|c| c.is_retryable()).unwrap_or(true);
            if retryable {
                change_set.modified.push(record.file_path.clone());
            }
        }
        self.run_batch(&change_set, loader).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dynamic_semaphore_never_exceeds_limit_concurrently() {
        let sem = DynamicSemaphore::new(2);
        let p1 = sem.acquire().await;
        let p2 = sem.acquire().await;
        assert_eq!(sem.active.load(Ordering::SeqCst), 2);
        drop(p1);
        assert_eq!(sem.active.load(Ordering::SeqCst), 1);
        drop(p2);
    }

    #[tokio::test]
    async fn reducing_limit_does_not_revoke_in_flight_permits() {
        let sem = DynamicSemaphore::new(10);
        let mut permits = Vec::new();
        for _ in 0..5 {
            permits.push(sem.acquire().await);
        }
        sem.set_limit(2);
        assert_eq!(sem.active.load(Ordering::SeqCst), 5);
        drop(permits);
    }
}
