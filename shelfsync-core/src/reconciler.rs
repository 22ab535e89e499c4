//! Incremental change detection and upload-first replacement support.
//! Runs before every upload invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use shelfsync_model::{hash, ChangeSet, FileRecord, FsmState, RelPath, ScannedFile};
use tracing::{debug, info, instrument, warn};

use crate::catalog::Catalog;
use crate::error::{CoreError, Result};
use crate::remote::{split_doc_id, RemoteClient};

const MTIME_EPSILON_SECS: f64 = 1e-6;
const DEFAULT_PRUNE_WINDOW: ChronoDuration = ChronoDuration::days(7);

/// External collaborator that walks the library root and emits candidate
/// files. The core only consumes this interface.
#[async_trait::async_trait]
pub trait FileScanner: Send + Sync {
    async fn scan(&self, library_root: &Path) -> Result<Vec<ScannedFile>>;
    async fn read_bytes(&self, library_root: &Path, file_path: &RelPath) -> Result<Vec<u8>>;
}

/// Orchestrates four phases: mount check, store-binding check, orphan
/// drain, and change classification.
pub struct SyncReconciler {
    catalog: Catalog,
    remote: Arc<dyn RemoteClient>,
    scanner: Arc<dyn FileScanner>,
    library_root: PathBuf,
    store: String,
}

/// Result of running the full reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub change_set: ChangeSet,
    pub orphans_cleared: usize,
    pub orphans_remaining: usize,
}

impl SyncReconciler {
    pub fn new(catalog: Catalog, remote: Arc<dyn RemoteClient>, scanner: Arc<dyn FileScanner>, library_root: PathBuf, store: String) -> Self {
        Self {
            catalog,
            remote,
            scanner,
            library_root,
            store,
        }
    }

    /// Phase 1: verify the library root is accessible. A recoverable,
    /// distinctly-classified abort.
    #[instrument(skip(self))]
    pub async fn check_mount(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.library_root)
            .await
            .map_err(|e| CoreError::MountUnavailable(format!("{}: {e}", self.library_root.display())))?;
        if !meta.is_dir() {
            return Err(CoreError::MountUnavailable(format!(
                "{} is not a directory",
                self.library_root.display()
            )));
        }
        Ok(())
    }

    /// Phase 2: refuse to run against a store other than the one this
    /// catalog is bound to, absent an explicit operator override.
    #[instrument(skip(self))]
    pub async fn check_store_binding(&self, operator_override: bool) -> Result<()> {
        let resolved = self.remote.resolve_store(&self.store).await?;
        match self.catalog.get_library_config("store_name").await? {
            None => {
                self.catalog.set_library_config("store_name", &resolved).await?;
                info!(store = %resolved, "binding catalog to store");
                Ok(())
            }
            Some(bound) if bound == resolved => Ok(()),
            Some(bound) if operator_override => {
                warn!(bound, requested = %resolved, "store-binding override: rebinding catalog");
                self.catalog.set_library_config("store_name", &resolved).await?;
                Ok(())
            }
            Some(bound) => Err(CoreError::StoreBindingMismatch {
                bound,
                requested: resolved,
            }),
        }
    }

    /// Phase 3: delete the remote document and raw artifact for every
    /// record with a pending orphan, clearing the field on success. A
    /// failure here leaves the orphan in place for the next run.
    ///
    /// Normal replacements are drained inline as part of the commit that
    /// creates the orphan; this sweep exists to pick up orphans left
    /// behind by a crash between that commit and the inline drain, or by
    /// an inline drain that itself failed (e.g. rate-limited).
    #[instrument(skip(self))]
    pub async fn drain_orphans(&self) -> Result<(usize, usize)> {
        let orphans = self.catalog.load_orphans().await?;
        let mut cleared = 0usize;
        for record in &orphans {
            let Some(orphan_raw_id) = &record.orphan_raw_id else {
                continue;
            };
            let (doc_prefix, _) = record
                .remote_doc_id
                .as_deref()
                .map(split_doc_id)
                .unwrap_or((orphan_raw_id.as_str(), ""));

            let delete_result = async {
                self.remote.delete_document(&self.store, doc_prefix).await?;
                self.remote.delete_raw(orphan_raw_id).await?;
                Ok::<(), CoreError>(())
            }
            .await;

            match delete_result {
                Ok(()) => {
                    self.clear_orphan(&record.file_path, record.fsm_state).await?;
                    cleared += 1;
                }
                Err(e) => {
                    warn!(file_path = %record.file_path, error = %e, "orphan drain failed, leaving for next run");
                }
            }
        }
        let remaining = orphans.len() - cleared;
        Ok((cleared, remaining))
    }

    async fn clear_orphan(&self, file_path: &RelPath, current_state: FsmState) -> Result<()> {
        let snapshot = self.catalog.begin_transition(file_path, current_state).await?;
        let update = crate::catalog::TransitionUpdate::to(snapshot.token.state).with_orphan_raw_id(None);
        match self.catalog.commit_transition(&snapshot, update).await? {
            crate::catalog::CommitOutcome::Committed(_) => Ok(()),
            crate::catalog::CommitOutcome::Conflict => Ok(()),
        }
    }

    /// Phase 4: walk the library root and classify every path against the
    /// Catalog using an mtime fast path, falling back to a content-hash
    /// check on mismatch. New/unknown records are inserted as UNTRACKED.
    #[instrument(skip(self))]
    pub async fn classify_changes(&self) -> Result<ChangeSet> {
        let scanned = self.scanner.scan(&self.library_root).await?;
        let mut change_set = ChangeSet::default();
        let mut seen = std::collections::HashSet::new();

        for file in &scanned {
            seen.insert(file.file_path.clone());
            match self.catalog.get(&file.file_path).await? {
                None => {
                    let bytes = self.scanner.read_bytes(&self.library_root, &file.file_path).await?;
                    let content_hash = hash::digest_bytes(&bytes);
                    let record = FileRecord::new_untracked(file.file_path.clone(), content_hash, file.size, file.mtime);
                    self.catalog.insert_new(&record).await?;
                    change_set.new.push(file.file_path.clone());
                }
                Some(existing) => {
                    if existing.missing_since.is_some() {
                        self.catalog.clear_missing(&file.file_path).await?;
                    }
                    if (existing.mtime - file.mtime).abs() < MTIME_EPSILON_SECS && existing.size == file.size {
                        change_set.mtime_skipped.push(file.file_path.clone());
                        continue;
                    }
                    let bytes = self.scanner.read_bytes(&self.library_root, &file.file_path).await?;
                    let content_hash = hash::digest_bytes(&bytes);
                    if content_hash == existing.content_hash {
                        change_set.unchanged.push(file.file_path.clone());
                    } else {
                        change_set.modified.push(file.file_path.clone());
                    }
                }
            }
        }

        let all_tracked = self.catalog.load_by_states(&ALL_STATES, i64::MAX).await?;
        for record in all_tracked {
            if !seen.contains(&record.file_path) && record.missing_since.is_none() {
                change_set.missing.push(record.file_path);
            }
        }
        self.catalog.mark_missing(&change_set.missing).await?;

        self.requeue_expired(&mut change_set).await?;

        debug!(
            new = change_set.new.len(),
            modified = change_set.modified.len(),
            missing = change_set.missing.len(),
            unchanged = change_set.unchanged.len(),
            mtime_skipped = change_set.mtime_skipped.len(),
            "change classification complete"
        );
        Ok(change_set)
    }

    /// INDEXED records whose `remote_expiration` has passed are
    /// reclassified as `modified`, forcing a fresh upload-first
    /// replacement: documents have a finite remote TTL.
    async fn requeue_expired(&self, change_set: &mut ChangeSet) -> Result<()> {
        let now = Utc::now();
        let indexed = self.catalog.load_by_states(&[FsmState::Indexed], i64::MAX).await?;
        for record in indexed {
            if let Some(expires_at) = record.remote_expiration {
                if expires_at <= now && !change_set.modified.contains(&record.file_path) {
                    change_set.modified.push(record.file_path);
                }
            }
        }
        Ok(())
    }

    /// Operator-opted prune: delete remote entries for records missing
    /// longer than `window` (default 7 days).
    #[instrument(skip(self))]
    pub async fn prune_missing(&self, window: Option<ChronoDuration>) -> Result<usize> {
        let cutoff = Utc::now() - window.unwrap_or(DEFAULT_PRUNE_WINDOW);
        let candidates = self.catalog.load_missing_older_than(cutoff).await?;
        let mut pruned = 0usize;
        for record in candidates {
            if let Some(doc_id) = &record.remote_doc_id {
                let (prefix, _) = split_doc_id(doc_id);
                self.remote.delete_document(&self.store, prefix).await?;
            }
            if let Some(raw_id) = &record.remote_raw_id {
                self.remote.delete_raw(raw_id).await?;
            }
            self.catalog.delete(&record.file_path).await?;
            pruned += 1;
        }
        Ok(pruned)
    }

    pub async fn run(&self, operator_override: bool) -> Result<ReconcileReport> {
        self.check_mount().await?;
        self.check_store_binding(operator_override).await?;
        let (cleared, remaining) = self.drain_orphans().await?;
        let change_set = self.classify_changes().await?;
        Ok(ReconcileReport {
            change_set,
            orphans_cleared: cleared,
            orphans_remaining: remaining,
        })
    }
}

const ALL_STATES: [FsmState; 5] = [
    FsmState::Untracked,
    FsmState::Uploading,
    FsmState::Processing,
    FsmState::Indexed,
    FsmState::Failed,
];
