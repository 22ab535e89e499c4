//! Concrete end-to-end scenarios: clean first run, content edit
//! (upload-first replacement), and crash recovery via the orphan sweep.

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shelfsync_core::catalog::Catalog;
use shelfsync_core::orchestrator::{Orchestrator, OrchestratorConfig};
use shelfsync_core::rate_guard::{RateGuard, RateGuardConfig};
use shelfsync_core::reconciler::SyncReconciler;
use shelfsync_model::{FsmState, RelPath};
use support::fake_remote::FakeRemoteClient;
use support::fake_scanner::FakeFileScanner;

fn fast_rate_guard() -> Arc<RateGuard> {
    Arc::new(RateGuard::new(RateGuardConfig {
        requests_per_minute: 10_000,
        min_interval: Duration::from_millis(0),
        window: Duration::from_secs(60),
        error_rate_trip_threshold: 0.05,
        consecutive_rate_limit_trip: 3,
        open_cooldown: Duration::from_millis(50),
    }))
}

async fn upload_and_hash_loader(
    scanner: Arc<FakeFileScanner>,
) -> impl Fn(RelPath) -> std::pin::Pin<Box<dyn std::future::Future<Output = shelfsync_core::error::Result<(Vec<u8>, String, Option<String>)>> + Send>>
       + Send
       + Sync
       + 'static {
    move |path: RelPath| {
        let scanner = scanner.clone();
        Box::pin(async move {
            let bytes = scanner.read_bytes(&PathBuf::from("/"), &path).await?;
            let hash = shelfsync_model::hash::digest_bytes(&bytes);
            Ok((bytes, hash, None))
        })
    }
}

#[tokio::test]
async fn clean_first_run_indexes_all_three_files() {
    let catalog = Catalog::open_in_memory().await.unwrap();
    let remote = Arc::new(FakeRemoteClient::new());
    let scanner = Arc::new(FakeFileScanner::new());
    scanner.put("a.txt", vec![0u8; 100]);
    scanner.put("b.txt", vec![1u8; 1024]);
    scanner.put("c.txt", vec![2u8; 10_240]);

    let reconciler = SyncReconciler::new(catalog.clone(), remote.clone(), scanner.clone(), PathBuf::from("/"), "my-store".into());
    let report = reconciler.run(false).await.unwrap();
    assert_eq!(report.change_set.new.len(), 3);

    let orchestrator = Orchestrator::new(catalog.clone(), remote.clone(), fast_rate_guard(), "my-store".into(), OrchestratorConfig::default());
    let loader = upload_and_hash_loader(scanner.clone()).await;
    let summary = orchestrator.run_batch(&report.change_set, loader).await.unwrap();

    assert_eq!(summary.indexed, 3);
    assert_eq!(summary.failed, 0);

    for name in ["a.txt", "b.txt", "c.txt"] {
        let record = catalog.get(&RelPath::from(name)).await.unwrap().unwrap();
        assert_eq!(record.fsm_state, FsmState::Indexed);
        assert_eq!(record.version, 1);
        assert!(record.orphan_raw_id.is_none());
        assert!(record.remote_raw_id.is_some());
        assert!(record.remote_doc_id.is_some());
    }
    assert_eq!(remote.live_document_count("my-store"), 3);
}

#[tokio::test]
async fn content_edit_replaces_without_orphaning_the_old_document() {
    let catalog = Catalog::open_in_memory().await.unwrap();
    let remote = Arc::new(FakeRemoteClient::new());
    let scanner = Arc::new(FakeFileScanner::new());
    scanner.put("a.txt", vec![0u8; 100]);
    scanner.put("b.txt", vec![1u8; 1024]);
    scanner.put("c.txt", vec![2u8; 10_240]);

    let reconciler = SyncReconciler::new(catalog.clone(), remote.clone(), scanner.clone(), PathBuf::from("/"), "my-store".into());
    let first = reconciler.run(false).await.unwrap();
    let orchestrator = Orchestrator::new(catalog.clone(), remote.clone(), fast_rate_guard(), "my-store".into(), OrchestratorConfig::default());
    let loader = upload_and_hash_loader(scanner.clone()).await;
    orchestrator.run_batch(&first.change_set, loader).await.unwrap();
    assert_eq!(remote.live_document_count("my-store"), 3);

    // Modify b.txt: different length so the mtime/size fast path can't
    // mask the change.
    scanner.put("b.txt", vec![9u8; 2048]);
    let second = reconciler.run(false).await.unwrap();
    assert_eq!(second.change_set.modified, vec![RelPath::from("b.txt")]);
    assert!(second.change_set.new.is_empty());

    let loader = upload_and_hash_loader(scanner.clone()).await;
    let summary = orchestrator.run_batch(&second.change_set, loader).await.unwrap();
    assert_eq!(summary.indexed, 1);

    let b = catalog.get(&RelPath::from("b.txt")).await.unwrap().unwrap();
    assert_eq!(b.fsm_state, FsmState::Indexed);
    assert_eq!(b.version, 2);
    assert!(b.orphan_raw_id.is_none(), "orphan must be cleared after replacement drains");

    let a = catalog.get(&RelPath::from("a.txt")).await.unwrap().unwrap();
    let c = catalog.get(&RelPath::from("c.txt")).await.unwrap().unwrap();
    assert_eq!(a.version, 1);
    assert_eq!(c.version, 1);

    // Exactly one live document for b.txt: the old one was deleted inline
    // as part of the replacement commit, not left dangling.
    assert_eq!(remote.live_document_count("my-store"), 3);
}

#[tokio::test]
async fn crash_between_replacement_commit_and_orphan_delete_is_recovered_by_next_sweep() {
    let catalog = Catalog::open_in_memory().await.unwrap();
    let remote = Arc::new(FakeRemoteClient::new());
    let scanner = Arc::new(FakeFileScanner::new());
    scanner.put("b.txt", vec![1u8; 1024]);

    let reconciler = SyncReconciler::new(catalog.clone(), remote.clone(), scanner.clone(), PathBuf::from("/"), "my-store".into());
    let first = reconciler.run(false).await.unwrap();
    let orchestrator = Orchestrator::new(catalog.clone(), remote.clone(), fast_rate_guard(), "my-store".into(), OrchestratorConfig::default());
    let loader = upload_and_hash_loader(scanner.clone()).await;
    orchestrator.run_batch(&first.change_set, loader).await.unwrap();

    let indexed = catalog.get(&RelPath::from("b.txt")).await.unwrap().unwrap();
    let old_raw_id = indexed.remote_raw_id.clone().unwrap();
    let old_doc_id = indexed.remote_doc_id.clone().unwrap();

    // Simulate a crash where step (c) of the replacement protocol has
    // committed (new ids recorded, old raw moved to orphan_raw_id) but
    // steps (d)/(e) never ran.
    let snapshot = catalog.begin_transition(&RelPath::from("b.txt"), FsmState::Uploading).await.unwrap();
    let new_raw_id = remote.upload_raw(vec![9u8; 2048], "b.txt").await.unwrap();
    let update = shelfsync_core::catalog::TransitionUpdate::to(FsmState::Uploading)
        .with_remote_raw_id(new_raw_id.clone())
        .with_upload_hash("new-upload-hash")
        .with_orphan_raw_id(Some(old_raw_id.clone()));
    catalog.commit_transition(&snapshot, update).await.unwrap();

    let mid_crash = catalog.get(&RelPath::from("b.txt")).await.unwrap().unwrap();
    assert_eq!(mid_crash.orphan_raw_id.as_deref(), Some(old_raw_id.as_str()));

    // "Restart": run the reconciler again. Its orphan drain phase should
    // delete the old document/raw and clear orphan_raw_id, without
    // disturbing the new (still in-flight) upload.
    let after_restart = reconciler.run(false).await.unwrap();
    assert_eq!(after_restart.orphans_cleared, 1);
    assert_eq!(after_restart.orphans_remaining, 0);

    let (old_doc_prefix, _) = shelfsync_core::remote::split_doc_id(&old_doc_id);
    assert!(!remote.deleted_raw_ids().is_empty());
    assert!(remote.deleted_raw_ids().contains(&old_raw_id));
    assert_eq!(remote.raw_artifact_count(), 1, "only the new raw artifact should remain");
    let _ = old_doc_prefix;

    let final_record = catalog.get(&RelPath::from("b.txt")).await.unwrap().unwrap();
    assert!(final_record.orphan_raw_id.is_none());
}

#[tokio::test]
async fn missing_file_is_flagged_not_deleted_until_pruned() {
    let catalog = Catalog::open_in_memory().await.unwrap();
    let remote = Arc::new(FakeRemoteClient::new());
    let scanner = Arc::new(FakeFileScanner::new());
    scanner.put("a.txt", vec![0u8; 100]);

    let reconciler = SyncReconciler::new(catalog.clone(), remote.clone(), scanner.clone(), PathBuf::from("/"), "my-store".into());
    let first = reconciler.run(false).await.unwrap();
    let orchestrator = Orchestrator::new(catalog.clone(), remote.clone(), fast_rate_guard(), "my-store".into(), OrchestratorConfig::default());
    let loader = upload_and_hash_loader(scanner.clone()).await;
    orchestrator.run_batch(&first.change_set, loader).await.unwrap();

    scanner.remove("a.txt");
    let second = reconciler.run(false).await.unwrap();
    assert_eq!(second.change_set.missing, vec![RelPath::from("a.txt")]);

    let record = catalog.get(&RelPath::from("a.txt")).await.unwrap().unwrap();
    assert!(record.missing_since.is_some());
    assert_eq!(record.fsm_state, FsmState::Indexed, "missing never touches fsm_state");
    assert_eq!(remote.live_document_count("my-store"), 1, "remote document must not be deleted by missing detection alone");

    // Only the explicit prune step removes it, and only once it's been
    // missing longer than the window.
    let pruned_too_soon = reconciler.prune_missing(Some(chrono::Duration::days(7))).await.unwrap();
    assert_eq!(pruned_too_soon, 0);

    let pruned = reconciler.prune_missing(Some(chrono::Duration::zero())).await.unwrap();
    assert_eq!(pruned, 1);
    assert_eq!(remote.live_document_count("my-store"), 0);
    assert!(catalog.get(&RelPath::from("a.txt")).await.unwrap().is_none());
}
