//! A tripped circuit breaker causes the dispatch loop to skip rather
//! than hammer the remote.

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shelfsync_core::catalog::Catalog;
use shelfsync_core::orchestrator::{Orchestrator, OrchestratorConfig};
use shelfsync_core::rate_guard::{Outcome, RateGuard, RateGuardConfig};
use shelfsync_core::reconciler::SyncReconciler;
use shelfsync_model::RelPath;
use support::fake_remote::FakeRemoteClient;
use support::fake_scanner::FakeFileScanner;

#[tokio::test]
async fn open_circuit_skips_pending_records_instead_of_calling_the_remote() {
    let catalog = Catalog::open_in_memory().await.unwrap();
    let remote = Arc::new(FakeRemoteClient::new());
    let scanner = Arc::new(FakeFileScanner::new());
    for i in 0..5 {
        scanner.put(&format!("file{i}.txt"), vec![i as u8; 64]);
    }

    let reconciler = SyncReconciler::new(catalog.clone(), remote.clone(), scanner.clone(), PathBuf::from("/"), "my-store".into());
    let report = reconciler.run(false).await.unwrap();
    assert_eq!(report.change_set.new.len(), 5);

    let rate_guard = Arc::new(RateGuard::new(RateGuardConfig {
        requests_per_minute: 10_000,
        min_interval: Duration::from_millis(0),
        window: Duration::from_secs(60),
        error_rate_trip_threshold: 0.05,
        consecutive_rate_limit_trip: 3,
        open_cooldown: Duration::from_secs(30),
    }));

    // Three consecutive rate-limit responses trip the breaker before a
    // single dispatch runs, mirroring a remote that is already melting
    // down when the batch starts.
    rate_guard.record(Outcome::RateLimited).await;
    rate_guard.record(Outcome::RateLimited).await;
    rate_guard.record(Outcome::RateLimited).await;

    let orchestrator = Orchestrator::new(catalog.clone(), remote.clone(), rate_guard, "my-store".into(), OrchestratorConfig::default());
    let scanner_for_loader = scanner.clone();
    let loader = move |path: RelPath| {
        let scanner = scanner_for_loader.clone();
        Box::pin(async move {
            let bytes = scanner.read_bytes(&PathBuf::from("/"), &path).await?;
            let hash = shelfsync_model::hash::digest_bytes(&bytes);
            Ok::<_, shelfsync_core::error::CoreError>((bytes, hash, None))
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = shelfsync_core::error::Result<(Vec<u8>, String, Option<String>)>> + Send>>
    };

    let summary = orchestrator.run_batch(&report.change_set, loader).await.unwrap();

    assert_eq!(summary.indexed, 0, "every record should be skipped while the breaker is OPEN");
    assert_eq!(summary.skipped, 5);
    assert_eq!(remote.raw_artifact_count(), 0, "an open circuit must not let any upload reach the remote");

    for i in 0..5 {
        let record = catalog.get(&RelPath::from(format!("file{i}.txt"))).await.unwrap().unwrap();
        assert_eq!(record.fsm_state, shelfsync_model::FsmState::Untracked, "skipped dispatch must not touch FSM state");
    }
}
