//! `shelfsync sync [--dry-run] [--force] [--prune-missing]`: runs
//! SyncReconciler's four phases, then drives the resulting ChangeSet
//! through the Orchestrator.

use std::sync::Arc;

use shelfsync_core::reconciler::FileScanner;
use shelfsync_core::Orchestrator;
use shelfsync_model::hash;
use tracing::info;

use crate::commands::print_batch_summary;
use crate::context::AppContext;
use crate::scanner::WalkdirScanner;

pub struct SyncArgs {
    pub dry_run: bool,
    pub force: bool,
    pub prune_missing: bool,
}

pub async fn run(ctx: AppContext, args: SyncArgs) -> anyhow::Result<()> {
    let (reconciler, operator_override) = ctx.reconciler(args.force);

    if args.dry_run {
        reconciler.check_mount().await?;
        reconciler.check_store_binding(operator_override).await?;
        let change_set = reconciler.classify_changes().await?;
        info!(
            new = change_set.new.len(),
            modified = change_set.modified.len(),
            missing = change_set.missing.len(),
            unchanged = change_set.unchanged.len(),
            "dry run: no uploads performed"
        );
        println!(
            "dry-run: new={} modified={} missing={} unchanged={} mtime_skipped={}",
            change_set.new.len(),
            change_set.modified.len(),
            change_set.missing.len(),
            change_set.unchanged.len(),
            change_set.mtime_skipped.len()
        );
        return Ok(());
    }

    let report = reconciler.run(operator_override).await?;
    println!(
        "reconcile: orphans_cleared={} orphans_remaining={}",
        report.orphans_cleared, report.orphans_remaining
    );

    let orchestrator = Orchestrator::new(
        ctx.catalog.clone(),
        ctx.remote.clone(),
        ctx.rate_guard.clone(),
        ctx.config.remote.store_name.clone(),
        ctx.orchestrator_config(),
    );

    let scanner = Arc::new(WalkdirScanner::new());
    let library_root = ctx.library_root.clone();
    let loader_scanner = scanner.clone();
    let loader = move |path: shelfsync_model::RelPath| {
        let scanner = loader_scanner.clone();
        let library_root = library_root.clone();
        async move {
            let bytes = scanner.read_bytes(&library_root, &path).await?;
            let upload_hash = hash::digest_bytes(&bytes);
            Ok((bytes, upload_hash, None))
        }
    };

    let summary = orchestrator.run_batch(&report.change_set, loader).await?;
    print_batch_summary(&summary);

    let library_root = ctx.library_root.clone();
    let retry_scanner = scanner.clone();
    let retry_loader = move |path: shelfsync_model::RelPath| {
        let scanner = retry_scanner.clone();
        let library_root = library_root.clone();
        async move {
            let bytes = scanner.read_bytes(&library_root, &path).await?;
            let upload_hash = hash::digest_bytes(&bytes);
            Ok((bytes, upload_hash, None))
        }
    };
    let retry_summary = orchestrator.post_batch_retry(retry_loader).await?;
    if retry_summary.indexed > 0 || retry_summary.failed > 0 {
        println!("post-batch retry:");
        print_batch_summary(&retry_summary);
    }

    if args.prune_missing {
        let pruned = reconciler.prune_missing(None).await?;
        println!("pruned {pruned} remote entries for long-missing files");
    }

    Ok(())
}
