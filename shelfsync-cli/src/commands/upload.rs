//! `shelfsync upload [--limit N]`: drives the Orchestrator directly over
//! records already eligible per the Catalog, without re-running
//! SyncReconciler's change classification.

use std::sync::Arc;

use shelfsync_core::reconciler::FileScanner;
use shelfsync_core::Orchestrator;
use shelfsync_model::{hash, ChangeSet, FsmState};

use crate::commands::print_batch_summary;
use crate::context::AppContext;
use crate::scanner::WalkdirScanner;

const ELIGIBLE_STATES: [FsmState; 3] = [FsmState::Untracked, FsmState::Failed, FsmState::Indexed];

pub struct UploadArgs {
    pub limit: i64,
}

pub async fn run(ctx: AppContext, args: UploadArgs) -> anyhow::Result<()> {
    let pending = ctx.catalog.load_pending(&ELIGIBLE_STATES, args.limit).await?;
    if pending.is_empty() {
        println!("nothing eligible for upload");
        return Ok(());
    }

    let mut change_set = ChangeSet::default();
    for record in &pending {
        change_set.new.push(record.file_path.clone());
    }

    let orchestrator = Orchestrator::new(
        ctx.catalog.clone(),
        ctx.remote.clone(),
        ctx.rate_guard.clone(),
        ctx.config.remote.store_name.clone(),
        ctx.orchestrator_config(),
    );

    let scanner = Arc::new(WalkdirScanner::new());
    let library_root = ctx.library_root.clone();
    let loader = move |path: shelfsync_model::RelPath| {
        let scanner = scanner.clone();
        let library_root = library_root.clone();
        async move {
            let bytes = scanner.read_bytes(&library_root, &path).await?;
            let upload_hash = hash::digest_bytes(&bytes);
            Ok((bytes, upload_hash, None))
        }
    };

    let summary = orchestrator.run_batch(&change_set, loader).await?;
    print_batch_summary(&summary);
    Ok(())
}
