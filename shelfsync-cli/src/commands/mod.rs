pub mod auth;
pub mod status;
pub mod sync;
pub mod upload;

use shelfsync_core::BatchSummary;

/// Shared batch-summary rendering: per-category counts plus a list of
/// records in FAILED with short reasons.
pub fn print_batch_summary(summary: &BatchSummary) {
    println!(
        "indexed={} failed={} skipped={}",
        summary.indexed, summary.failed, summary.skipped
    );
    for failure in &summary.failures {
        println!("  FAILED {}: {}", failure.file_path, failure.reason);
    }
    if summary.failed > summary.failures.len() {
        println!("  ... {} additional failures not shown", summary.failed - summary.failures.len());
    }
}
