//! `shelfsync status`: counts per `fsm_state` plus orphan backlog. A
//! query-only command; it never touches the remote.

use std::path::PathBuf;

use shelfsync_config::CliOverrides;

use crate::context::AppContext;

pub async fn run(config_path: Option<PathBuf>, overrides: CliOverrides) -> anyhow::Result<()> {
    let (config, catalog) = AppContext::build_catalog_only(config_path, overrides).await?;

    let counts = catalog.state_counts().await?;
    let orphans = catalog.orphan_backlog().await?;

    println!("store: {}", config.remote.store_name);
    for (state, count) in counts {
        println!("  {state}: {count}");
    }
    println!("  orphan backlog: {orphans}");

    Ok(())
}
