//! Command-line driver for the shelfsync upload pipeline and its
//! consistency machinery. Owns none of the core's logic; wires
//! configuration, credentials, and a concrete [`scanner::WalkdirScanner`]
//! into [`shelfsync_core`] and renders results.

mod commands;
mod context;
mod exit;
mod scanner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shelfsync_config::CliOverrides;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::context::AppContext;

/// shelfsync: semantic-search upload pipeline for a local document library.
#[derive(Parser, Debug)]
#[command(name = "shelfsync", about = "Upload pipeline and consistency machinery for the shelfsync indexer")]
struct Cli {
    /// Path to shelfsync.toml. Defaults to ./shelfsync.toml or
    /// ./config/shelfsync.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured library root.
    #[arg(long, global = true)]
    library_root: Option<PathBuf>,

    /// Override the configured remote store name.
    #[arg(long, global = true)]
    store: Option<String>,

    /// Override the configured remote backend base URL.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the library against the catalog and the remote store,
    /// then upload everything that changed.
    Sync {
        /// Classify changes and report counts without uploading anything.
        #[arg(long)]
        dry_run: bool,
        /// Rebind the catalog to a different store name if already bound.
        #[arg(long)]
        force: bool,
        /// Delete remote entries for files missing longer than the
        /// configured prune window (default 7 days).
        #[arg(long)]
        prune_missing: bool,
    },
    /// Drive already-eligible records through the Orchestrator without
    /// re-running change classification.
    Upload {
        /// Maximum number of records to dispatch in this invocation.
        #[arg(long, default_value_t = 256)]
        limit: i64,
    },
    /// Report counts per FSM state and the current orphan backlog.
    Status,
    /// Manage the remote backend's API key in the OS keyring.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand, Debug)]
enum AuthAction {
    /// Prompt for and store the API key for a store.
    Set {
        /// Store name to bind the key to; defaults to the configured store.
        #[arg(long)]
        store: Option<String>,
    },
    /// Remove the stored API key for a store.
    Clear {
        #[arg(long)]
        store: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelfsync_core=info,shelfsync_config=info,shelfsync_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let overrides = CliOverrides {
        library_root: cli.library_root.clone(),
        store_name: cli.store.clone(),
        base_url: cli.base_url.clone(),
        concurrency_limit: None,
    };

    let result = dispatch(cli, overrides).await;

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(exit::code_for(&err));
    }
}

async fn dispatch(cli: Cli, overrides: CliOverrides) -> anyhow::Result<()> {
    match cli.command {
        Command::Sync { dry_run, force, prune_missing } => {
            let ctx = AppContext::build(cli.config, overrides).await?;
            commands::sync::run(ctx, commands::sync::SyncArgs { dry_run, force, prune_missing }).await
        }
        Command::Upload { limit } => {
            let ctx = AppContext::build(cli.config, overrides).await?;
            commands::upload::run(ctx, commands::upload::UploadArgs { limit }).await
        }
        Command::Status => commands::status::run(cli.config, overrides).await,
        Command::Auth { action } => {
            let store_name = match &action {
                AuthAction::Set { store } | AuthAction::Clear { store } => store.clone(),
            };
            let store_name = match store_name.or(overrides.store_name.clone()) {
                Some(s) => s,
                None => {
                    let (config, _catalog) = AppContext::build_catalog_only(cli.config, overrides).await?;
                    config.remote.store_name
                }
            };
            match action {
                AuthAction::Set { .. } => commands::auth::set(&store_name),
                AuthAction::Clear { .. } => commands::auth::clear(&store_name),
            }
        }
    }
}
