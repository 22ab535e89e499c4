//! Wires a loaded [`Config`] into the concrete collaborators the core
//! needs: [`Catalog`], [`HttpRemoteClient`], [`RateGuard`], [`Orchestrator`]
//! and [`SyncReconciler`]. One context is built per CLI invocation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use shelfsync_config::{CliOverrides, Config, ConfigLoader, ConfigLoaderOptions, CredentialStore};
use shelfsync_core::{
    Catalog, HttpRemoteClient, OrchestratorConfig, RateGuard, RateGuardConfig, RemoteClient, SyncReconciler,
};

use crate::scanner::WalkdirScanner;

pub struct AppContext {
    pub config: Config,
    pub catalog: Catalog,
    pub remote: Arc<dyn RemoteClient>,
    pub rate_guard: Arc<RateGuard>,
    pub library_root: PathBuf,
}

impl AppContext {
    pub async fn build(config_path: Option<PathBuf>, overrides: CliOverrides) -> anyhow::Result<Self> {
        let loader = match config_path {
            Some(path) => ConfigLoader::with_options(ConfigLoaderOptions {
                config_path: Some(path),
                env_file: None,
            }),
            None => ConfigLoader::new(),
        };
        let config = loader.load(overrides)?;

        shelfsync_config::loader::self_check(&config)
            .map_err(|errors| anyhow::anyhow!("configuration is invalid:\n  - {}", errors.join("\n  - ")))?;

        let library_root = config
            .library
            .root
            .clone()
            .context("library root is not configured")?;

        let credentials = CredentialStore::for_store(&config.remote.store_name);
        let api_key = credentials.get_api_key()?;

        let remote: Arc<dyn RemoteClient> =
            Arc::new(HttpRemoteClient::new(config.remote.base_url.as_str(), api_key.expose())?);

        let rate_guard = Arc::new(RateGuard::new(RateGuardConfig {
            requests_per_minute: config.rate_guard.requests_per_minute,
            min_interval: Duration::from_secs(config.rate_guard.min_interval_secs),
            window: Duration::from_secs(config.rate_guard.window_secs),
            error_rate_trip_threshold: config.rate_guard.error_rate_trip_threshold,
            consecutive_rate_limit_trip: config.rate_guard.consecutive_rate_limit_trip,
            open_cooldown: Duration::from_secs(config.rate_guard.open_cooldown_secs),
        }));

        let catalog = Catalog::open(&config.catalog.db_path.to_string_lossy()).await?;

        Ok(Self {
            config,
            catalog,
            remote,
            rate_guard,
            library_root,
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency_limit: self.config.orchestrator.concurrency_limit,
            batch_limit: self.config.orchestrator.batch_limit as i64,
            import_timeout: Duration::from_secs(self.config.orchestrator.import_timeout_secs),
            visibility_timeout: Duration::from_secs(self.config.orchestrator.visibility_timeout_secs),
            post_batch_cooldown: Duration::from_secs(self.config.orchestrator.post_batch_cooldown_secs),
        }
    }

    /// Build just enough context for a query-only command (`status`) that
    /// needs the Catalog but not a resolved remote client or credentials —
    /// the operator can always inspect local state, even mid-outage.
    pub async fn build_catalog_only(config_path: Option<PathBuf>, overrides: CliOverrides) -> anyhow::Result<(Config, Catalog)> {
        let loader = match config_path {
            Some(path) => ConfigLoader::with_options(ConfigLoaderOptions {
                config_path: Some(path),
                env_file: None,
            }),
            None => ConfigLoader::new(),
        };
        let config = loader.load(overrides)?;
        let catalog = Catalog::open(&config.catalog.db_path.to_string_lossy()).await?;
        Ok((config, catalog))
    }

    pub fn reconciler(&self, operator_override: bool) -> (SyncReconciler, bool) {
        let scanner = Arc::new(WalkdirScanner::new());
        (
            SyncReconciler::new(
                self.catalog.clone(),
                self.remote.clone(),
                scanner,
                self.library_root.clone(),
                self.config.remote.store_name.clone(),
            ),
            operator_override,
        )
    }
}
