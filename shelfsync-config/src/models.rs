use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fully resolved configuration, after defaults, file, and environment
/// layers have been merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub library: LibraryConfig,
    pub catalog: CatalogConfig,
    pub remote: RemoteConfig,
    pub orchestrator: OrchestratorTuning,
    pub rate_guard: RateGuardTuning,
    #[serde(default)]
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Filesystem root the scanner walks. The core treats this as an
    /// opaque string; only the loader validates its shape.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to the local SQLite catalog database file.
    pub db_path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("shelfsync.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the remote semantic-search backend.
    pub base_url: String,
    /// Store name this library is bound to. Binding itself is persisted
    /// in the catalog, not here; this is merely the store the operator is
    /// currently asking to sync against.
    pub store_name: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            store_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorTuning {
    pub concurrency_limit: usize,
    pub batch_limit: usize,
    pub import_timeout_secs: u64,
    pub visibility_timeout_secs: u64,
    pub post_batch_cooldown_secs: u64,
    /// Days a file may be missing before `--prune-missing` removes its
    /// remote entry (default 7 days).
    pub prune_window_days: i64,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            batch_limit: 256,
            import_timeout_secs: 120,
            visibility_timeout_secs: 300,
            post_batch_cooldown_secs: 30,
            prune_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateGuardTuning {
    pub requests_per_minute: u32,
    pub min_interval_secs: u64,
    pub window_secs: u64,
    pub error_rate_trip_threshold: f64,
    pub consecutive_rate_limit_trip: u32,
    pub open_cooldown_secs: u64,
}

impl Default for RateGuardTuning {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            min_interval_secs: 3,
            window_secs: 60,
            error_rate_trip_threshold: 0.05,
            consecutive_rate_limit_trip: 3,
            open_cooldown_secs: 30,
        }
    }
}

/// Provenance notes attached to a load, surfaced by `status`/`--verbose`
/// rather than being load-bearing for any decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library: LibraryConfig::default(),
            catalog: CatalogConfig::default(),
            remote: RemoteConfig::default(),
            orchestrator: OrchestratorTuning::default(),
            rate_guard: RateGuardTuning::default(),
            metadata: ConfigMetadata::default(),
        }
    }
}
