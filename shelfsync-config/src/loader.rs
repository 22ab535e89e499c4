//! Layered configuration loading: defaults -> config file -> environment
//! -> CLI flags, built on the `config` crate's source-merging instead of
//! hand-rolled `Option::or` chains.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::models::Config;
use crate::validation;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["shelfsync.toml", "config/shelfsync.toml"];
const ENV_PREFIX: &str = "SHELFSYNC";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// CLI-supplied overrides, applied after the file/env layers (highest
/// precedence in the layering order).
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub library_root: Option<PathBuf>,
    pub store_name: Option<String>,
    pub base_url: Option<String>,
    pub concurrency_limit: Option<usize>,
}

#[derive(Debug)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            options: ConfigLoaderOptions::default(),
        }
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn load(&self, overrides: CliOverrides) -> Result<Config> {
        let env_file_loaded = self.load_env_file()?;

        if let Some(path) = &self.options.config_path {
            if !path.exists() {
                return Err(ConfigError::MissingConfig { path: path.clone() });
            }
        }

        let config_path = self.resolve_config_path();
        let config_present = config_path.as_ref().is_some_and(|p| p.exists());

        if !config_present {
            warn!("no shelfsync.toml found; falling back to environment variables and defaults");
        }

        let mut builder = config::Config::builder()
            .set_default("catalog.db_path", "shelfsync.db")?
            .set_default("orchestrator.concurrency_limit", 10i64)?
            .set_default("orchestrator.batch_limit", 256i64)?
            .set_default("orchestrator.import_timeout_secs", 120i64)?
            .set_default("orchestrator.visibility_timeout_secs", 300i64)?
            .set_default("orchestrator.post_batch_cooldown_secs", 30i64)?
            .set_default("orchestrator.prune_window_days", 7i64)?
            .set_default("rate_guard.requests_per_minute", 20i64)?
            .set_default("rate_guard.min_interval_secs", 3i64)?
            .set_default("rate_guard.window_secs", 60i64)?
            .set_default("rate_guard.error_rate_trip_threshold", 0.05)?
            .set_default("rate_guard.consecutive_rate_limit_trip", 3i64)?
            .set_default("rate_guard.open_cooldown_secs", 30i64)?
            .set_default("remote.base_url", "")?
            .set_default("remote.store_name", "")?;

        if let Some(path) = &config_path {
            if config_present {
                builder = builder.add_source(config::File::from(path.as_path()).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let mut resolved: Config = merged.try_deserialize()?;

        self.apply_overrides(&mut resolved, overrides);

        resolved.metadata.config_path = config_path;
        resolved.metadata.env_file_loaded = env_file_loaded;

        if let Some(root) = &resolved.library.root {
            if let Err(e) = validation::validate_library_root(&root.to_string_lossy()) {
                return Err(ConfigError::Invalid(e));
            }
        }

        info!(
            store = %resolved.remote.store_name,
            concurrency_limit = resolved.orchestrator.concurrency_limit,
            "configuration loaded"
        );

        Ok(resolved)
    }

    fn apply_overrides(&self, config: &mut Config, overrides: CliOverrides) {
        if let Some(root) = overrides.library_root {
            config.library.root = Some(root);
        }
        if let Some(store_name) = overrides.store_name {
            config.remote.store_name = store_name;
        }
        if let Some(base_url) = overrides.base_url {
            config.remote.base_url = base_url;
        }
        if let Some(limit) = overrides.concurrency_limit {
            config.orchestrator.concurrency_limit = limit;
        }
    }

    fn load_env_file(&self) -> Result<bool> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(other) => Err(ConfigError::EnvFile(other)),
        }
    }

    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.options.config_path {
            return Some(explicit.clone());
        }
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|candidate: &PathBuf| candidate.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience used by the self-check: validates library root, store
/// name, and base URL together so a misconfigured operator sees every
/// problem in one pass.
pub fn self_check(config: &Config) -> std::result::Result<(), Vec<String>> {
    validation::apply_guard_rails(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn isolated_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn defaults_apply_when_no_file_or_env_present() {
        let dir = isolated_dir();
        let loader = ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: None,
            env_file: Some(dir.path().join("missing.env")),
        });
        let config = loader.load(CliOverrides::default()).unwrap();
        assert_eq!(config.orchestrator.concurrency_limit, 10);
        assert_eq!(config.rate_guard.requests_per_minute, 20);
        assert_eq!(config.catalog.db_path, PathBuf::from("shelfsync.db"));
    }

    #[test]
    fn explicit_missing_config_path_is_an_error() {
        let dir = isolated_dir();
        let loader = ConfigLoader::new().with_config_path(dir.path().join("nope.toml"));
        let err = loader.load(CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingConfig { .. }));
    }

    #[test]
    fn file_values_are_overridden_by_cli_overrides() {
        let dir = isolated_dir();
        let path = dir.path().join("shelfsync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
            [remote]
            base_url = "https://file.example.com"
            store_name = "from-file"

            [orchestrator]
            concurrency_limit = 4
            batch_limit = 256
            import_timeout_secs = 120
            visibility_timeout_secs = 300
            post_batch_cooldown_secs = 30
            prune_window_days = 7

            [rate_guard]
            requests_per_minute = 20
            min_interval_secs = 3
            window_secs = 60
            error_rate_trip_threshold = 0.05
            consecutive_rate_limit_trip = 3
            open_cooldown_secs = 30

            [catalog]
            db_path = "shelfsync.db"
            "#
        )
        .unwrap();

        let loader = ConfigLoader::new().with_config_path(&path);
        let overrides = CliOverrides {
            store_name: Some("from-cli".to_string()),
            concurrency_limit: Some(99),
            ..Default::default()
        };
        let config = loader.load(overrides).unwrap();

        assert_eq!(config.remote.store_name, "from-cli", "CLI override must win over the file");
        assert_eq!(config.remote.base_url, "https://file.example.com", "unoverridden fields keep the file value");
        assert_eq!(config.orchestrator.concurrency_limit, 99);
    }

    #[test]
    fn self_check_flags_unconfigured_library_root() {
        let config = Config::default();
        let errors = self_check(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("library root")));
    }
}
