use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build layered configuration")]
    Layering(#[from] config::ConfigError),
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("configuration is invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
    #[error("OS keyring error for entry '{entry}'")]
    Keyring {
        entry: String,
        #[source]
        source: keyring::Error,
    },
    #[error("no credential found in the OS keyring for '{entry}'; run `shelfsync auth set` first")]
    CredentialMissing { entry: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
