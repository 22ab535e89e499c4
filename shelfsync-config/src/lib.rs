//! Layered configuration loading and OS-keyring credential resolution
//! for shelfsync: defaults -> config file -> environment -> CLI flags,
//! plus the pre-flight self-check the CLI runs before driving the core.

pub mod credentials;
pub mod error;
pub mod loader;
pub mod models;
pub mod validation;

pub use credentials::{ApiKey, CredentialStore};
pub use error::{ConfigError, Result};
pub use loader::{CliOverrides, ConfigLoader, ConfigLoaderOptions};
pub use models::{CatalogConfig, Config, LibraryConfig, OrchestratorTuning, RateGuardTuning, RemoteConfig};
