use thiserror::Error;

/// Errors surfaced by the upload pipeline and its consistency machinery.
///
/// OCC conflicts are absorbed internally by the FSM and never reach this
/// enum; transient remote errors are absorbed by the Orchestrator's retry
/// pass. Everything else surfaces.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("catalog storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("catalog migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("remote backend error: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("remote backend returned permanent error {status}: {body}")]
    RemotePermanent { status: u16, body: String },

    #[error("remote backend returned transient error {status}: {body}")]
    RemoteTransient { status: u16, body: String },

    #[error("library root is not accessible: {0}")]
    MountUnavailable(String),

    #[error("catalog is bound to store '{bound}', refusing to run against '{requested}'")]
    StoreBindingMismatch { bound: String, requested: String },

    #[error("optimistic-concurrency conflict on {0}")]
    OccConflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model error: {0}")]
    Model(#[from] shelfsync_model::ModelError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Classifies this error for retry/pacing purposes: a 429 response maps
    /// to `RateLimited`, a 5xx/timeout/connection-level failure maps to
    /// `ServerError`, and everything else (bad requests, storage/internal
    /// errors) is `Permanent`. Carried out of a failed FSM transition so the
    /// Orchestrator can report the right outcome to RateGuard and the
    /// post-batch retry pass can skip records that will never succeed.
    pub fn error_class(&self) -> shelfsync_model::ErrorClass {
        match self {
            CoreError::RemoteTransient { status, .. } if *status == 429 => shelfsync_model::ErrorClass::RateLimited,
            CoreError::RemoteTransient { .. } | CoreError::Remote(_) | CoreError::Timeout(_) => shelfsync_model::ErrorClass::ServerError,
            _ => shelfsync_model::ErrorClass::Permanent,
        }
    }

    /// Whether this error belongs to the "transient remote" taxonomy class:
    /// 429, 503, timeouts, 5xx, and connection-level failures. These are
    /// eligible for the post-batch retry pass rather than being surfaced as
    /// permanent.
    pub fn is_transient(&self) -> bool {
        self.error_class().is_retryable()
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, CoreError>;
