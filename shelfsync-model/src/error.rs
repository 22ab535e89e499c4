use thiserror::Error;

/// Errors surfaced by shared model types (hashing, path normalization, parsing).
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid file path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ModelError>;
