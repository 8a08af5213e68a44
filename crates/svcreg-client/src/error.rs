//! Registry facade error types.

use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors reported by a `RegistryClient`.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("watch stream error: {0}")]
    Watch(String),

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
