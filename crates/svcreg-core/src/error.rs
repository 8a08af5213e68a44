//! Core error types.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing versions, rules, names, or addresses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("{0}")]
    InvalidVersion(String),

    #[error("invalid version rule \"{rule}\": {reason}")]
    InvalidVersionRule { rule: String, reason: String },

    #[error("invalid address \"{0}\"")]
    InvalidAddress(String),
}
