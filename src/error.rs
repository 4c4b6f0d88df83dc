//! Error types for the rate limiting engine.

use std::time::Duration;

use thiserror::Error;

use crate::store::{ScriptName, StoreError};

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// A request failed validation. Batches are rejected as a whole.
    #[error("Invalid request at index {index}: {reason}")]
    Validation { index: usize, reason: String },

    /// The script registry has no handle for the program yet.
    #[error("Script handle not ready: {0}")]
    HandleNotReady(ScriptName),

    /// The backing store could not be reached or returned an error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A batch did not complete within the configured deadline
    #[error("Batch timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    pub(crate) fn validation(index: usize, reason: impl Into<String>) -> Self {
        Self::Validation {
            index,
            reason: reason.into(),
        }
    }
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
