// ABOUTME: Error type shared by all runtime adapters
// ABOUTME: Distinguishes unreachable engines, missing containers, timeouts and operation failures

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Runtime operation failed: {0}")]
    Operation(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
