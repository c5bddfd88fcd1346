//! Error types for Tachikoma
//!
//! Every fallible library operation returns [`Result`]. Errors local to a
//! single turn are reported by the run loop and never terminate the process.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum TachikomaError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Publish/subscribe transport failure.
    #[error("Bus error: {0}")]
    Bus(String),

    /// Generation backend failure (not cancellation).
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tool invocation failure.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Malformed topic or payload.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The generation was cancelled. Never reported as a failure.
    #[error("Generation cancelled")]
    Cancelled,

    /// An operation exceeded its time bound.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TachikomaError {
    /// Whether this error is a cancellation rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TachikomaError::Cancelled)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TachikomaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TachikomaError::Bus("broker unreachable".into());
        assert_eq!(err.to_string(), "Bus error: broker unreachable");
        assert_eq!(TachikomaError::Timeout(5).to_string(), "Timed out after 5s");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(TachikomaError::Cancelled.is_cancelled());
        assert!(!TachikomaError::Provider("boom".into()).is_cancelled());
    }
}
