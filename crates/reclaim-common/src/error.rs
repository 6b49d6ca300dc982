//! Error types for Reclaim
//!
//! This module defines the common error types shared by the codec,
//! configuration and queue layers.

use thiserror::Error;

/// Common result type for Reclaim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Reclaim
#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt encoding: {0}")]
    Corrupt(String),

    #[error("unsupported encoding version for {what}: compat {compat}, supported {supported}")]
    UnsupportedVersion {
        what: &'static str,
        compat: u8,
        supported: u8,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error describes undecodable input
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::UnsupportedVersion { .. })
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_corruption() {
        assert!(Error::corrupt("short read").is_corruption());
        assert!(
            Error::UnsupportedVersion {
                what: "purge_item",
                compat: 9,
                supported: 1
            }
            .is_corruption()
        );
        assert!(!Error::internal("test").is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = Error::corrupt("truncated layout");
        assert_eq!(err.to_string(), "corrupt encoding: truncated layout");
    }
}
