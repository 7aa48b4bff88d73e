//! Core error types for Wharf using Railway-Oriented Programming.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for configuration and process-level operations.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    // Configuration errors
    #[error("invalid setting '{setting}': {reason}")]
    InvalidSetting { setting: String, reason: String },
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid setting error.
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_setting_display() {
        let err = Error::invalid_setting("recovery_batch_size", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid setting 'recovery_batch_size': must be greater than zero"
        );
    }

    #[test]
    fn test_file_read_failed_display() {
        let err = Error::file_read_failed("/etc/wharf.toml", "permission denied");
        assert!(err.to_string().contains("/etc/wharf.toml"));
        assert!(err.to_string().contains("permission denied"));
    }
}
