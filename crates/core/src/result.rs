//! Result type definition and extension traits for Railway-Oriented Programming.
//!
//! Provides logged combinators so background workers can swallow a failure
//! at their boundary without unwrap/expect/panic.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for Wharf core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logged combinators for any `Result` whose error
/// can be displayed.
///
/// Durability workers never stop on a failure; they turn it into a log line
/// at the boundary with these helpers and carry on.
pub trait ResultExt<T, E> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self, context: &str) -> Option<T>;

    /// Inspect the error without consuming the Result.
    #[must_use]
    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E: Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(context, error = %e, "Operation failed");
                None
            }
        }
    }

    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged("test"), Some(42));
    }

    #[test]
    fn test_result_into_option_err() {
        let result: Result<i32> = Err(Error::invalid_setting("lock_lease_ms", "zero"));
        assert_eq!(result.into_option_logged("test"), None);
    }

    #[test]
    fn test_result_inspect_error() {
        let result: Result<i32> = Err(Error::toml_parse_failed("bad"));
        let mut called = false;
        let _ = result.inspect_error(|_| {
            called = true;
        });
        assert!(called);
    }

    #[test]
    fn test_inspect_error_skips_ok() {
        let result: std::result::Result<i32, String> = Ok(7);
        let mut called = false;
        let value = result.inspect_error(|_| called = true);
        assert_eq!(value, Ok(7));
        assert!(!called);
    }
}
