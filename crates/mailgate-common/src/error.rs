//! Error types for MailGate

use thiserror::Error;

/// Main error type for MailGate
///
/// Only construction-time problems surface as errors. Checks performed while
/// a message is being evaluated fold their failures into the score instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for MailGate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Key(_) => "KEY_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error is caused by operator configuration
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Key(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Config("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(Error::Key("bad pem".into()).code(), "KEY_ERROR");
        assert_eq!(Error::Internal("boom".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_is_config() {
        assert!(Error::Key("missing".into()).is_config());
        assert!(!Error::Validation("bad rcpt".into()).is_config());
    }
}
