//! Common error types for Portcullis components.

use thiserror::Error;

/// Result alias used by the core library
pub type Result<T> = std::result::Result<T, PortcullisError>;

/// Common errors across Portcullis components
#[derive(Debug, Error)]
pub enum PortcullisError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record store or challenge cache could not be reached
    #[error("Store unavailable: {0}")]
    Store(String),

    /// Captcha generation/storage error
    #[error("Captcha error: {0}")]
    Captcha(String),

    /// Lockout notification could not be delivered
    #[error("Notification failed: {0}")]
    Notify(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PortcullisError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::Store(_) => 503,
            Self::Captcha(_) => 500,
            Self::Notify(_) => 502,
            Self::InvalidInput(_) => 400,
        }
    }

    /// Transient transport faults; callers may retry after a short wait
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Notify(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PortcullisError::Store("down".into()).status_code(), 503);
        assert_eq!(PortcullisError::InvalidInput("no ip".into()).status_code(), 400);
        assert_eq!(PortcullisError::Captcha("bad ttl".into()).status_code(), 500);
    }

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(PortcullisError::Store("timeout".into()).is_retryable());
        assert!(!PortcullisError::InvalidInput("no ip".into()).is_retryable());
        assert!(!PortcullisError::Config("bad".into()).is_retryable());
    }
}
