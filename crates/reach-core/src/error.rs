use thiserror::Error;

/// Fragments of a driver's own error text that mark a fault as a transient
/// network condition. Matched against the cause only, never the target URL.
const TRANSIENT_TOKENS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "refused",
    "reset",
    "aborted",
    "disconnected",
    "name_not_resolved",
    "dns",
    "ssl",
    "tls",
];

/// Browser error codes that identify a network-layer failure regardless of variant.
const NETWORK_ERROR_CODES: &[&str] = &[
    "ERR_CONNECTION_REFUSED",
    "ERR_NAME_NOT_RESOLVED",
    "ERR_CONNECTION_RESET",
    "ERR_CONNECTION_ABORTED",
    "ERR_CONNECTION_FAILED",
    "ERR_INTERNET_DISCONNECTED",
    "ERR_SSL_PROTOCOL_ERROR",
    "ERR_TIMED_OUT",
];

/// Application-wide error types for Reach.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed permanently (client-error status, malformed response, ...).
    ///
    /// Transient HTTP conditions are reported as [`AppError::NetworkError`] or
    /// [`AppError::Timeout`] by the session that saw them.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Page load or request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error (reset, refused, DNS, TLS).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The automation session referenced a page element that no longer exists.
    #[error("Stale session reference: {0}")]
    StaleSession(String),

    /// General automation driver fault. `cause` is the driver's own error
    /// text; `context` says what was being attempted.
    #[error("Driver error: {context}: {cause}")]
    DriverError { context: String, cause: String },

    /// Expected page element or shape was not found.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Row target identifier is missing or not a usable URL.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Browser-automation session could not be created.
    #[error("Session error: {0}")]
    SessionError(String),

    /// Checkpoint storage failed.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Work was interrupted by a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Stable classification label used for counters, checkpoint failure
    /// details and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::HttpError(_) => "http",
            AppError::Timeout(_) => "timeout",
            AppError::NetworkError(_) => "network",
            AppError::StaleSession(_) => "stale_session",
            AppError::DriverError { .. } => "driver",
            AppError::ElementNotFound(_) => "element_not_found",
            AppError::InvalidTarget(_) => "invalid_target",
            AppError::SessionError(_) => "session",
            AppError::CheckpointError(_) => "checkpoint",
            AppError::ConfigError(_) => "config",
            AppError::SerializationError(_) => "serialization",
            AppError::Cancelled => "cancelled",
            AppError::Generic(_) => "generic",
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::StaleSession(_) => true,
            AppError::DriverError { cause, .. } => has_transient_token(cause),
            _ => false,
        }
    }

    /// Network-layer failures, used to pick the log level of an error record.
    pub fn is_network(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::DriverError { cause, .. } => {
                NETWORK_ERROR_CODES.iter().any(|code| cause.contains(code))
            }
            _ => false,
        }
    }

    /// Wrap a driver failure, keeping its own text apart from the context.
    pub fn driver(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        AppError::DriverError {
            context: context.into(),
            cause: cause.to_string(),
        }
    }

    /// Page-shape failures (missing or stale elements).
    pub fn is_dom(&self) -> bool {
        matches!(
            self,
            AppError::ElementNotFound(_) | AppError::StaleSession(_)
        )
    }
}

fn has_transient_token(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    TRANSIENT_TOKENS.iter().any(|token| lower.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::StaleSession("element detached".into()).is_retryable());
        assert!(AppError::driver("navigate", "net::ERR_CONNECTION_RESET").is_retryable());
        assert!(AppError::driver("read content", "Request timed out.").is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!AppError::ElementNotFound("body".into()).is_retryable());
        assert!(!AppError::InvalidTarget("".into()).is_retryable());
        assert!(!AppError::driver("navigate", "unknown command").is_retryable());
        assert!(!AppError::HttpError("HTTP 404 for https://example.com".into()).is_retryable());
        assert!(!AppError::Generic("boom".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
    }

    #[test]
    fn test_target_url_does_not_make_errors_retryable() {
        for url in [
            "https://www.networksolutions.com/contact",
            "https://dnsimple.com/about",
            "https://reset-tls-connection.test/",
        ] {
            let err = AppError::HttpError(format!("HTTP 404 for {url}"));
            assert!(!err.is_retryable(), "{err}");

            let err = AppError::driver(format!("Failed to navigate to {url}"), "Invalid parameters");
            assert!(!err.is_retryable(), "{err}");
        }
    }

    #[test]
    fn test_driver_context_is_not_classified() {
        let err = AppError::driver("Failed to read page content", "Could not find node with given id");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Driver error: Failed to read page content: Could not find node with given id"
        );
    }

    #[test]
    fn test_network_classification() {
        assert!(AppError::Timeout(10).is_network());
        assert!(AppError::driver("navigate", "net::ERR_NAME_NOT_RESOLVED").is_network());
        assert!(!AppError::ElementNotFound("a".into()).is_network());
        assert!(AppError::ElementNotFound("a".into()).is_dom());
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(AppError::Timeout(1).kind(), "timeout");
        assert_eq!(AppError::InvalidTarget("x".into()).kind(), "invalid_target");
        assert_eq!(AppError::Cancelled.kind(), "cancelled");
    }
}
