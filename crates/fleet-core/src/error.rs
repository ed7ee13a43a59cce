//! Error handling for the fleet control plane
//!
//! Provides a unified error type and result alias shared by every fleet
//! component, with helpers for classification and HTTP status mapping.

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the fleet control plane
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid principal
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Token balance too low for the requested completion
    #[error("Insufficient token balance: have {current}, need {required}")]
    QuotaExceeded { current: i64, required: i64 },

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Request rejected by a token-bucket limiter
    #[error("Rate limited: {code}")]
    RateLimited { code: &'static str },

    /// No ports left in the pool
    #[error("No ports available in pool")]
    PortsExhausted,

    /// Child process could not be spawned
    #[error("Failed to spawn backend process: {0}")]
    Spawn(String),

    /// Backend transport failure (proxy or completion call)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Resource temporarily unavailable
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a backend transport error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Backend(_)
                | Error::Network(_)
                | Error::Unavailable(_)
                | Error::Timeout(_)
                | Error::Internal(_)
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_)
                | Error::InvalidRequest(_)
                | Error::Unauthorized(_)
                | Error::QuotaExceeded { .. }
                | Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::RateLimited { .. }
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::QuotaExceeded { .. } => "quota",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::RateLimited { .. } => "rate_limited",
            Error::PortsExhausted => "ports_exhausted",
            Error::Spawn(_) => "spawn",
            Error::Backend(_) => "backend",
            Error::Unavailable(_) => "unavailable",
            Error::Timeout(_) => "timeout",
            Error::Network(_) => "network",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Other(_) => "other",
        }
    }

    /// Convert to an HTTP status code for the REST boundary
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) | Error::Json(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::QuotaExceeded { .. } => 402,
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::RateLimited { .. } => 429,
            Error::Backend(_) | Error::Network(_) => 502,
            Error::Unavailable(_) => 503,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("missing catalog path");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: missing catalog path");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("x").category(), "configuration");
        assert_eq!(Error::not_found("x").category(), "not_found");
        assert_eq!(Error::PortsExhausted.category(), "ports_exhausted");
        assert_eq!(
            Error::RateLimited { code: "RATE_LIMIT_EXCEEDED" }.category(),
            "rate_limited"
        );
    }

    #[test]
    fn test_error_classification() {
        let client_err = Error::invalid_request("bad params");
        assert!(client_err.is_client_error());
        assert!(!client_err.is_retryable());

        let backend_err = Error::backend("connection refused");
        assert!(!backend_err.is_client_error());
        assert!(backend_err.is_retryable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(Error::invalid_request("x").to_http_status(), 400);
        assert_eq!(Error::unauthorized("x").to_http_status(), 401);
        assert_eq!(
            Error::QuotaExceeded { current: 5, required: 70 }.to_http_status(),
            402
        );
        assert_eq!(Error::not_found("x").to_http_status(), 404);
        assert_eq!(
            Error::RateLimited { code: "USER_RATE_LIMIT_EXCEEDED" }.to_http_status(),
            429
        );
        assert_eq!(Error::PortsExhausted.to_http_status(), 500);
        assert_eq!(Error::backend("x").to_http_status(), 502);
        assert_eq!(Error::unavailable("x").to_http_status(), 503);
    }

    #[test]
    fn test_quota_error_message() {
        let err = Error::QuotaExceeded { current: 5, required: 70 };
        assert_eq!(
            err.to_string(),
            "Insufficient token balance: have 5, need 70"
        );
    }
}
