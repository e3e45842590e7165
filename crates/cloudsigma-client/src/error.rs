//! CloudSigma client errors

use thiserror::Error;

/// Errors that can occur when interacting with the CloudSigma API
#[derive(Debug, Error)]
pub enum CloudError {
    /// HTTP request/response error (connection reset, DNS, TLS, body decode)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// CloudSigma API returned an unexpected status
    #[error("CloudSigma API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or summary
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credentials rejected (401)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource exists but the active identity may not access it (403)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Polling gave up before the resource reached the expected state
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CloudError {
    /// Build an error from a non-success HTTP status and response body.
    #[must_use]
    pub fn from_status(status: u16, context: &str, body: &str) -> Self {
        let message = format!("{context}: {body}");
        match status {
            401 => Self::Authentication(message),
            403 => Self::PermissionDenied(message),
            404 => Self::NotFound(message),
            400 => Self::InvalidRequest(message),
            _ => Self::Api { status, message },
        }
    }

    /// True for 404 responses
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for 403 responses
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// True for errors worth retrying unchanged: network failures,
    /// timeouts, throttling and server-side errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short label used as a metrics dimension
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Api { .. } => "api",
            Self::Serialization(_) => "serialization",
            Self::Authentication(_) => "authentication",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}
