//! Error types for RelayClaw
//!
//! One crate-wide error enum, [`RelayError`], derived with `thiserror`, plus a
//! structured [`ProviderError`] classification for model-backend failures.
//!
//! Only some variants carry text that is safe to show to the model or to a
//! human. Everything else is internal detail: it goes to the logs and is
//! replaced by a generic message at the model/user boundary (see
//! [`RelayError::model_safe_message`]).

use std::fmt;
use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Structured classification of model-backend failures.
///
/// Lets the retry wrapper decide without string matching.
#[derive(Debug)]
pub enum ProviderError {
    /// 401: invalid credentials
    Auth(String),
    /// 429: rate limit or quota exceeded
    RateLimit(String),
    /// 402: billing problem
    Billing(String),
    /// 5xx from the backend
    ServerError(String),
    /// 400: malformed request
    InvalidRequest(String),
    /// 404: unknown model
    ModelNotFound(String),
    /// Connect or read timeout
    Timeout(String),
    /// Backend is shedding load
    Overloaded(String),
    /// Response could not be decoded
    Format(String),
    /// Anything unclassified
    Unknown(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ProviderError::RateLimit(msg) => write!(f, "Rate limit error: {}", msg),
            ProviderError::Billing(msg) => write!(f, "Billing error: {}", msg),
            ProviderError::ServerError(msg) => write!(f, "Server error: {}", msg),
            ProviderError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ProviderError::ModelNotFound(msg) => write!(f, "Model not found: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ProviderError::Overloaded(msg) => write!(f, "Overloaded: {}", msg),
            ProviderError::Format(msg) => write!(f, "Format error: {}", msg),
            ProviderError::Unknown(msg) => write!(f, "Unknown provider error: {}", msg),
        }
    }
}

impl ProviderError {
    /// Returns `true` for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_)
                | ProviderError::ServerError(_)
                | ProviderError::Timeout(_)
                | ProviderError::Overloaded(_)
        )
    }

    /// HTTP status code conventionally associated with this failure.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Auth(_) => Some(401),
            ProviderError::RateLimit(_) => Some(429),
            ProviderError::Billing(_) => Some(402),
            ProviderError::ServerError(_) => Some(500),
            ProviderError::InvalidRequest(_) | ProviderError::Format(_) => Some(400),
            ProviderError::ModelNotFound(_) => Some(404),
            ProviderError::Overloaded(_) => Some(503),
            ProviderError::Timeout(_) | ProviderError::Unknown(_) => None,
        }
    }
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        RelayError::ProviderTyped(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for RelayClaw operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid configuration, duplicate registration, double start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Untyped model-backend failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Classified model-backend failure
    #[error("Provider error: {0}")]
    ProviderTyped(ProviderError),

    #[error("Channel error: {0}")]
    Channel(String),

    /// Tool execution failure with a human-readable reason
    #[error("Tool error: {0}")]
    Tool(String),

    /// Session persistence or state failure
    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The other half of a bus queue was dropped
    #[error("Bus error: channel closed")]
    BusClosed,

    /// A bounded queue configured to reject was full
    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Path escape, denied command, delegation depth exceeded
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Work abandoned because of shutdown or an explicit cancel
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Generic text used wherever an internal error would otherwise leak.
pub const GENERIC_FAILURE: &str = "An internal error occurred while handling this request.";

impl RelayError {
    /// Whether the Display text of this error may be shown to the model or a user.
    pub fn is_model_safe(&self) -> bool {
        matches!(
            self,
            RelayError::Tool(_)
                | RelayError::SecurityViolation(_)
                | RelayError::NotFound(_)
                | RelayError::Cancelled(_)
                | RelayError::Timeout(_)
        )
    }

    /// Sanitized text for the model/user boundary.
    pub fn model_safe_message(&self) -> String {
        if self.is_model_safe() {
            self.to_string()
        } else {
            GENERIC_FAILURE.to_string()
        }
    }

    /// Whether this error is a cancellation or timeout rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RelayError::Cancelled(_) | RelayError::Timeout(_))
    }
}

/// A specialized `Result` type for RelayClaw operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::Config("missing model".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing model");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(!err.is_model_safe());
    }

    #[test]
    fn test_model_safe_message_hides_internal_detail() {
        let err = RelayError::Session("disk /var/lib/x failed: EIO".into());
        assert_eq!(err.model_safe_message(), GENERIC_FAILURE);

        let err = RelayError::Tool("file not found: notes.txt".into());
        assert_eq!(err.model_safe_message(), "Tool error: file not found: notes.txt");
    }

    #[test]
    fn test_provider_error_never_model_safe() {
        let err: RelayError = ProviderError::Auth("sk-secret".into()).into();
        assert!(!err.is_model_safe());
        assert!(!err.model_safe_message().contains("sk-secret"));
    }

    #[test]
    fn test_is_cancellation() {
        assert!(RelayError::Cancelled("shutdown".into()).is_cancellation());
        assert!(RelayError::Timeout("turn".into()).is_cancellation());
        assert!(!RelayError::BusClosed.is_cancellation());
    }

    #[test]
    fn test_queue_full_display() {
        let err = RelayError::QueueFull("inbound".into());
        assert_eq!(err.to_string(), "Queue full: inbound");
    }

    #[test]
    fn test_provider_error_is_retryable() {
        assert!(ProviderError::RateLimit("429".into()).is_retryable());
        assert!(ProviderError::ServerError("500".into()).is_retryable());
        assert!(ProviderError::Timeout("t".into()).is_retryable());
        assert!(ProviderError::Overloaded("busy".into()).is_retryable());

        assert!(!ProviderError::Auth("401".into()).is_retryable());
        assert!(!ProviderError::Billing("402".into()).is_retryable());
        assert!(!ProviderError::InvalidRequest("400".into()).is_retryable());
        assert!(!ProviderError::ModelNotFound("404".into()).is_retryable());
        assert!(!ProviderError::Format("bad".into()).is_retryable());
        assert!(!ProviderError::Unknown("?".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_status_code() {
        assert_eq!(ProviderError::Auth("x".into()).status_code(), Some(401));
        assert_eq!(ProviderError::RateLimit("x".into()).status_code(), Some(429));
        assert_eq!(ProviderError::Overloaded("x".into()).status_code(), Some(503));
        assert_eq!(ProviderError::Timeout("x".into()).status_code(), None);
    }

    #[test]
    fn test_provider_typed_display() {
        let err = RelayError::ProviderTyped(ProviderError::Auth("invalid key".into()));
        assert_eq!(
            err.to_string(),
            "Provider error: Authentication error: invalid key"
        );
    }
}
