use std::time::Duration;

use thiserror::Error;

use crate::request::RequestType;

/// Classification of a failed exchange with a remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network failure, timeout or server-side (5xx) error.
    Transport,
    /// Missing, invalid or expired credential.
    Authentication,
    /// The service asked us to slow down.
    RateLimited,
    /// The referenced media or library entry does not exist remotely.
    NotFound,
    /// The response could not be understood.
    Malformed,
    /// The service refused the request for any other reason.
    ServiceRejected,
}

impl ErrorClass {
    /// Only transport failures and rate limiting are worth retrying.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transport | Self::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport error",
            Self::Authentication => "authentication error",
            Self::RateLimited => "rate limited",
            Self::NotFound => "not found",
            Self::Malformed => "malformed response",
            Self::ServiceRejected => "rejected by service",
        }
    }

    /// Map an HTTP status code to an error class.
    ///
    /// Returns `None` for success codes.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(Self::Authentication),
            404 => Some(Self::NotFound),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::Transport),
            _ => Some(Self::ServiceRejected),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured description of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct ErrorInfo {
    pub class: ErrorClass,
    pub message: String,
    pub retriable: bool,
    /// Server-provided hint for when to try again (rate limiting).
    pub retry_after: Option<Duration>,
}

impl ErrorInfo {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retriable: class.is_retriable(),
            retry_after: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transport, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Authentication, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorClass::RateLimited, message)
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Malformed, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ServiceRejected, message)
    }

    /// Build an error for a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let class = ErrorClass::from_status(status).unwrap_or(ErrorClass::ServiceRejected);
        let message = format!("HTTP {status}: {}", message.into());
        match class {
            ErrorClass::RateLimited => Self::rate_limited(message, retry_after),
            _ => Self::new(class, message),
        }
    }

    pub fn is(&self, class: ErrorClass) -> bool {
        self.class == class
    }
}

/// A request could not be turned into an HTTP exchange.
///
/// This is a caller contract violation, never a remote failure, so no
/// transport activity happens when it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("{request_type} requires parameter `{name}`")]
    MissingParameter {
        request_type: RequestType,
        name: &'static str,
    },

    #[error("{request_type} parameter `{name}` is invalid: {reason}")]
    InvalidParameter {
        request_type: RequestType,
        name: &'static str,
        reason: String,
    },
}

/// Failure below the HTTP layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<TransportError> for ErrorInfo {
    fn from(e: TransportError) -> Self {
        ErrorInfo::transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorClass::from_status(200), None);
        assert_eq!(ErrorClass::from_status(204), None);
        assert_eq!(ErrorClass::from_status(401), Some(ErrorClass::Authentication));
        assert_eq!(ErrorClass::from_status(403), Some(ErrorClass::Authentication));
        assert_eq!(ErrorClass::from_status(404), Some(ErrorClass::NotFound));
        assert_eq!(ErrorClass::from_status(429), Some(ErrorClass::RateLimited));
        assert_eq!(ErrorClass::from_status(503), Some(ErrorClass::Transport));
        assert_eq!(ErrorClass::from_status(422), Some(ErrorClass::ServiceRejected));
    }

    #[test]
    fn test_retriable_follows_class() {
        assert!(ErrorInfo::transport("x").retriable);
        assert!(ErrorInfo::rate_limited("x", None).retriable);
        assert!(!ErrorInfo::authentication("x").retriable);
        assert!(!ErrorInfo::not_found("x").retriable);
        assert!(!ErrorInfo::malformed("x").retriable);
        assert!(!ErrorInfo::rejected("x").retriable);
    }

    #[test]
    fn test_from_status_keeps_retry_after() {
        let err = ErrorInfo::from_status(429, "slow down", Some(Duration::from_secs(7)));
        assert!(err.is(ErrorClass::RateLimited));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));

        let err = ErrorInfo::from_status(500, "boom", Some(Duration::from_secs(7)));
        assert!(err.is(ErrorClass::Transport));
        assert_eq!(err.retry_after, None);
    }
}
