use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::WebhookId;

/// Errors returned by the producer API before any delivery work is queued.
#[derive(Debug)]
pub enum DispatchError {
    /// The webhook configuration does not exist. Nothing was queued.
    ConfigurationNotFound {
        webhook_id: WebhookId,
    },

    /// A webhook configuration failed validation.
    Invalid(ValidationError),

    /// The delivery store rejected the pending record.
    Store(StoreError),

    /// The delivery message could not be published.
    Channel(ChannelError),

    /// The HTTP client could not be constructed.
    HttpClient(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ConfigurationNotFound { webhook_id } =>
                write!(f, "webhook configuration not found: {}", webhook_id),
            DispatchError::Invalid(err) =>
                write!(f, "invalid webhook configuration: {}", err),
            DispatchError::Store(err) =>
                write!(f, "delivery store error: {}", err),
            DispatchError::Channel(err) =>
                write!(f, "message channel error: {}", err),
            DispatchError::HttpClient(msg) =>
                write!(f, "failed to build HTTP client: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        DispatchError::Store(err)
    }
}

impl From<ChannelError> for DispatchError {
    fn from(err: ChannelError) -> Self {
        DispatchError::Channel(err)
    }
}

impl From<ValidationError> for DispatchError {
    fn from(err: ValidationError) -> Self {
        DispatchError::Invalid(err)
    }
}

/// Outcome classification recorded on failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// No response was received at all.
    Network,
    /// HTTP 429, or the local rate-limit pre-check tripped.
    #[serde(rename = "ratelimit")]
    RateLimit,
    /// HTTP 5xx.
    Server,
    /// HTTP 404.
    #[serde(rename = "notfound")]
    NotFound,
    /// Any other non-2xx response.
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::RateLimit => "ratelimit",
            ErrorClass::Server => "server",
            ErrorClass::NotFound => "notfound",
            ErrorClass::Other => "other",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Network | ErrorClass::Server | ErrorClass::RateLimit)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The webhook configuration no longer exists. Terminal.
    ConfigurationNotFound,

    /// The destination is over its request budget, or answered 429.
    RateLimited,

    /// Timeout, DNS or connection failure.
    Network(String),

    /// The destination answered 5xx.
    ServerError {
        status: u16,
    },

    /// The destination answered a non-2xx status other than 429 and 5xx.
    ClientError {
        status: u16,
    },

    /// The payload could not be encoded.
    Serialization(String),

    /// A retryable failure exhausted the webhook's retry budget.
    MaxRetriesExceeded {
        retry_count: u32,
    },
}

impl DeliveryError {
    /// Classification stored on the delivery record, if the failure has one.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            DeliveryError::ConfigurationNotFound => None,
            DeliveryError::RateLimited => Some(ErrorClass::RateLimit),
            DeliveryError::Network(_) => Some(ErrorClass::Network),
            DeliveryError::ServerError { .. } => Some(ErrorClass::Server),
            DeliveryError::ClientError { status: 404 } => Some(ErrorClass::NotFound),
            DeliveryError::ClientError { .. } => Some(ErrorClass::Other),
            DeliveryError::Serialization(_) => Some(ErrorClass::Other),
            DeliveryError::MaxRetriesExceeded { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().map(|c| c.is_retryable()).unwrap_or(false)
    }

    /// HTTP status recorded for this failure. 429 is synthesized for the
    /// local rate-limit pre-check.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::RateLimited => Some(429),
            DeliveryError::ServerError { status } | DeliveryError::ClientError { status } =>
                Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::ConfigurationNotFound =>
                write!(f, "webhook configuration not found"),
            DeliveryError::RateLimited =>
                write!(f, "rate limited"),
            DeliveryError::Network(msg) =>
                write!(f, "network error: {}", msg),
            DeliveryError::ServerError { status } =>
                write!(f, "HTTP {}", status),
            DeliveryError::ClientError { status } =>
                write!(f, "HTTP {}", status),
            DeliveryError::Serialization(msg) =>
                write!(f, "failed to serialize payload: {}", msg),
            DeliveryError::MaxRetriesExceeded { retry_count } =>
                write!(f, "maximum retries exceeded after {} retries", retry_count),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// A failed attempt, after its outcome has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub error: DeliveryError,

    /// Retry count of the attempt that failed.
    pub retry_count: u32,

    /// When the next attempt is due. `None` means the failure is terminal.
    pub next_retry: Option<DateTime<Utc>>,
}

impl DeliveryFailure {
    pub fn is_terminal(&self) -> bool {
        self.next_retry.is_none()
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.next_retry {
            Some(at) => write!(f, "{} (retry {} scheduled at {})", self.error, self.retry_count + 1, at),
            None => write!(f, "{} (terminal)", self.error),
        }
    }
}

impl std::error::Error for DeliveryFailure {}

/// Result of handling one delivery message that needs no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The destination answered 2xx to this attempt.
    Delivered,

    /// The message is a redelivered copy of an attempt whose outcome is
    /// already recorded and acted on. Nothing was sent; ack and move on.
    AlreadyHandled,
}

/// Errors from a persistence or counter backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    Backend(String),
    Serialization(String),
    Timeout,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record not found: {}", id),
            StoreError::Backend(msg) => write!(f, "backend error: {}", msg),
            StoreError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            StoreError::Timeout => write!(f, "backend timed out"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors from the message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel has been closed and accepts no more messages.
    Closed,
    Backend(String),
    Serialization(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::Backend(msg) => write!(f, "channel backend error: {}", msg),
            ChannelError::Serialization(msg) => write!(f, "message serialization error: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}

/// Reasons a webhook configuration is rejected at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyEvents,
    RetryCountOutOfRange {
        retry_count: u32,
        max: u32,
    },
    InvalidUrl(String),
    EmptySecret,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyEvents =>
                write!(f, "at least one event must be subscribed"),
            ValidationError::RetryCountOutOfRange { retry_count, max } =>
                write!(f, "retry count {} outside 0..={}", retry_count, max),
            ValidationError::InvalidUrl(msg) =>
                write!(f, "invalid destination URL: {}", msg),
            ValidationError::EmptySecret =>
                write!(f, "secret must not be empty"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_status() {
        assert_eq!(DeliveryError::ServerError { status: 503 }.class(), Some(ErrorClass::Server));
        assert_eq!(DeliveryError::ClientError { status: 404 }.class(), Some(ErrorClass::NotFound));
        assert_eq!(DeliveryError::ClientError { status: 400 }.class(), Some(ErrorClass::Other));
        assert_eq!(DeliveryError::RateLimited.class(), Some(ErrorClass::RateLimit));
        assert_eq!(DeliveryError::Network("reset".into()).class(), Some(ErrorClass::Network));
        assert_eq!(DeliveryError::ConfigurationNotFound.class(), None);
    }

    #[test]
    fn only_network_server_and_ratelimit_retry() {
        assert!(DeliveryError::Network("timeout".into()).is_retryable());
        assert!(DeliveryError::ServerError { status: 500 }.is_retryable());
        assert!(DeliveryError::RateLimited.is_retryable());
        assert!(!DeliveryError::ClientError { status: 404 }.is_retryable());
        assert!(!DeliveryError::ClientError { status: 422 }.is_retryable());
        assert!(!DeliveryError::ConfigurationNotFound.is_retryable());
        assert!(!DeliveryError::MaxRetriesExceeded { retry_count: 3 }.is_retryable());
    }

    #[test]
    fn rate_limit_precheck_synthesizes_429() {
        assert_eq!(DeliveryError::RateLimited.status_code(), Some(429));
        assert_eq!(DeliveryError::Network("refused".into()).status_code(), None);
    }

    #[test]
    fn error_class_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ErrorClass::RateLimit).unwrap(), "\"ratelimit\"");
        assert_eq!(serde_json::to_string(&ErrorClass::NotFound).unwrap(), "\"notfound\"");
        assert_eq!(serde_json::to_string(&ErrorClass::Server).unwrap(), "\"server\"");
    }
}
