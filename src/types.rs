use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, ValidationError};

/// Identifier of a registered webhook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(pub String);

impl WebhookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one logical delivery.
///
/// Generated once at enqueue time and carried unchanged through every retry,
/// so receivers can use it to deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered destination and the events it subscribes to.
///
/// Delivery records reference a configuration by id only, so editing a
/// configuration (for example rotating the secret) never rewrites history.
#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: WebhookId,
    pub name: String,

    /// Destination URL. Also the rate-limit key.
    pub url: String,

    /// Shared HMAC secret. Never logged.
    pub secret: String,

    pub enabled: bool,

    /// Subscribed event names. Must not be empty.
    pub events: Vec<String>,

    /// Extra headers attached to every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Maximum number of retries after the first attempt.
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    /// Create an enabled configuration with three retries and no custom headers.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
        events: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id: WebhookId(id),
            url: url.into(),
            secret: secret.into(),
            enabled: true,
            events: events.into_iter().map(Into::into).collect(),
            headers: BTreeMap::new(),
            retry_count: 3,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    /// Check registration invariants.
    pub fn validate(&self, max_retry_bound: u32) -> Result<(), ValidationError> {
        if self.events.is_empty() || self.events.iter().all(|e| e.trim().is_empty()) {
            return Err(ValidationError::EmptyEvents);
        }
        if self.retry_count > max_retry_bound {
            return Err(ValidationError::RetryCountOutOfRange {
                retry_count: self.retry_count,
                max: max_retry_bound,
            });
        }
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ValidationError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        if self.secret.is_empty() {
            return Err(ValidationError::EmptySecret);
        }
        Ok(())
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("events", &self.events)
            .field("headers", &self.headers)
            .field("retry_count", &self.retry_count)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// One HTTP attempt (or short-circuited attempt) of a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub retry_count: u32,
    pub status_code: Option<u16>,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempted_at: DateTime<Utc>,
}

/// Audit record of one logical delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,

    /// Retry count of the latest attempt. Starts at 0.
    pub retry_count: u32,

    /// Present only while the delivery is failed and a retry is scheduled.
    pub next_retry: Option<DateTime<Utc>>,

    pub duration_ms: Option<u64>,

    /// Retry count of the latest attempt whose message has been published.
    #[serde(default)]
    pub retry_scheduled: Option<u32>,

    /// Attempt history, oldest first.
    #[serde(default)]
    pub attempts: Vec<DeliveryAttempt>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn pending(webhook_id: WebhookId, event: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::generate(),
            webhook_id,
            event: event.into(),
            payload,
            status: DeliveryStatus::Pending,
            status_code: None,
            response_body: None,
            error: None,
            error_class: None,
            retry_count: 0,
            next_retry: None,
            duration_ms: None,
            retry_scheduled: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            DeliveryStatus::Pending => false,
            DeliveryStatus::Success => true,
            DeliveryStatus::Failed => self.next_retry.is_none(),
        }
    }

    pub fn attempt_for(&self, retry_count: u32) -> Option<&DeliveryAttempt> {
        self.attempts.iter().find(|a| a.retry_count == retry_count)
    }

    /// Whether the attempt following `retry_count` has already been published.
    pub fn has_successor(&self, retry_count: u32) -> bool {
        self.retry_count > retry_count
            || self.retry_scheduled.is_some_and(|scheduled| scheduled > retry_count)
    }

    /// Note that the message for attempt `retry_count` is on the retry queue.
    pub fn mark_retry_scheduled(&mut self, retry_count: u32) -> bool {
        if self.status == DeliveryStatus::Success
            || self.retry_scheduled.is_some_and(|scheduled| scheduled >= retry_count)
        {
            return false;
        }
        self.retry_scheduled = Some(retry_count);
        self.updated_at = Utc::now();
        true
    }

    /// Apply the outcome of an attempt.
    ///
    /// Updates older than the latest recorded attempt, and repeats of an
    /// attempt already in the history, leave the record untouched. A
    /// successful record never changes again.
    pub fn apply(&mut self, update: DeliveryUpdate) -> bool {
        if self.status == DeliveryStatus::Success {
            return false;
        }
        if update.retry_count < self.retry_count && !self.attempts.is_empty() {
            return false;
        }
        if self.attempt_for(update.retry_count).is_some() {
            return false;
        }

        let now = Utc::now();
        self.status = update.status;
        self.status_code = update.status_code;
        self.response_body = update.response_body;
        self.error = update.error.clone();
        self.error_class = update.error_class;
        self.retry_count = update.retry_count;
        self.next_retry = match update.status {
            DeliveryStatus::Success => None,
            _ => update.next_retry,
        };
        self.duration_ms = Some(update.duration_ms);
        self.attempts.push(DeliveryAttempt {
            retry_count: update.retry_count,
            status_code: update.status_code,
            error_class: update.error_class,
            error: update.error,
            duration_ms: update.duration_ms,
            attempted_at: now,
        });
        self.updated_at = now;
        true
    }
}

/// Fields written by `DeliveryStore::update_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub retry_count: u32,
    pub next_retry: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Message carried on the primary and retry queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMessage {
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: serde_json::Value,
    pub delivery_id: DeliveryId,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

impl DeliveryMessage {
    pub fn for_record(record: &DeliveryRecord) -> Self {
        Self {
            webhook_id: record.webhook_id.clone(),
            event: record.event.clone(),
            payload: record.payload.clone(),
            delivery_id: record.id.clone(),
            retry_count: 0,
            next_retry: None,
        }
    }

    /// The message for the next attempt of the same delivery.
    pub fn next_attempt(&self, next_retry: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            next_retry: Some(next_retry),
            ..self.clone()
        }
    }
}
