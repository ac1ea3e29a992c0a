use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::channel::{InMemoryChannel, MessageChannel, Queue};
use crate::error::{
    DeliveryError, DeliveryFailure, DeliveryOutcome, DispatchError, ErrorClass, StoreError,
};
use crate::rate_limit::{CounterStore, InMemoryCounterStore, RateLimitConfig, RateLimiter};
use crate::signing::{
    signature_header_value, DELIVERY_HEADER, EVENT_HEADER, RESERVED_HEADERS, SIGNATURE_HEADER,
    WEBHOOK_ID_HEADER,
};
use crate::storage::{DeliveryStore, InMemoryRegistry, InMemoryStorage, WebhookRegistry};
use crate::types::{
    DeliveryAttempt, DeliveryId, DeliveryMessage, DeliveryRecord, DeliveryStatus, DeliveryUpdate,
    WebhookConfig, WebhookId,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
fn metric_inc_class(name: &'static str, class: Option<ErrorClass>) {
    let class = class.map(|c| c.as_str()).unwrap_or("configuration");
    metrics::increment_counter!(name, "class" => class);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc_class(_name: &'static str, _class: Option<ErrorClass>) {}

#[cfg(feature = "metrics")]
fn metric_duration(duration_ms: u64) {
    metrics::histogram!("webhook.delivery.duration_ms", duration_ms as f64);
}

#[cfg(not(feature = "metrics"))]
fn metric_duration(_duration_ms: u64) {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on one HTTP attempt.
    pub send_timeout_ms: u64,

    /// Response bodies longer than this are truncated before persisting.
    pub max_response_body_chars: usize,

    /// Largest `retry_count` a webhook configuration may declare.
    pub max_retry_bound: u32,

    /// Delay before retry `n` (0-indexed) is `unit * base^(n+1)`.
    pub retry_backoff_base: u64,
    pub retry_backoff_unit_ms: u64,

    pub user_agent: String,

    pub rate_limit: RateLimitConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            max_response_body_chars: 4_096,
            max_retry_bound: 10,
            retry_backoff_base: 5,
            retry_backoff_unit_ms: 1_000,
            user_agent: concat!("webhook-relay/", env!("CARGO_PKG_VERSION")).to_string(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Runs delivery attempts and accepts new deliveries from producers.
///
/// Holds no per-delivery state of its own: the rate-limit counter and the
/// delivery records live in their collaborators, so any number of workers
/// (in this process or others) can share them.
pub struct Dispatcher {
    registry: Arc<dyn WebhookRegistry>,
    store: Arc<dyn DeliveryStore>,
    channel: Arc<dyn MessageChannel>,
    rate_limiter: RateLimiter,
    http_client: reqwest::Client,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher wired to in-memory collaborators.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.send_timeout_ms.max(1)))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DispatchError::HttpClient(e.to_string()))?;

        let rate_limiter = RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            config.rate_limit.clone(),
        );

        Ok(Self {
            registry: Arc::new(InMemoryRegistry::new(config.max_retry_bound)),
            store: Arc::new(InMemoryStorage::new()),
            channel: Arc::new(InMemoryChannel::new()),
            rate_limiter,
            http_client,
            config,
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn WebhookRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.rate_limiter = RateLimiter::new(store, self.config.rate_limit.clone());
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn channel(&self) -> Arc<dyn MessageChannel> {
        self.channel.clone()
    }

    /// Accept a delivery and queue it for the workers.
    ///
    /// Returns the pending record as soon as the message is published; the
    /// destination is never contacted on the caller's task.
    pub async fn enqueue_delivery(
        &self,
        webhook_id: &WebhookId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<DeliveryRecord, DispatchError> {
        let config = self
            .registry
            .find_by_id(webhook_id)
            .await?
            .ok_or_else(|| DispatchError::ConfigurationNotFound {
                webhook_id: webhook_id.clone(),
            })?;

        self.enqueue_for(&config, event, payload).await
    }

    /// Enqueue one delivery per enabled webhook subscribed to `event`.
    pub async fn dispatch_event(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<DeliveryRecord>, DispatchError> {
        let configs = self.registry.find_by_event(event).await?;
        if configs.is_empty() {
            tracing::debug!(
                target: "webhook_delivery",
                event,
                "No enabled webhooks subscribe to event"
            );
        }

        let mut records = Vec::with_capacity(configs.len());
        for config in configs {
            records.push(self.enqueue_for(&config, event, payload.clone()).await?);
        }
        Ok(records)
    }

    async fn enqueue_for(
        &self,
        config: &WebhookConfig,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<DeliveryRecord, DispatchError> {
        let record = DeliveryRecord::pending(config.id.clone(), event, payload);
        self.store.create(&record).await?;

        let message = DeliveryMessage::for_record(&record);
        if let Err(e) = self.channel.publish(Queue::Primary, &message).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %record.id,
                webhook_id = %record.webhook_id,
                event,
                error = %e,
                "Failed to publish delivery message"
            );
            return Err(e.into());
        }

        metric_inc("webhook.delivery.enqueued");
        tracing::info!(
            target: "webhook_delivery",
            delivery_id = %record.id,
            webhook_id = %record.webhook_id,
            event,
            "Delivery enqueued"
        );
        Ok(record)
    }

    /// Delivery history of a webhook, newest first.
    pub async fn get_deliveries(&self, webhook_id: &WebhookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.store.find_by_webhook_id(webhook_id).await
    }

    pub async fn get_delivery(&self, delivery_id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError> {
        self.store.find_by_id(delivery_id).await
    }

    /// Run one attempt of a delivery.
    ///
    /// The outcome is persisted before this returns, whatever it is. On
    /// failure the returned value carries the `next_retry` that was stored,
    /// which is `None` when the failure is terminal.
    pub async fn process_delivery(&self, message: &DeliveryMessage) -> Result<DeliveryOutcome, DeliveryFailure> {
        if let Some(replayed) = self.replay_if_attempted(message).await {
            return replayed;
        }

        let started = Instant::now();

        let config = match self.registry.find_by_id(&message.webhook_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                return Err(self
                    .record_failure(message, DeliveryError::ConfigurationNotFound, 0, None, started)
                    .await);
            }
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    delivery_id = %message.delivery_id,
                    webhook_id = %message.webhook_id,
                    error = %e,
                    "Failed to load webhook configuration"
                );
                return Err(self
                    .record_failure(message, DeliveryError::ConfigurationNotFound, 0, None, started)
                    .await);
            }
        };

        if self.rate_limiter.is_rate_limited(&config.url).await {
            tracing::debug!(
                target: "webhook_delivery",
                delivery_id = %message.delivery_id,
                webhook_id = %message.webhook_id,
                "Destination over its rate limit, skipping HTTP call"
            );
            return Err(self
                .record_failure(message, DeliveryError::RateLimited, config.retry_count, None, started)
                .await);
        }

        // Serialize once. The same buffer is signed and sent.
        let body = match serde_json::to_vec(&message.payload) {
            Ok(body) => body,
            Err(e) => {
                return Err(self
                    .record_failure(
                        message,
                        DeliveryError::Serialization(e.to_string()),
                        config.retry_count,
                        None,
                        started,
                    )
                    .await);
            }
        };

        let headers = build_headers(&config, message, &body);

        let result = self
            .http_client
            .post(&config.url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let response_body = self.read_body(response).await;
                match classify_status(status) {
                    None => {
                        self.record_success(message, status, response_body, started).await;
                        Ok(DeliveryOutcome::Delivered)
                    }
                    Some(error) => Err(self
                        .record_failure(message, error, config.retry_count, response_body, started)
                        .await),
                }
            }
            Err(e) => {
                let detail = if e.is_timeout() {
                    format!("request timed out after {}ms", self.config.send_timeout_ms)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    format!("request error: {}", e)
                };
                Err(self
                    .record_failure(message, DeliveryError::Network(detail), config.retry_count, None, started)
                    .await)
            }
        }
    }

    /// Delay before the retry that follows attempt `retry_count`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = self
            .config
            .retry_backoff_base
            .max(1)
            .saturating_pow(retry_count.saturating_add(1));
        Duration::from_millis(self.config.retry_backoff_unit_ms.saturating_mul(factor))
    }

    /// When to retry after a failed attempt, or `None` for a terminal failure.
    pub fn next_retry_at(
        &self,
        error: &DeliveryError,
        retry_count: u32,
        max_retries: u32,
    ) -> Option<DateTime<Utc>> {
        if !error.is_retryable() || retry_count >= max_retries {
            return None;
        }
        let delay = chrono::Duration::from_std(self.retry_delay(retry_count))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Some(Utc::now() + delay)
    }

    /// Read at most enough of the body to keep `max_response_body_chars`.
    async fn read_body(&self, mut response: reqwest::Response) -> Option<String> {
        let max_chars = self.config.max_response_body_chars;
        // UTF-8 is at most four bytes per char, plus room for a split char.
        let max_bytes = max_chars.saturating_mul(4).saturating_add(4);

        let mut buf: Vec<u8> = Vec::new();
        while buf.len() < max_bytes {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = max_bytes - buf.len();
                    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(
                        target: "webhook_delivery",
                        error = %e,
                        "Failed to read response body"
                    );
                    break;
                }
            }
        }

        if buf.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&buf).chars().take(max_chars).collect())
    }

    /// Detect a redelivered message whose attempt already ran.
    ///
    /// The channel is at-least-once, so a message can arrive again after its
    /// outcome was stored (for example when the worker died before acking).
    /// A copy whose successor attempt is already queued or recorded is
    /// reported as handled. Otherwise the stored failure is returned so the
    /// worker can republish a retry whose publish was lost. The destination
    /// is never called twice for the same attempt.
    async fn replay_if_attempted(
        &self,
        message: &DeliveryMessage,
    ) -> Option<Result<DeliveryOutcome, DeliveryFailure>> {
        let record = match self.store.find_by_id(&message.delivery_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %message.delivery_id,
                    error = %e,
                    "Failed to load delivery record before attempt"
                );
                return None;
            }
        };

        if record.status == DeliveryStatus::Success || record.has_successor(message.retry_count) {
            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %message.delivery_id,
                retry_count = message.retry_count,
                status = ?record.status,
                "Duplicate message for a handled attempt, skipping"
            );
            return Some(Ok(DeliveryOutcome::AlreadyHandled));
        }

        let attempt = record.attempt_for(message.retry_count)?;
        tracing::info!(
            target: "webhook_delivery",
            delivery_id = %message.delivery_id,
            retry_count = message.retry_count,
            "Attempt already recorded, replaying stored outcome"
        );

        Some(Err(DeliveryFailure {
            error: error_from_attempt(attempt),
            retry_count: message.retry_count,
            next_retry: record.next_retry,
        }))
    }

    /// Record that `message` (the next attempt of its delivery) has been
    /// published, so redelivered copies of the previous attempt are skipped.
    pub async fn mark_retry_scheduled(&self, message: &DeliveryMessage) -> Result<(), StoreError> {
        self.store
            .mark_retry_scheduled(&message.delivery_id, message.retry_count)
            .await
    }

    async fn record_success(
        &self,
        message: &DeliveryMessage,
        status: u16,
        response_body: Option<String>,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            target: "webhook_delivery",
            delivery_id = %message.delivery_id,
            webhook_id = %message.webhook_id,
            event = %message.event,
            retry_count = message.retry_count,
            status_code = status,
            duration_ms,
            "Webhook delivery succeeded"
        );

        let update = DeliveryUpdate {
            status: DeliveryStatus::Success,
            status_code: Some(status),
            response_body,
            error: None,
            error_class: None,
            retry_count: message.retry_count,
            next_retry: None,
            duration_ms,
        };

        if let Err(e) = self.store.update_status(&message.delivery_id, update).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %message.delivery_id,
                error = %e,
                "Failed to update delivery status to success"
            );
        }

        metric_inc("webhook.delivery.success");
        metric_duration(duration_ms);
    }

    async fn record_failure(
        &self,
        message: &DeliveryMessage,
        error: DeliveryError,
        max_retries: u32,
        response_body: Option<String>,
        started: Instant,
    ) -> DeliveryFailure {
        let duration_ms = started.elapsed().as_millis() as u64;
        let next_retry = self.next_retry_at(&error, message.retry_count, max_retries);
        let error_class = error.class();

        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %message.delivery_id,
            webhook_id = %message.webhook_id,
            event = %message.event,
            retry_count = message.retry_count,
            status_code = error.status_code(),
            error_class = error_class.map(|c| c.as_str()),
            error = %error,
            duration_ms,
            has_next_retry = next_retry.is_some(),
            "Webhook delivery failed"
        );

        let update = DeliveryUpdate {
            status: DeliveryStatus::Failed,
            status_code: error.status_code(),
            response_body,
            error: Some(error.to_string()),
            error_class,
            retry_count: message.retry_count,
            next_retry,
            duration_ms,
        };

        if let Err(e) = self.store.update_status(&message.delivery_id, update).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %message.delivery_id,
                error = %e,
                "Failed to update delivery status to failed"
            );
        }

        metric_inc_class("webhook.delivery.failure", error_class);
        metric_duration(duration_ms);
        if next_retry.is_some() {
            metric_inc("webhook.delivery.retry_scheduled");
        }

        DeliveryFailure {
            error,
            retry_count: message.retry_count,
            next_retry,
        }
    }
}

/// Map a response status to a delivery error. `None` means success.
pub fn classify_status(status: u16) -> Option<DeliveryError> {
    match status {
        200..=299 => None,
        429 => Some(DeliveryError::RateLimited),
        500..=599 => Some(DeliveryError::ServerError { status }),
        _ => Some(DeliveryError::ClientError { status }),
    }
}

fn error_from_attempt(attempt: &DeliveryAttempt) -> DeliveryError {
    let status = attempt.status_code.unwrap_or_default();
    match attempt.error_class {
        Some(ErrorClass::Network) => DeliveryError::Network(attempt.error.clone().unwrap_or_default()),
        Some(ErrorClass::RateLimit) => DeliveryError::RateLimited,
        Some(ErrorClass::Server) => DeliveryError::ServerError { status },
        Some(ErrorClass::NotFound) => DeliveryError::ClientError { status: 404 },
        Some(ErrorClass::Other) => DeliveryError::ClientError { status },
        None => DeliveryError::ConfigurationNotFound,
    }
}

fn build_headers(config: &WebhookConfig, message: &DeliveryMessage, body: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &config.headers {
        if RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            tracing::warn!(
                target: "webhook_delivery",
                webhook_id = %config.id,
                header = %name,
                "Ignoring custom header that shadows a delivery header"
            );
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                tracing::warn!(
                    target: "webhook_delivery",
                    webhook_id = %config.id,
                    header = %name,
                    "Skipping invalid custom header"
                );
            }
        }
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let signature = signature_header_value(config.secret.as_bytes(), body);
    let generated = [
        (WEBHOOK_ID_HEADER, config.id.as_str()),
        (DELIVERY_HEADER, message.delivery_id.as_str()),
        (SIGNATURE_HEADER, signature.as_str()),
        (EVENT_HEADER, message.event.as_str()),
    ];
    for (name, value) in generated {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(header), Ok(value)) => {
                headers.insert(header, value);
            }
            _ => {
                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %message.delivery_id,
                    header = name,
                    "Invalid delivery header value, omitting"
                );
            }
        }
    }

    headers
}
