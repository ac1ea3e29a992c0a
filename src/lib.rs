//! Webhook delivery pipeline with at-least-once guarantees.
//!
//! Producers call [`Dispatcher::enqueue_delivery`] (or
//! [`Dispatcher::dispatch_event`] to fan out by event name). The call stores
//! a pending [`DeliveryRecord`], publishes a message to the primary queue and
//! returns immediately. [`DeliveryWorker`] consumes the primary and retry
//! queues, runs each attempt through the dispatcher and republishes
//! retryable failures with exponential backoff.
//!
//! ## Guarantees
//! - At-least-once delivery; the delivery id is constant across retries
//!   and is the receiver's deduplication key
//! - Every attempt's outcome is persisted before the worker reacts to it
//! - A failing destination never blocks other destinations
//! - Per-destination fixed-window rate limiting that fails open
//! - The signed bytes are the sent bytes
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between events, even for the same webhook
//! - Payload transformation

mod channel;
mod dispatcher;
mod error;
mod rate_limit;
mod signing;
mod storage;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use channel::{Envelope, InMemoryChannel, MessageChannel, Queue};
pub use dispatcher::{classify_status, Dispatcher, DispatcherConfig};
pub use error::{
    ChannelError,
    DeliveryError,
    DeliveryFailure,
    DeliveryOutcome,
    DispatchError,
    ErrorClass,
    StoreError,
    ValidationError,
};
pub use rate_limit::{CounterStore, InMemoryCounterStore, RateLimitConfig, RateLimiter};
pub use signing::{
    parse_signature_headers,
    sign,
    signature_header_value,
    verify_signature,
    verify_webhook_request,
    ParsedSignature,
    VerificationError,
    DELIVERY_HEADER,
    EVENT_HEADER,
    SIGNATURE_HEADER,
    WEBHOOK_ID_HEADER,
};
pub use storage::{DeliveryStore, InMemoryRegistry, InMemoryStorage, WebhookRegistry};
pub use types::{
    DeliveryAttempt,
    DeliveryId,
    DeliveryMessage,
    DeliveryRecord,
    DeliveryStatus,
    DeliveryUpdate,
    WebhookConfig,
    WebhookId,
};
pub use worker::{DeliveryWorker, WorkerConfig};

#[cfg(feature = "redis")]
pub use storage_redis::{RedisChannel, RedisCounterStore};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
