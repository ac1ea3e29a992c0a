//! Shared fixtures for the delivery pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use webhook_relay::{
    CounterStore, DeliveryId, DeliveryRecord, DeliveryStore, DeliveryWorker, Dispatcher,
    DispatcherConfig, InMemoryChannel, InMemoryRegistry, InMemoryStorage, StoreError,
    WebhookConfig, WorkerConfig,
};
use wiremock::{Request, Respond, ResponseTemplate};

pub const SECRET: &str = "whsec_test_secret_key_12345";
pub const EVENT: &str = "task.completed";

/// Dispatcher and worker wired to in-memory collaborators.
pub struct Pipeline {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<InMemoryRegistry>,
    pub store: Arc<InMemoryStorage>,
    pub channel: Arc<InMemoryChannel>,
    pub worker: DeliveryWorker,
}

impl Pipeline {
    /// Backoff unit shrunk to 1ms so retries land after 5ms, 25ms, 125ms.
    pub fn new() -> Self {
        Self::build(test_config(), None)
    }

    pub fn with_counter_store(store: Arc<dyn CounterStore>) -> Self {
        Self::build(test_config(), Some(store))
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: DispatcherConfig, counter: Option<Arc<dyn CounterStore>>) -> Self {
        let registry = Arc::new(InMemoryRegistry::new(config.max_retry_bound));
        let store = Arc::new(InMemoryStorage::new());
        let channel = Arc::new(InMemoryChannel::new());

        let mut dispatcher = Dispatcher::new(config)
            .expect("dispatcher")
            .with_registry(registry.clone())
            .with_store(store.clone())
            .with_channel(channel.clone());
        if let Some(counter) = counter {
            dispatcher = dispatcher.with_counter_store(counter);
        }
        let dispatcher = Arc::new(dispatcher);

        let worker = DeliveryWorker::new(
            dispatcher.clone(),
            WorkerConfig {
                primary_concurrency: 2,
                retry_concurrency: 2,
                max_inline_wait_ms: 1_000,
                repark_pause_ms: 10,
            },
        );

        Self {
            dispatcher,
            registry,
            store,
            channel,
            worker,
        }
    }

    pub async fn register(&self, config: WebhookConfig) {
        self.registry.register(config).await.expect("valid webhook");
    }

    /// Poll the store until the delivery reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: &DeliveryId) -> DeliveryRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = self
                .store
                .find_by_id(id)
                .await
                .expect("store")
                .expect("record exists");
            if record.is_terminal() {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "delivery {} never reached a terminal state: {:?}",
                id,
                record
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        send_timeout_ms: 2_000,
        retry_backoff_unit_ms: 1,
        ..Default::default()
    }
}

pub fn webhook(id: &str, url: &str, retry_count: u32) -> WebhookConfig {
    WebhookConfig::new(id, url, SECRET, [EVENT]).with_retry_count(retry_count)
}

// ---------------------------------------------------------------------------
// Counter stores
// ---------------------------------------------------------------------------

/// Reports every destination as over budget.
pub struct SaturatedCounterStore;

#[async_trait]
impl CounterStore for SaturatedCounterStore {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
        Ok(u64::MAX)
    }
}

/// Always fails, as if the counter backend were down.
pub struct UnreachableCounterStore;

#[async_trait]
impl CounterStore for UnreachableCounterStore {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
}

// ---------------------------------------------------------------------------
// Responders
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Header value by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// Fails `n` times with `failure_code`, then answers 200, capturing every request.
#[derive(Clone)]
pub struct ScriptedResponder {
    attempts: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl ScriptedResponder {
    pub fn fail_times(n: u32, failure_code: u16) -> Self {
        Self {
            attempts: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always(code: u16) -> Self {
        Self::fail_times(u32::MAX, code)
    }

    pub fn ok() -> Self {
        Self::fail_times(0, 500)
    }

    pub fn count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Respond for ScriptedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.lock().unwrap().push(CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        });

        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code).set_body_string("upstream unavailable")
        } else {
            ResponseTemplate::new(200).set_body_string("ok")
        }
    }
}
