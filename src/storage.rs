use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{StoreError, ValidationError};
use crate::types::{DeliveryId, DeliveryRecord, DeliveryUpdate, WebhookConfig, WebhookId};

/// Persistence for delivery records.
///
/// Implementations must be safe for concurrent use from many workers.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn create(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    /// Apply an attempt outcome to the record and return the stored result.
    async fn update_status(
        &self,
        delivery_id: &DeliveryId,
        update: DeliveryUpdate,
    ) -> Result<DeliveryRecord, StoreError>;

    /// Record that the message for attempt `retry_count` has been published.
    async fn mark_retry_scheduled(&self, delivery_id: &DeliveryId, retry_count: u32) -> Result<(), StoreError>;

    async fn find_by_id(&self, delivery_id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Records for a webhook, newest first.
    async fn find_by_webhook_id(&self, webhook_id: &WebhookId) -> Result<Vec<DeliveryRecord>, StoreError>;
}

/// Lookup of webhook configurations.
#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    async fn find_by_id(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError>;

    /// Enabled configurations subscribed to `event`.
    async fn find_by_event(&self, event: &str) -> Result<Vec<WebhookConfig>, StoreError>;
}

/// In-memory delivery store for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    records: RwLock<HashMap<DeliveryId, DeliveryRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStorage {
    async fn create(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        delivery_id: &DeliveryId,
        update: DeliveryUpdate,
    ) -> Result<DeliveryRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(delivery_id)
            .ok_or_else(|| StoreError::NotFound(delivery_id.to_string()))?;
        record.apply(update);
        Ok(record.clone())
    }

    async fn mark_retry_scheduled(&self, delivery_id: &DeliveryId, retry_count: u32) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(delivery_id)
            .ok_or_else(|| StoreError::NotFound(delivery_id.to_string()))?;
        record.mark_retry_scheduled(retry_count);
        Ok(())
    }

    async fn find_by_id(&self, delivery_id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.records.read().await.get(delivery_id).cloned())
    }

    async fn find_by_webhook_id(&self, webhook_id: &WebhookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let records = self.records.read().await;
        let mut found: Vec<DeliveryRecord> = records
            .values()
            .filter(|r| &r.webhook_id == webhook_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}

/// In-memory webhook registry that validates on registration.
pub struct InMemoryRegistry {
    webhooks: RwLock<HashMap<WebhookId, WebhookConfig>>,
    max_retry_bound: u32,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new(10)
    }
}

impl InMemoryRegistry {
    pub fn new(max_retry_bound: u32) -> Self {
        Self {
            webhooks: RwLock::new(HashMap::new()),
            max_retry_bound,
        }
    }

    /// Insert or replace a configuration.
    pub async fn register(&self, mut config: WebhookConfig) -> Result<(), ValidationError> {
        config.validate(self.max_retry_bound)?;

        let mut guard = self.webhooks.write().await;
        if let Some(existing) = guard.get(&config.id) {
            config.created_at = existing.created_at;
            config.updated_at = Utc::now();
        }
        guard.insert(config.id.clone(), config);
        Ok(())
    }

    pub async fn set_enabled(&self, id: &WebhookId, enabled: bool) -> bool {
        let mut guard = self.webhooks.write().await;
        match guard.get_mut(id) {
            Some(config) => {
                config.enabled = enabled;
                config.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Delete a configuration. Delivery records that reference it are left as they are.
    pub async fn remove(&self, id: &WebhookId) -> Option<WebhookConfig> {
        self.webhooks.write().await.remove(id)
    }
}

#[async_trait]
impl WebhookRegistry for InMemoryRegistry {
    async fn find_by_id(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError> {
        Ok(self.webhooks.read().await.get(id).cloned())
    }

    async fn find_by_event(&self, event: &str) -> Result<Vec<WebhookConfig>, StoreError> {
        let guard = self.webhooks.read().await;
        let mut found: Vec<WebhookConfig> = guard
            .values()
            .filter(|w| w.enabled && w.subscribes_to(event))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}
