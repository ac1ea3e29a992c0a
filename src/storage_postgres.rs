#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio::sync::Mutex;
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::error::{DispatchError, StoreError};
#[cfg(feature = "postgres")]
use crate::storage::{DeliveryStore, WebhookRegistry};
#[cfg(feature = "postgres")]
use crate::types::{DeliveryId, DeliveryRecord, DeliveryUpdate, WebhookConfig, WebhookId};

#[cfg(feature = "postgres")]
fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Delivery records and webhook configurations as JSONB documents.
#[cfg(feature = "postgres")]
pub struct PostgresStorage {
    client: Mutex<Client>,
    max_retry_bound: u32,
}

#[cfg(feature = "postgres")]
impl PostgresStorage {
    pub async fn new(client: Client, max_retry_bound: u32) -> Result<Self, StoreError> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhooks (
                    id TEXT PRIMARY KEY,
                    enabled BOOLEAN NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await
            .map_err(backend)?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id TEXT PRIMARY KEY,
                    webhook_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await
            .map_err(backend)?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_deliveries_webhook_id
                 ON webhook_deliveries (webhook_id, created_at DESC)",
                &[],
            )
            .await
            .map_err(backend)?;

        Ok(Self {
            client: Mutex::new(client),
            max_retry_bound,
        })
    }

    /// Insert or replace a webhook configuration after validating it.
    pub async fn save_webhook(&self, config: &WebhookConfig) -> Result<(), DispatchError> {
        config.validate(self.max_retry_bound)?;
        let payload = serde_json::to_value(config).map_err(StoreError::from)?;
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhooks (id, enabled, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE SET enabled = EXCLUDED.enabled, payload = EXCLUDED.payload",
                &[&config.id.0, &config.enabled, &payload],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    pub async fn delete_webhook(&self, id: &WebhookId) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let deleted = client
            .execute("DELETE FROM webhooks WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl DeliveryStore for PostgresStorage {
    async fn create(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_value(record)?;
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_deliveries (id, webhook_id, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO NOTHING",
                &[&record.id.0, &record.webhook_id.0, &payload],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_status(
        &self,
        delivery_id: &DeliveryId,
        update: DeliveryUpdate,
    ) -> Result<DeliveryRecord, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;

        let row = tx
            .query_opt(
                "SELECT payload FROM webhook_deliveries WHERE id = $1 FOR UPDATE",
                &[&delivery_id.0],
            )
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(delivery_id.to_string()))?;

        let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
        let mut record: DeliveryRecord = serde_json::from_value(payload)?;

        if record.apply(update) {
            let payload = serde_json::to_value(&record)?;
            tx.execute(
                "UPDATE webhook_deliveries SET payload = $2 WHERE id = $1",
                &[&delivery_id.0, &payload],
            )
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(record)
    }

    async fn mark_retry_scheduled(&self, delivery_id: &DeliveryId, retry_count: u32) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE webhook_deliveries
                 SET payload = jsonb_set(payload, '{retry_scheduled}', to_jsonb($2::bigint))
                 WHERE id = $1
                   AND payload->>'status' <> 'success'
                   AND COALESCE((payload->>'retry_scheduled')::bigint, -1) < $2::bigint",
                &[&delivery_id.0, &i64::from(retry_count)],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            let exists = client
                .query_opt("SELECT 1 FROM webhook_deliveries WHERE id = $1", &[&delivery_id.0])
                .await
                .map_err(backend)?;
            if exists.is_none() {
                return Err(StoreError::NotFound(delivery_id.to_string()));
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, delivery_id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT payload FROM webhook_deliveries WHERE id = $1",
                &[&delivery_id.0],
            )
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_webhook_id(&self, webhook_id: &WebhookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT payload FROM webhook_deliveries
                 WHERE webhook_id = $1
                 ORDER BY created_at DESC",
                &[&webhook_id.0],
            )
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| -> Result<DeliveryRecord, StoreError> {
                let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl WebhookRegistry for PostgresStorage {
    async fn find_by_id(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT payload FROM webhooks WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_event(&self, event: &str) -> Result<Vec<WebhookConfig>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT payload FROM webhooks
                 WHERE enabled AND payload->'events' ? $1
                 ORDER BY id",
                &[&event],
            )
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| -> Result<WebhookConfig, StoreError> {
                let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }
}
