use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::channel::{Envelope, MessageChannel, Queue};
use crate::dispatcher::Dispatcher;
use crate::error::{DeliveryError, DeliveryFailure};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Consumer loops on the primary queue.
    pub primary_concurrency: usize,

    /// Consumer loops on the retry queue.
    pub retry_concurrency: usize,

    /// A retry due within this window is held by the consumer until due.
    /// Later retries are put back on the queue.
    pub max_inline_wait_ms: u64,

    /// Pause after putting a not-yet-due retry back, so a queue holding only
    /// future retries is not spun through.
    pub repark_pause_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            primary_concurrency: 4,
            retry_concurrency: 2,
            max_inline_wait_ms: 1_000,
            repark_pause_ms: 250,
        }
    }
}

/// Shared, read-only context for all consumer loops.
struct WorkerContext {
    dispatcher: Arc<Dispatcher>,
    channel: Arc<dyn MessageChannel>,
    config: WorkerConfig,
}

/// Consumes the primary and retry queues and drives deliveries to a
/// terminal state.
///
/// Every failed attempt is acknowledged. A retry is an explicit publish of
/// the next attempt to the retry queue, made only after the failed attempt's
/// outcome is persisted, so two attempts of one delivery are never in flight
/// together.
pub struct DeliveryWorker {
    ctx: Arc<WorkerContext>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl DeliveryWorker {
    pub fn new(dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let channel = dispatcher.channel();
        Self {
            ctx: Arc::new(WorkerContext {
                dispatcher,
                channel,
                config,
            }),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Create a worker and start its consumer loops.
    pub fn spawn(dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> Self {
        let mut worker = Self::new(dispatcher, config);
        worker.start();
        worker
    }

    /// Start the consumer loops. A worker that was shut down can be started again.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        self.shutdown_tx.send_replace(false);

        let loops = [
            (Queue::Primary, self.ctx.config.primary_concurrency.max(1)),
            (Queue::Retry, self.ctx.config.retry_concurrency.max(1)),
        ];
        for (queue, count) in loops {
            for _ in 0..count {
                self.handles.push(tokio::spawn(consume_loop(
                    queue,
                    self.ctx.clone(),
                    self.shutdown_tx.subscribe(),
                )));
            }
        }

        tracing::info!(
            target: "webhook_delivery",
            primary = self.ctx.config.primary_concurrency.max(1),
            retry = self.ctx.config.retry_concurrency.max(1),
            "Delivery worker started"
        );
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !*self.shutdown_tx.borrow()
    }

    /// Handle one received message: attempt, then ack or schedule a retry.
    ///
    /// Returns the failure of the attempt for reporting. By the time this
    /// returns the message has been acknowledged, except when scheduling a
    /// retry failed, in which case it is left for the broker to redeliver.
    pub async fn handle_message(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.ctx.handle(envelope).await
    }

    /// Stop consuming. Attempts already in progress run to completion.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!(target: "webhook_delivery", "Delivery worker stopped");
    }
}

/// Main consumer loop for one queue.
async fn consume_loop(
    queue: Queue,
    ctx: Arc<WorkerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            received = ctx.channel.receive(queue) => received,
        };

        match received {
            Ok(Some(envelope)) => {
                let _ = ctx.handle(envelope).await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    queue = %queue,
                    error = %e,
                    "Failed to receive from channel"
                );
                sleep(Duration::from_millis(ctx.config.repark_pause_ms.max(1))).await;
            }
        }
    }
}

impl WorkerContext {
    async fn handle(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        if envelope.queue == Queue::Retry {
            if let Some(due) = envelope.message.next_retry {
                let now = Utc::now();
                if due > now {
                    let wait = (due - now).to_std().unwrap_or_default();
                    if wait > Duration::from_millis(self.config.max_inline_wait_ms) {
                        self.repark(&envelope, wait).await;
                        return Ok(());
                    }
                    sleep(wait).await;
                }
            }
        }

        match self.dispatcher.process_delivery(&envelope.message).await {
            Ok(_) => {
                self.ack(&envelope).await;
                Ok(())
            }
            Err(failure) => self.handle_failure(&envelope, failure).await,
        }
    }

    async fn handle_failure(&self, envelope: &Envelope, failure: DeliveryFailure) -> Result<(), DeliveryError> {
        let message = &envelope.message;

        match failure.next_retry {
            Some(next_retry) => {
                let retry = message.next_attempt(next_retry);
                if let Err(e) = self.channel.publish(Queue::Retry, &retry).await {
                    tracing::error!(
                        target: "webhook_delivery",
                        delivery_id = %message.delivery_id,
                        webhook_id = %message.webhook_id,
                        event = %message.event,
                        retry_count = message.retry_count,
                        error = %e,
                        "Failed to schedule retry, leaving message unacknowledged"
                    );
                    return Err(failure.error);
                }
                if let Err(e) = self.dispatcher.mark_retry_scheduled(&retry).await {
                    tracing::warn!(
                        target: "webhook_delivery",
                        delivery_id = %message.delivery_id,
                        retry_count = retry.retry_count,
                        error = %e,
                        "Failed to record scheduled retry"
                    );
                }

                tracing::info!(
                    target: "webhook_delivery",
                    delivery_id = %message.delivery_id,
                    webhook_id = %message.webhook_id,
                    event = %message.event,
                    retry_count = retry.retry_count,
                    next_retry = %next_retry,
                    "Retry scheduled"
                );
                self.ack(envelope).await;
                Err(failure.error)
            }
            None if failure.error.is_retryable() => {
                metric_inc("webhook.delivery.exhausted");
                tracing::error!(
                    target: "webhook_delivery",
                    delivery_id = %message.delivery_id,
                    webhook_id = %message.webhook_id,
                    event = %message.event,
                    retry_count = message.retry_count,
                    error = %failure.error,
                    "Max retries reached, delivery permanently failed"
                );
                self.ack(envelope).await;
                Err(DeliveryError::MaxRetriesExceeded {
                    retry_count: message.retry_count,
                })
            }
            None => {
                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %message.delivery_id,
                    webhook_id = %message.webhook_id,
                    event = %message.event,
                    retry_count = message.retry_count,
                    error = %failure.error,
                    "Delivery failed with a non-retryable error"
                );
                self.ack(envelope).await;
                Err(failure.error)
            }
        }
    }

    /// Put a retry that is not yet due back on the retry queue.
    async fn repark(&self, envelope: &Envelope, wait: Duration) {
        let message = &envelope.message;
        if let Err(e) = self.channel.publish(Queue::Retry, message).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %message.delivery_id,
                retry_count = message.retry_count,
                error = %e,
                "Failed to re-park retry, leaving message unacknowledged"
            );
            return;
        }

        tracing::debug!(
            target: "webhook_delivery",
            delivery_id = %message.delivery_id,
            retry_count = message.retry_count,
            wait_ms = wait.as_millis() as u64,
            "Retry not yet due, re-parked"
        );
        self.ack(envelope).await;
        sleep(wait.min(Duration::from_millis(self.config.repark_pause_ms))).await;
    }

    async fn ack(&self, envelope: &Envelope) {
        if let Err(e) = self.channel.ack(envelope).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %envelope.message.delivery_id,
                queue = %envelope.queue,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }
}
