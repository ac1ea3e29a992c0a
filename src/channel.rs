//! Message channel with a primary and a retry queue.
//!
//! The broker is treated as a durable, at-least-once transport only. Every
//! retry is an explicit publish from the worker; nothing relies on
//! broker-side redelivery or dead-lettering.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::ChannelError;
use crate::types::DeliveryMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Primary,
    Retry,
}

impl Queue {
    pub fn name(&self) -> &'static str {
        match self {
            Queue::Primary => "webhook.deliveries",
            Queue::Retry => "webhook.deliveries.retry",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A received message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub queue: Queue,
    pub message: DeliveryMessage,

    /// Backend-specific handle used by `ack`.
    pub receipt: String,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(&self, queue: Queue, message: &DeliveryMessage) -> Result<(), ChannelError>;

    /// Wait for the next message. `Ok(None)` means the queue is closed and drained.
    async fn receive(&self, queue: Queue) -> Result<Option<Envelope>, ChannelError>;

    /// Acknowledge a message. An acknowledged message is never redelivered.
    async fn ack(&self, envelope: &Envelope) -> Result<(), ChannelError>;
}

struct QueueHandle {
    tx: Mutex<Option<mpsc::UnboundedSender<DeliveryMessage>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DeliveryMessage>>>,
    published: AtomicU64,
}

impl QueueHandle {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            published: AtomicU64::new(0),
        }
    }
}

/// Process-local channel backed by tokio mpsc queues.
///
/// Not durable: unacknowledged messages are tracked for inspection but are
/// lost when the process exits.
pub struct InMemoryChannel {
    primary: QueueHandle,
    retry: QueueHandle,
    next_receipt: AtomicU64,
    in_flight: Mutex<HashMap<String, Envelope>>,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self {
            primary: QueueHandle::new(),
            retry: QueueHandle::new(),
            next_receipt: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn handle(&self, queue: Queue) -> &QueueHandle {
        match queue {
            Queue::Primary => &self.primary,
            Queue::Retry => &self.retry,
        }
    }

    /// Stop accepting messages. Receivers drain what is queued, then see `None`.
    pub async fn close(&self) {
        self.primary.tx.lock().await.take();
        self.retry.tx.lock().await.take();
    }

    /// Messages received but not yet acknowledged.
    pub async fn unacked(&self) -> Vec<Envelope> {
        self.in_flight.lock().await.values().cloned().collect()
    }

    /// Number of messages ever published to `queue`.
    pub fn published_count(&self, queue: Queue) -> u64 {
        self.handle(queue).published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, queue: Queue, message: &DeliveryMessage) -> Result<(), ChannelError> {
        let handle = self.handle(queue);
        let guard = handle.tx.lock().await;
        let tx = guard.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(message.clone()).map_err(|_| ChannelError::Closed)?;
        handle.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self, queue: Queue) -> Result<Option<Envelope>, ChannelError> {
        let message = {
            let mut rx = self.handle(queue).rx.lock().await;
            rx.recv().await
        };

        let Some(message) = message else {
            return Ok(None);
        };

        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst).to_string();
        let envelope = Envelope {
            queue,
            message,
            receipt,
        };
        self.in_flight
            .lock()
            .await
            .insert(envelope.receipt.clone(), envelope.clone());
        Ok(Some(envelope))
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.in_flight.lock().await.remove(&envelope.receipt);
        Ok(())
    }
}
