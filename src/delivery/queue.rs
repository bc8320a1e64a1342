use super::{deliver, ChatSender, DeliveryMessage};
use crate::parser::preview;
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Counters shared between the queue handle and its drain loop.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeliveryCounts {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryCounts {
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.delivered + self.failed)
    }
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryCounts {
        DeliveryCounts {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the delivery FIFO. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<DeliveryMessage>,
    stats: Arc<DeliveryStats>,
}

impl DeliveryQueue {
    /// Never blocks. Only fails to buffer once the drain loop is gone, in
    /// which case the message is dropped with a warning.
    pub fn enqueue(&self, message: DeliveryMessage) {
        match self.tx.send(message) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(message)) => {
                tracing::warn!(
                    preview = %preview(message.body(), 100),
                    "delivery queue closed, dropping message"
                );
            }
        }
    }

    pub fn stats(&self) -> DeliveryCounts {
        self.stats.snapshot()
    }
}

/// The single consumer of the delivery FIFO.
pub struct Drainer {
    rx: mpsc::UnboundedReceiver<DeliveryMessage>,
    sender: Arc<dyn ChatSender>,
    chat_id: String,
    poll_interval: Duration,
    stats: Arc<DeliveryStats>,
}

/// Build a connected queue handle and drain loop.
pub fn delivery_channel(
    sender: Arc<dyn ChatSender>,
    chat_id: impl Into<String>,
    poll_interval: Duration,
) -> (DeliveryQueue, Drainer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(DeliveryStats::default());
    let queue = DeliveryQueue {
        tx,
        stats: Arc::clone(&stats),
    };
    let drainer = Drainer {
        rx,
        sender,
        chat_id: chat_id.into(),
        poll_interval,
        stats,
    };
    (queue, drainer)
}

impl Drainer {
    /// Send queued messages one at a time, in order, until shutdown.
    ///
    /// A failed send is logged and the message dropped; nothing is retried
    /// or re-enqueued.
    pub async fn run(mut self, shutdown: Shutdown) {
        tracing::debug!(chat_id = %self.chat_id, "delivery drain loop started");

        while !shutdown.is_triggered() {
            match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
                Err(_elapsed) => continue,
                Ok(None) => break,
                Ok(Some(message)) => self.deliver_one(&message).await,
            }
        }

        let mut left_behind = 0usize;
        while self.rx.try_recv().is_ok() {
            left_behind += 1;
        }
        if left_behind > 0 {
            tracing::warn!(left_behind, "delivery drain loop stopped with messages still queued");
        }
        tracing::debug!("delivery drain loop stopped");
    }

    async fn deliver_one(&self, message: &DeliveryMessage) {
        match deliver(self.sender.as_ref(), &self.chat_id, message).await {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    with_image = message.image_url().is_some(),
                    preview = %preview(message.body(), 100),
                    "message delivered"
                );
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %e,
                    preview = %preview(message.body(), 100),
                    "message delivery failed, dropping"
                );
            }
        }
    }
}
