use crate::delivery::queue::DeliveryQueue;
use crate::event::{Event, Payload};
use crate::formatter::Formatter;
use crate::parser::{preview, EventParser};
use chrono::Utc;

const RAW_LOG_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyLevel {
    Normal,
    /// Above half the threshold.
    Elevated,
    High,
}

pub fn classify_latency(delay_ms: i64, threshold_ms: i64) -> LatencyLevel {
    if delay_ms > threshold_ms {
        LatencyLevel::High
    } else if delay_ms > threshold_ms / 2 {
        LatencyLevel::Elevated
    } else {
        LatencyLevel::Normal
    }
}

/// Publish-to-receive delay of a post, when its publish time parsed.
pub fn publish_delay_ms(event: &Event) -> Option<i64> {
    let Payload::Post(post) = &event.payload else {
        return None;
    };
    let published = post.published_at.as_ref()?.utc?;
    let received = event.received_at.wall.with_timezone(&Utc);
    Some((received - published).num_milliseconds())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Enqueued,
    /// The event rendered to nothing (an empty batch).
    Skipped,
}

/// Per-payload work done on behalf of the read loop: parse, format, enqueue.
///
/// Never blocks and never fails; the slow part (sending) happens on the
/// other side of the queue.
pub struct Pipeline {
    parser: EventParser,
    formatter: Formatter,
    queue: DeliveryQueue,
    latency_threshold_ms: Option<i64>,
}

impl Pipeline {
    pub fn new(
        parser: EventParser,
        formatter: Formatter,
        queue: DeliveryQueue,
        latency_threshold_ms: Option<u64>,
    ) -> Self {
        Self {
            parser,
            formatter,
            queue,
            latency_threshold_ms: latency_threshold_ms.map(|ms| ms as i64),
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn handle(&self, raw: &str) -> Dispatch {
        let event = self.parser.parse(raw);
        tracing::info!(
            kind = ?event.kind(),
            raw = %preview(raw, RAW_LOG_CHARS),
            "payload received"
        );

        if let Some(threshold_ms) = self.latency_threshold_ms {
            self.report_latency(&event, threshold_ms);
        }

        match self.formatter.format(&event) {
            Some(message) => {
                self.queue.enqueue(message);
                tracing::debug!(
                    kind = ?event.kind(),
                    elapsed_us = event.received_at.instant.elapsed().as_micros() as u64,
                    "event queued for delivery"
                );
                Dispatch::Enqueued
            }
            None => {
                tracing::warn!(
                    raw = %preview(raw, RAW_LOG_CHARS),
                    "event produced no message"
                );
                Dispatch::Skipped
            }
        }
    }

    fn report_latency(&self, event: &Event, threshold_ms: i64) {
        let Some(delay_ms) = publish_delay_ms(event) else {
            return;
        };
        match classify_latency(delay_ms, threshold_ms) {
            LatencyLevel::High => {
                tracing::warn!(delay_ms, threshold_ms, "publish-to-receive latency is high")
            }
            LatencyLevel::Elevated => {
                tracing::warn!(delay_ms, threshold_ms, "publish-to-receive latency is elevated")
            }
            LatencyLevel::Normal => tracing::debug!(delay_ms, "publish-to-receive latency"),
        }
    }
}
