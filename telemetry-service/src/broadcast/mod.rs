//! Fan-out of tick batches to live subscribers.
//!
//! Delivery is at most once per tick: every open subscriber gets one send
//! attempt bounded by `send_timeout`. Failed or timed-out subscribers are
//! removed; nothing is queued or replayed.

pub mod ws;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use energy_client::domain::{ReadingBatch, StreamMessage};
use tokio::sync::Mutex;

use crate::pipeline::{SinkError, TickSink};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BroadcastSendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Write half of one subscriber connection.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, frame: Arc<str>) -> Result<(), BroadcastSendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers removed because their send failed or timed out.
    pub dropped: usize,
    /// Subscribers still busy with an earlier send; they miss this batch.
    pub skipped: usize,
}

enum Outcome {
    Delivered,
    Busy,
    Failed(BroadcastSendError),
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

pub struct BroadcastHub {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, SharedSink>>,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Register an open connection. It receives batches published from now on.
    pub fn subscribe(&self, sink: Box<dyn FrameSink>) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.insert(id, Arc::new(Mutex::new(sink)));
        metrics::gauge!("broadcast_subscribers").set(subs.len() as f64);
        tracing::debug!(subscriber = id, total = subs.len(), "subscriber connected");
        SubscriberHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = subs.remove(&handle.0).is_some();
        metrics::gauge!("broadcast_subscribers").set(subs.len() as f64);
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn encode(batch: &ReadingBatch) -> Result<Arc<str>, BroadcastSendError> {
        let msg = StreamMessage::from(batch.clone());
        serde_json::to_string(&msg)
            .map(Arc::from)
            .map_err(|e| BroadcastSendError::Encode(e.to_string()))
    }

    /// Send `batch` to every subscriber in parallel.
    pub async fn publish(&self, batch: &ReadingBatch) -> PublishReport {
        let frame = match Self::encode(batch) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "dropping batch that could not be encoded");
                return PublishReport::default();
            }
        };

        // Sends run without holding the set lock so subscribe/unsubscribe are never blocked.
        let targets: Vec<(u64, SharedSink)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();

        let timeout = self.send_timeout;
        let sends = targets.into_iter().map(|(id, sink)| {
            let frame = frame.clone();
            async move {
                let outcome = match sink.try_lock() {
                    Err(_) => Outcome::Busy,
                    Ok(mut guard) => match tokio::time::timeout(timeout, guard.send_text(frame)).await {
                        Ok(Ok(())) => Outcome::Delivered,
                        Ok(Err(e)) => Outcome::Failed(e),
                        Err(_) => Outcome::Failed(BroadcastSendError::TimedOut(timeout)),
                    },
                };
                (id, outcome)
            }
        });
        let results = futures::future::join_all(sends).await;

        let mut report = PublishReport::default();
        let mut failed = Vec::new();
        for (id, outcome) in results {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Busy => report.skipped += 1,
                Outcome::Failed(e) => {
                    tracing::debug!(subscriber = id, error = %e, "dropping subscriber");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
            for id in &failed {
                if subs.remove(id).is_some() {
                    report.dropped += 1;
                }
            }
            metrics::gauge!("broadcast_subscribers").set(subs.len() as f64);
            metrics::counter!("broadcast_dropped_subscribers_total").increment(report.dropped as u64);
        }

        metrics::counter!("broadcast_frames_sent_total").increment(report.delivered as u64);
        if report.skipped > 0 {
            metrics::counter!("broadcast_frames_skipped_total").increment(report.skipped as u64);
        }
        report
    }
}

#[async_trait::async_trait]
impl TickSink for BroadcastHub {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn accept(&self, batch: Arc<ReadingBatch>) -> Result<(), SinkError> {
        let report = self.publish(&batch).await;
        tracing::debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            skipped = report.skipped,
            "batch broadcast"
        );
        Ok(())
    }
}
