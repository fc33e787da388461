use std::{sync::Arc, time::SystemTime};

use energy_client::domain::ReadingBatch;

/// A payload stamped with the time it entered the service.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("{sink}: {message}")]
pub struct SinkError {
    pub sink: &'static str,
    pub message: String,
}

/// Downstream consumer of every tick's batch.
///
/// `accept` must not wait on slow external work for longer than the sink's
/// own bounds; the scheduler awaits it before the next tick can start.
#[async_trait::async_trait]
pub trait TickSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn accept(&self, batch: Arc<ReadingBatch>) -> Result<(), SinkError>;
}
