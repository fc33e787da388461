//! Durable recording of readings and their daily rollups.
//!
//! `PersistenceSink::record` never waits on storage. Readings are routed to a
//! fixed set of workers by device id, so all writes for one device (and so one
//! device/day aggregate) happen in order on a single worker while different
//! devices are written in parallel.

pub mod memory;
pub mod postgres;

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use energy_client::domain::{Reading, ReadingBatch};
use futures::StreamExt;
use time::Date;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, SinkError, TickSink};

pub use memory::MemoryStore;
pub use postgres::PgReadingStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("store error: {0}")]
    Store(String),
    #[error("persistence backlog full, dropped reading for device '{device_id}'")]
    Backlogged { device_id: String },
    #[error("persistence sink is closed")]
    Closed,
}

/// Storage collaborator. Implementations must make each call atomic for its
/// own key; ordering per device is provided by the sink.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    async fn append(&self, reading: &Reading) -> Result<(), PersistenceError>;

    async fn upsert_daily_aggregate(
        &self,
        device_id: &str,
        date: Date,
        reading: &Reading,
    ) -> Result<(), PersistenceError>;

    /// Store `reading` and fold it into its daily aggregate as one unit.
    ///
    /// The sink retries this call as a whole, so stores that can fail after
    /// committing must make it idempotent per reading.
    async fn record_reading(&self, reading: &Reading, date: Date) -> Result<(), PersistenceError> {
        self.append(reading).await?;
        self.upsert_daily_aggregate(&reading.device_id, date, reading).await
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub workers: usize,
    pub channel_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 1024,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    max_retries: u32,
    backoff: Duration,
}

impl Retry {
    async fn run<F, Fut>(&self, op: &'static str, device_id: &str, mut f: F) -> Result<(), PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PersistenceError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        op,
                        device_id,
                        attempt,
                        "persistence write failed, retrying with backoff"
                    );
                    metrics::counter!("persistence_retry_total", "op" => op).increment(1);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct PersistenceSink {
    shards: Mutex<Vec<mpsc::Sender<Envelope<Reading>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceSink {
    /// Start the shard workers. Must be called within a tokio runtime.
    pub fn spawn(store: Arc<dyn ReadingStore>, settings: PersistenceSettings) -> Self {
        let workers = settings.workers.max(1);
        let retry = Retry {
            max_retries: settings.max_retries,
            backoff: settings.retry_backoff,
        };

        let mut shards = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel::<Envelope<Reading>>(settings.channel_capacity.max(1));
            shards.push(tx);
            joins.push(tokio::spawn(run_worker(shard, store.clone(), rx, retry)));
        }

        Self {
            shards: Mutex::new(shards),
            workers: Mutex::new(joins),
        }
    }

    /// Queue every reading of `readings` for writing.
    ///
    /// Readings that cannot be queued are dropped and logged; the first such
    /// error is returned after the whole batch has been attempted.
    pub fn record(&self, readings: &[Reading]) -> Result<(), PersistenceError> {
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        if shards.is_empty() {
            return Err(PersistenceError::Closed);
        }

        let mut first_error = None;
        for reading in readings {
            let idx = shard_index(&reading.device_id, shards.len());
            let err = match shards[idx].try_send(Envelope::now(reading.clone())) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(env)) => PersistenceError::Backlogged {
                    device_id: env.payload.device_id,
                },
                Err(mpsc::error::TrySendError::Closed(_)) => PersistenceError::Closed,
            };

            tracing::warn!(error = %err, shard = idx, "reading not queued for persistence");
            metrics::counter!("persistence_rejected_total").increment(1);
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop accepting readings and wait for queued ones to be written.
    pub async fn close(&self) {
        drop(std::mem::take(
            &mut *self.shards.lock().unwrap_or_else(PoisonError::into_inner),
        ));
        let joins = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        for j in joins {
            if let Err(e) = j.await {
                tracing::error!(error = %e, "persistence worker join error");
            }
        }
    }
}

#[async_trait::async_trait]
impl TickSink for PersistenceSink {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn accept(&self, batch: Arc<ReadingBatch>) -> Result<(), SinkError> {
        self.record(&batch.readings).map_err(|e| SinkError {
            sink: self.name(),
            message: e.to_string(),
        })
    }
}

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

async fn run_worker(
    shard: usize,
    store: Arc<dyn ReadingStore>,
    rx: mpsc::Receiver<Envelope<Reading>>,
    retry: Retry,
) {
    let mut input = ReceiverStream::new(rx);
    while let Some(env) = input.next().await {
        persist(store.as_ref(), &env, retry).await;
    }
    tracing::debug!(shard, "persistence worker drained");
}

async fn persist(store: &dyn ReadingStore, env: &Envelope<Reading>, retry: Retry) {
    let r = &env.payload;
    let day = r.day();

    if let Err(e) = retry.run("record", &r.device_id, || store.record_reading(r, day)).await {
        tracing::error!(error = %e, device_id = %r.device_id, %day, "failed to persist reading, giving up");
        metrics::counter!("persistence_errors_total", "op" => "record").increment(1);
        return;
    }

    metrics::counter!("persistence_readings_written_total").increment(1);
    if let Ok(dur) = SystemTime::now().duration_since(env.received_at) {
        metrics::histogram!("persistence_write_latency_seconds").record(dur.as_secs_f64());
    }
}
