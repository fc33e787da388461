use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use time::{OffsetDateTime, UtcOffset};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    generator::{ReadingGenerator, SimulationError},
    pipeline::{SinkError, TickSink},
};

#[derive(Debug, Clone)]
pub struct TickReport {
    pub at: OffsetDateTime,
    pub produced: usize,
    pub failures: Vec<SimulationError>,
    pub sink_errors: Vec<SinkError>,
}

/// Drives the fixed-period generate-and-dispatch cycle.
///
/// Ticks never overlap: the generator stays locked until every sink has
/// accepted the batch, and a late tick delays the next one instead of
/// running alongside it.
pub struct SimulationScheduler {
    generator: tokio::sync::Mutex<ReadingGenerator>,
    sinks: Vec<Arc<dyn TickSink>>,
    period: Duration,
    offset: UtcOffset,
    running: Mutex<Option<CancellationToken>>,
}

impl SimulationScheduler {
    pub fn new(generator: ReadingGenerator, sinks: Vec<Arc<dyn TickSink>>, period: Duration, offset: UtcOffset) -> Self {
        Self {
            generator: tokio::sync::Mutex::new(generator),
            sinks,
            period,
            offset,
            running: Mutex::new(None),
        }
    }

    /// Spawn the tick loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return false;
        }

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        tokio::spawn(self.clone().run(cancel));
        tracing::info!(period_ms = self.period.as_millis() as u64, "simulation started");
        true
    }

    /// Prevent further ticks. Work already handed to sinks is not aborted.
    pub fn stop(&self) {
        if let Some(cancel) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
            tracing::info!("simulation stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Current wall-clock time in the simulation's offset.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick_at(self.now()).await;
        }
    }

    /// Run one tick stamped `at`.
    pub async fn tick_at(&self, at: OffsetDateTime) -> TickReport {
        let started = Instant::now();
        let mut generator = self.generator.lock().await;

        let tick = generator.generate(at);
        for f in &tick.failures {
            tracing::warn!(error = %f, device_id = f.device_id(), "device skipped this tick");
        }
        metrics::counter!("simulation_ticks_total").increment(1);
        metrics::counter!("simulation_readings_total").increment(tick.batch.len() as u64);
        metrics::counter!("simulation_errors_total").increment(tick.failures.len() as u64);

        let produced = tick.batch.len();
        let batch = Arc::new(tick.batch);
        let results = futures::future::join_all(self.sinks.iter().map(|s| s.accept(batch.clone()))).await;
        drop(generator);

        let mut sink_errors = Vec::new();
        for res in results {
            if let Err(e) = res {
                tracing::warn!(error = %e, sink = e.sink, "tick sink reported a failure");
                metrics::counter!("simulation_sink_errors_total", "sink" => e.sink).increment(1);
                sink_errors.push(e);
            }
        }

        let elapsed = started.elapsed();
        metrics::histogram!("simulation_tick_duration_seconds").record(elapsed.as_secs_f64());
        if elapsed > self.period {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "tick overran its period, next tick deferred");
        }
        tracing::debug!(%at, produced, failed = tick.failures.len(), "tick complete");

        TickReport {
            at,
            produced,
            failures: tick.failures,
            sink_errors,
        }
    }
}
