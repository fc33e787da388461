//! Follow a telemetry feed and log every batch.
//!
//! Usage: `stream_tail [ws-url]`. Without an argument the `[stream_client]`
//! section of the service config is used.

use std::sync::Arc;

use anyhow::Result;
use energy_client::{domain::ReadingBatch, stream::ClientFatalError, ClientState, StreamClient, StreamObserver};
use telemetry_service::{config::AppConfig, observability};

struct LogObserver;

impl StreamObserver for LogObserver {
    fn on_readings(&self, batch: &ReadingBatch) {
        let total: f64 = batch.readings.iter().map(|r| r.consumption).sum();
        tracing::info!(at = %batch.timestamp, devices = batch.len(), total_w = total, "batch");
        for r in &batch.readings {
            tracing::debug!(
                device_id = %r.device_id,
                consumption = r.consumption,
                voltage = r.voltage,
                power_factor = r.power_factor,
                "reading"
            );
        }
    }

    fn on_fatal(&self, error: &ClientFatalError) {
        tracing::error!(error = %error, "stream lost");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let mut cfg = AppConfig::load()?.stream_client;
    if let Some(url) = std::env::args().nth(1) {
        cfg.url = url;
    }
    tracing::info!(url = %cfg.url, "following stream");

    let client = StreamClient::websocket(&cfg);
    client.subscribe(Arc::new(LogObserver));
    client.connect();

    let mut state = client.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.disconnect();
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = state.borrow_and_update().clone();
                tracing::debug!(state = ?session.state, attempt = session.reconnect_attempt, "client state");
                if session.state == ClientState::Failed {
                    anyhow::bail!(
                        "gave up after {} attempts: {}",
                        session.reconnect_attempt,
                        session.last_error.map(|e| e.to_string()).unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}
