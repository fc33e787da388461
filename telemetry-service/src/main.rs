use anyhow::Result;
use std::{sync::Arc, time::Duration};
use telemetry_service::{
    api::{self, AppState},
    broadcast::{self, BroadcastHub},
    config::{AppConfig, StoreKind},
    fleet, metrics_server, observability,
    persistence::{MemoryStore, PersistenceSink, PgReadingStore, ReadingStore},
    pipeline::TickSink,
    registry::DeviceRegistry,
    scheduler::SimulationScheduler,
    server, ReadingGenerator,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    let registry = Arc::new(DeviceRegistry::new());
    if let Some(path) = &cfg.simulation.fleet_csv {
        let devices = fleet::load_fleet_file(path, &mut rand::thread_rng())
            .map_err(|e| anyhow::anyhow!("failed to load fleet {}: {e}", path.display()))?;
        fleet::seed_registry(&registry, devices);
    }

    let store: Arc<dyn ReadingStore> = match cfg.persistence.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Postgres => {
            Arc::new(PgReadingStore::connect(&cfg.persistence.uri, cfg.persistence.max_connections).await?)
        }
    };
    let persistence = Arc::new(PersistenceSink::spawn(store, cfg.persistence.settings()));
    let hub = Arc::new(BroadcastHub::new(cfg.broadcast.send_timeout()));

    let generator = match cfg.simulation.seed {
        Some(seed) => ReadingGenerator::seeded(registry.clone(), seed),
        None => ReadingGenerator::from_entropy(registry.clone()),
    };
    let sinks: Vec<Arc<dyn TickSink>> = vec![persistence.clone() as Arc<dyn TickSink>, hub.clone() as Arc<dyn TickSink>];
    let scheduler = Arc::new(SimulationScheduler::new(
        generator,
        sinks,
        cfg.simulation.tick_period(),
        cfg.simulation.utc_offset()?,
    ));

    server::spawn("broadcast", &cfg.broadcast.bind_addr, broadcast::ws::router(hub.clone())).await?;
    let state = AppState {
        registry,
        hub,
        scheduler: scheduler.clone(),
    };
    server::spawn("api", &cfg.api.bind_addr, api::router(state)).await?;

    scheduler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    scheduler.stop();

    if tokio::time::timeout(Duration::from_secs(10), persistence.close()).await.is_err() {
        tracing::warn!("persistence did not drain within 10s, exiting anyway");
    }

    Ok(())
}
