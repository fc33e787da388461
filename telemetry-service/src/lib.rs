pub mod api;
pub mod broadcast;
pub mod config;
pub mod fleet;
pub mod generator;
pub mod metrics_server;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod server;

pub use broadcast::BroadcastHub;
pub use generator::ReadingGenerator;
pub use pipeline::{Envelope, TickSink};
pub use registry::DeviceRegistry;
pub use scheduler::SimulationScheduler;
