pub mod reading_queries;

pub use reading_queries::{daily_usage, device_readings, device_stats, recent_readings, DeviceStats};
