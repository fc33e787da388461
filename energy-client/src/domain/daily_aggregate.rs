use time::Date;

use super::Reading;

/// Per-device, per-day rollup of readings.
///
/// After any prefix of readings for the key, `total_consumption` is their sum,
/// `peak_demand` their maximum and `average_power_factor` their mean.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DailyAggregate {
    pub device_id: String,
    pub date: Date,
    pub total_consumption: f64,
    pub peak_demand: f64,
    pub average_power_factor: f64,
    pub reading_count: i64,
}

impl DailyAggregate {
    pub fn empty(device_id: impl Into<String>, date: Date) -> Self {
        Self {
            device_id: device_id.into(),
            date,
            total_consumption: 0.0,
            peak_demand: 0.0,
            average_power_factor: 0.0,
            reading_count: 0,
        }
    }

    /// Fold one reading in, O(1).
    pub fn apply(&mut self, reading: &Reading) {
        self.reading_count += 1;
        self.total_consumption += reading.consumption;
        self.peak_demand = self.peak_demand.max(reading.consumption);
        self.average_power_factor +=
            (reading.power_factor - self.average_power_factor) / self.reading_count as f64;
    }
}
