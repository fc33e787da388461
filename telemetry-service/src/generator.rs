use std::{ops::RangeInclusive, sync::Arc};

use energy_client::domain::{Device, Reading, ReadingBatch};
use rand::{rngs::StdRng, Rng, SeedableRng};
use time::OffsetDateTime;

use crate::registry::DeviceRegistry;

pub const NOMINAL_VOLTAGE: f64 = 220.0;
pub const VOLTAGE_SPREAD: f64 = 5.0;
pub const POWER_FACTOR_RANGE: RangeInclusive<f64> = 0.85..=0.95;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("device '{device_id}' has an invalid profile: {reason}")]
    InvalidDevice { device_id: String, reason: String },
}

impl SimulationError {
    pub fn device_id(&self) -> &str {
        match self {
            Self::InvalidDevice { device_id, .. } => device_id,
        }
    }
}

/// Output of one generation pass: the readings that could be produced plus
/// one error per device that was skipped.
#[derive(Debug, Clone)]
pub struct Tick {
    pub batch: ReadingBatch,
    pub failures: Vec<SimulationError>,
}

/// Diurnal multiplier applied to a device's base load.
///
/// Peak 09:00-17:59, off-peak 23:00-05:59, normal otherwise.
pub fn load_factor(hour: u8) -> f64 {
    match hour {
        9..=17 => 1.5,
        h if h >= 23 || h <= 5 => 0.5,
        _ => 1.0,
    }
}

pub struct ReadingGenerator {
    registry: Arc<DeviceRegistry>,
    rng: StdRng,
}

impl ReadingGenerator {
    pub fn new(registry: Arc<DeviceRegistry>, rng: StdRng) -> Self {
        Self { registry, rng }
    }

    /// Reproducible generator; the same seed and fleet yield the same readings.
    pub fn seeded(registry: Arc<DeviceRegistry>, seed: u64) -> Self {
        Self::new(registry, StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy(registry: Arc<DeviceRegistry>) -> Self {
        Self::new(registry, StdRng::from_entropy())
    }

    /// One reading per active device at `at`. A device that cannot be
    /// simulated is reported in `failures` and does not abort the batch.
    pub fn generate(&mut self, at: OffsetDateTime) -> Tick {
        let mut devices = self.registry.list_active();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let mut readings = Vec::with_capacity(devices.len());
        let mut failures = Vec::new();
        for device in &devices {
            match self.reading_for(device, at) {
                Ok(r) => readings.push(r),
                Err(e) => failures.push(e),
            }
        }

        Tick {
            batch: ReadingBatch::new(at, readings),
            failures,
        }
    }

    pub fn reading_for(&mut self, device: &Device, at: OffsetDateTime) -> Result<Reading, SimulationError> {
        validate(device)?;

        let noise = self.rng.gen_range(-device.variation..=device.variation);
        let consumption = (device.base_load * load_factor(at.hour()) * (1.0 + noise)).max(0.0);

        let voltage = NOMINAL_VOLTAGE + self.rng.gen_range(-VOLTAGE_SPREAD..=VOLTAGE_SPREAD);

        let power_factor = self.rng.gen_range(POWER_FACTOR_RANGE);

        Ok(Reading {
            device_id: device.device_id.clone(),
            timestamp: at,
            consumption,
            voltage,
            current: consumption / voltage,
            power_factor,
            location: device.location.clone(),
        })
    }
}

fn validate(device: &Device) -> Result<(), SimulationError> {
    let invalid = |reason: &str| SimulationError::InvalidDevice {
        device_id: device.device_id.clone(),
        reason: reason.to_string(),
    };

    if device.device_id.trim().is_empty() {
        return Err(invalid("empty device id"));
    }
    if !device.base_load.is_finite() || device.base_load < 0.0 {
        return Err(invalid("base load must be a finite, non-negative wattage"));
    }
    if !(0.0..=1.0).contains(&device.variation) {
        return Err(invalid("variation must be within [0, 1]"));
    }
    if !device.voltage_range.is_well_formed() {
        return Err(invalid("voltage range must satisfy 0 < min < max"));
    }
    // Every sample must be measurable, so the range has to cover the whole band.
    let band = (NOMINAL_VOLTAGE - VOLTAGE_SPREAD, NOMINAL_VOLTAGE + VOLTAGE_SPREAD);
    if !(device.voltage_range.contains(band.0) && device.voltage_range.contains(band.1)) {
        return Err(invalid(&format!(
            "voltage range [{}, {}] does not cover the {}-{} V supply band",
            device.voltage_range.min, device.voltage_range.max, band.0, band.1
        )));
    }
    Ok(())
}
