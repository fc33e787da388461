//! Fleet seeding from a CSV file.
//!
//! Expected header columns (by name):
//! - device_id
//! - location
//! - status (optional, defaults to `active`)
//! - base_load (optional, watts)
//! - variation (optional)
//! - voltage_min, voltage_max (optional, both or neither)
//!
//! Missing `base_load` and `variation` are drawn the same way the device API
//! fills them in.

use std::{fs::File, io::Read, ops::RangeInclusive, path::Path};

use csv::StringRecord;
use energy_client::domain::{Device, DeviceStatus, VoltageRange};
use rand::Rng;

use crate::registry::DeviceRegistry;

pub const DEFAULT_BASE_LOAD: RangeInclusive<f64> = 200.0..=700.0;
pub const DEFAULT_VARIATION: RangeInclusive<f64> = 0.1..=0.3;

#[derive(thiserror::Error, Debug)]
pub enum FleetError {
    #[error("failed to open fleet file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read fleet CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("fleet row {row}: {message}")]
    Row { row: usize, message: String },
}

pub fn draw_base_load<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(DEFAULT_BASE_LOAD)
}

pub fn draw_variation<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(DEFAULT_VARIATION)
}

fn parse_optional_f64(s: &str, column: &str) -> Result<Option<f64>, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e| format!("invalid {column} '{trimmed}': {e}"))
}

fn record_to_device<R: Rng + ?Sized>(
    record: &StringRecord,
    headers: &StringRecord,
    rng: &mut R,
) -> Result<Device, String> {
    let get = |name: &str| -> Option<&str> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
    };

    let device_id = get("device_id")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing device_id".to_string())?
        .to_string();
    let location = get("location").map(str::trim).unwrap_or_default().to_string();

    let status = match get("status").map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse::<DeviceStatus>()?,
        None => DeviceStatus::Active,
    };

    let base_load = match parse_optional_f64(get("base_load").unwrap_or(""), "base_load")? {
        Some(v) => v,
        None => draw_base_load(rng),
    };
    let variation = match parse_optional_f64(get("variation").unwrap_or(""), "variation")? {
        Some(v) => v,
        None => draw_variation(rng),
    };

    let min = parse_optional_f64(get("voltage_min").unwrap_or(""), "voltage_min")?;
    let max = parse_optional_f64(get("voltage_max").unwrap_or(""), "voltage_max")?;
    let voltage_range = match (min, max) {
        (Some(min), Some(max)) => VoltageRange { min, max },
        (None, None) => VoltageRange::default(),
        _ => return Err("voltage_min and voltage_max must be given together".to_string()),
    };

    Ok(Device {
        device_id,
        location,
        status,
        base_load,
        variation,
        voltage_range,
    })
}

/// Parse every row; the first bad row aborts the load.
pub fn read_fleet<T: Read, R: Rng + ?Sized>(reader: T, rng: &mut R) -> Result<Vec<Device>, FleetError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();

    let mut devices = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result?;
        // Header is line 1.
        let row = idx + 2;
        let device = record_to_device(&record, &headers, rng).map_err(|message| FleetError::Row { row, message })?;
        devices.push(device);
    }
    Ok(devices)
}

pub fn load_fleet_file<R: Rng + ?Sized>(path: &Path, rng: &mut R) -> Result<Vec<Device>, FleetError> {
    let file = File::open(path)?;
    read_fleet(file, rng)
}

/// Register `devices`, skipping ids that are already present.
pub fn seed_registry(registry: &DeviceRegistry, devices: Vec<Device>) -> usize {
    let mut registered = 0;
    for device in devices {
        let device_id = device.device_id.clone();
        match registry.register(device) {
            Ok(()) => registered += 1,
            Err(e) => {
                tracing::warn!(error = %e, device_id, "fleet entry skipped");
            }
        }
    }
    tracing::info!(registered, "fleet seeded");
    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    #[test]
    fn reads_full_and_partial_rows() {
        let csv = "\
device_id,location,status,base_load,variation,voltage_min,voltage_max
D1,plant-a,active,500,0.1,210,230
D2,plant-b,maintenance,,,,
D3,plant-c,,450,,,
";
        let devices = read_fleet(csv.as_bytes(), &mut rng()).unwrap();
        assert_eq!(devices.len(), 3);

        let d1 = &devices[0];
        assert_eq!(d1.device_id, "D1");
        assert_eq!(d1.base_load, 500.0);
        assert_eq!(d1.voltage_range, VoltageRange { min: 210.0, max: 230.0 });

        let d2 = &devices[1];
        assert_eq!(d2.status, DeviceStatus::Maintenance);
        assert!(DEFAULT_BASE_LOAD.contains(&d2.base_load));
        assert!(DEFAULT_VARIATION.contains(&d2.variation));
        assert_eq!(d2.voltage_range, VoltageRange::default());

        let d3 = &devices[2];
        assert_eq!(d3.status, DeviceStatus::Active);
        assert_eq!(d3.base_load, 450.0);
        assert!(DEFAULT_VARIATION.contains(&d3.variation));
    }

    #[test]
    fn optional_columns_may_be_absent() {
        let csv = "device_id,location\nD9,roof\n";
        let devices = read_fleet(csv.as_bytes(), &mut rng()).unwrap();
        assert_eq!(devices[0].location, "roof");
        assert!(devices[0].is_active());
    }

    #[test]
    fn bad_rows_name_their_line() {
        let csv = "device_id,location,status\nD1,a,active\nD2,b,broken\n";
        match read_fleet(csv.as_bytes(), &mut rng()) {
            Err(FleetError::Row { row, message }) => {
                assert_eq!(row, 3);
                assert!(message.contains("broken"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }

        let csv = "device_id,location,voltage_min\nD1,a,210\n";
        assert!(matches!(read_fleet(csv.as_bytes(), &mut rng()), Err(FleetError::Row { row: 2, .. })));

        let csv = "device_id,location,base_load\nD1,a,lots\n";
        assert!(matches!(read_fleet(csv.as_bytes(), &mut rng()), Err(FleetError::Row { .. })));
    }

    #[test]
    fn seeding_skips_duplicates() {
        let csv = "device_id,location\nD1,a\nD2,b\nD1,c\n";
        let devices = read_fleet(csv.as_bytes(), &mut rng()).unwrap();

        let registry = DeviceRegistry::new();
        assert_eq!(seed_registry(&registry, devices), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("D1").unwrap().location, "a");
    }
}
