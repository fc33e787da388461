use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use energy_client::domain::{Device, DevicePatch, DeviceStatus};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("device '{0}' is already registered")]
    DuplicateDevice(String),
    #[error("device '{0}' not found")]
    NotFound(String),
}

/// The set of devices known to the simulator.
///
/// Writers come from management requests, the reader is the tick loop. Every
/// read sees a whole device entry from before or after a write.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: Device) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.contains_key(&device.device_id) {
            return Err(RegistryError::DuplicateDevice(device.device_id));
        }
        tracing::info!(device_id = %device.device_id, status = device.status.as_str(), "device registered");
        devices.insert(device.device_id.clone(), device);
        metrics::gauge!("registry_devices").set(devices.len() as f64);
        Ok(())
    }

    /// Apply `patch`. A device patched out of `active` stays registered but is
    /// no longer simulated.
    pub fn update(&self, device_id: &str, patch: DevicePatch) -> Result<Device, RegistryError> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))?;

        // Patch a copy so the stored entry changes in one assignment.
        let mut updated = device.clone();
        patch.apply(&mut updated);
        *device = updated.clone();

        tracing::info!(device_id, status = updated.status.as_str(), "device updated");
        Ok(updated)
    }

    /// Remove a device. Removing an unknown id is a no-op.
    pub fn remove(&self, device_id: &str) -> Option<Device> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let removed = devices.remove(device_id);
        if removed.is_some() {
            tracing::info!(device_id, "device removed");
            metrics::gauge!("registry_devices").set(devices.len() as f64);
        }
        removed
    }

    pub fn list_active(&self) -> Vec<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| d.is_active())
            .cloned()
            .collect()
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// `Active` when the device is currently simulated, `Inactive` otherwise
    /// (including unknown ids).
    pub fn status_of(&self, device_id: &str) -> DeviceStatus {
        match self.get(device_id) {
            Some(d) if d.is_active() => DeviceStatus::Active,
            _ => DeviceStatus::Inactive,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energy_client::domain::VoltageRange;
    use std::sync::Arc;

    fn device(id: &str, status: DeviceStatus) -> Device {
        Device {
            device_id: id.to_string(),
            location: "substation-1".to_string(),
            status,
            base_load: 400.0,
            variation: 0.2,
            voltage_range: VoltageRange::default(),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = DeviceRegistry::new();
        registry.register(device("D1", DeviceStatus::Active)).unwrap();

        let err = registry.register(device("D1", DeviceStatus::Inactive)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateDevice("D1".to_string()));
        assert_eq!(registry.get("D1").unwrap().status, DeviceStatus::Active);
    }

    #[test]
    fn update_of_unknown_device_fails() {
        let registry = DeviceRegistry::new();
        let err = registry.update("nope", DevicePatch::default()).unwrap_err();
        assert_eq!(err, RegistryError::NotFound("nope".to_string()));
    }

    #[test]
    fn deactivated_device_is_kept_but_not_listed() {
        let registry = DeviceRegistry::new();
        registry.register(device("D1", DeviceStatus::Active)).unwrap();
        registry.register(device("D2", DeviceStatus::Active)).unwrap();

        let updated = registry
            .update(
                "D1",
                DevicePatch {
                    status: Some(DeviceStatus::Maintenance),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.status, DeviceStatus::Maintenance);
        assert_eq!(registry.len(), 2);
        let active: Vec<String> = registry.list_active().into_iter().map(|d| d.device_id).collect();
        assert_eq!(active, vec!["D2".to_string()]);
        assert_eq!(registry.status_of("D1"), DeviceStatus::Inactive);
        assert_eq!(registry.status_of("D2"), DeviceStatus::Active);
    }

    #[test]
    fn reactivated_device_is_simulated_again() {
        let registry = DeviceRegistry::new();
        registry.register(device("D1", DeviceStatus::Inactive)).unwrap();
        assert!(registry.list_active().is_empty());

        registry
            .update(
                "D1",
                DevicePatch {
                    status: Some(DeviceStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = DeviceRegistry::new();
        registry.register(device("D1", DeviceStatus::Active)).unwrap();

        assert!(registry.remove("D1").is_some());
        assert!(registry.remove("D1").is_none());
        assert!(registry.remove("never-registered").is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.status_of("D1"), DeviceStatus::Inactive);
    }

    #[test]
    fn concurrent_writers_and_readers_see_whole_entries() {
        let registry = Arc::new(DeviceRegistry::new());
        for i in 0..16 {
            registry.register(device(&format!("D{i}"), DeviceStatus::Active)).unwrap();
        }

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for round in 0..200 {
                    let load = 1000.0 + round as f64;
                    for i in 0..16 {
                        registry
                            .update(
                                &format!("D{i}"),
                                DevicePatch {
                                    base_load: Some(load),
                                    location: Some(format!("site-{load}")),
                                    ..Default::default()
                                },
                            )
                            .unwrap();
                    }
                }
            })
        };

        for _ in 0..200 {
            for d in registry.list_active() {
                if d.base_load >= 1000.0 {
                    assert_eq!(d.location, format!("site-{}", d.base_load));
                }
            }
        }

        writer.join().unwrap();
        assert_eq!(registry.list_active().len(), 16);
    }
}
