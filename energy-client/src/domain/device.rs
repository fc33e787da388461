use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("unknown device status '{other}'")),
        }
    }
}

/// Voltage measurement range of a device, in volts (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub min: f64,
    pub max: f64,
}

impl VoltageRange {
    pub fn contains(&self, volts: f64) -> bool {
        volts >= self.min && volts <= self.max
    }

    pub fn is_well_formed(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min > 0.0 && self.min < self.max
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self { min: 200.0, max: 240.0 }
    }
}

/// A monitored device and its simulation profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub location: String,
    pub status: DeviceStatus,
    /// Base load in watts.
    pub base_load: f64,
    /// Relative noise amplitude, expected in `[0, 1]`.
    pub variation: f64,
    #[serde(default)]
    pub voltage_range: VoltageRange,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }
}

/// Partial update applied by `DeviceRegistry::update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    pub location: Option<String>,
    pub status: Option<DeviceStatus>,
    pub base_load: Option<f64>,
    pub variation: Option<f64>,
    pub voltage_range: Option<VoltageRange>,
}

impl DevicePatch {
    pub fn apply(self, device: &mut Device) {
        if let Some(location) = self.location {
            device.location = location;
        }
        if let Some(status) = self.status {
            device.status = status;
        }
        if let Some(base_load) = self.base_load {
            device.base_load = base_load;
        }
        if let Some(variation) = self.variation {
            device.variation = variation;
        }
        if let Some(range) = self.voltage_range {
            device.voltage_range = range;
        }
    }
}
