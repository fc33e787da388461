use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One simulated sample for a device.
///
/// `current` is always `consumption / voltage`; it is never sampled on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub consumption: f64,
    pub voltage: f64,
    pub current: f64,
    pub power_factor: f64,
    pub location: String,
}

impl Reading {
    /// Calendar day the reading is accounted to, in the timestamp's own offset.
    pub fn day(&self) -> time::Date {
        self.timestamp.date()
    }
}
