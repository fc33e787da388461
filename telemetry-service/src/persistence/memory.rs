use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use energy_client::domain::{DailyAggregate, Reading};
use time::Date;

use super::{postgres::event_id, PersistenceError, ReadingStore};

#[derive(Default)]
struct State {
    readings: Vec<Reading>,
    event_ids: HashSet<String>,
    aggregates: HashMap<(String, Date), DailyAggregate>,
}

impl State {
    /// Returns `false` if an identical reading is already stored.
    fn append(&mut self, reading: &Reading) -> bool {
        if !self.event_ids.insert(event_id(reading)) {
            return false;
        }
        self.readings.push(reading.clone());
        true
    }

    fn aggregate(&mut self, device_id: &str, date: Date, reading: &Reading) {
        self.aggregates
            .entry((device_id.to_string(), date))
            .or_insert_with(|| DailyAggregate::empty(device_id, date))
            .apply(reading);
    }
}

/// In-process store. Used when no database is configured and in tests.
///
/// Appends are idempotent per reading content, the same as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.state().readings.clone()
    }

    pub fn reading_count(&self) -> usize {
        self.state().readings.len()
    }

    pub fn daily_aggregate(&self, device_id: &str, date: Date) -> Option<DailyAggregate> {
        self.state().aggregates.get(&(device_id.to_string(), date)).cloned()
    }
}

#[async_trait::async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, reading: &Reading) -> Result<(), PersistenceError> {
        self.state().append(reading);
        Ok(())
    }

    async fn upsert_daily_aggregate(
        &self,
        device_id: &str,
        date: Date,
        reading: &Reading,
    ) -> Result<(), PersistenceError> {
        self.state().aggregate(device_id, date, reading);
        Ok(())
    }

    async fn record_reading(&self, reading: &Reading, date: Date) -> Result<(), PersistenceError> {
        let mut state = self.state();
        if state.append(reading) {
            state.aggregate(&reading.device_id, date, reading);
        }
        Ok(())
    }
}
