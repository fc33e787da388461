use energy_client::domain::Reading;
use sqlx::{
    postgres::{PgArguments, PgPool, PgPoolOptions},
    query::Query,
    Postgres,
};
use time::{Date, OffsetDateTime};

use super::{PersistenceError, ReadingStore};

/// Postgres-wire store. Expects the tables from `sql/schema/01_energy.sql`.
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await
            .map_err(store_err)?;
        Ok(Self::new(pool))
    }
}

fn store_err(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Store(e.to_string())
}

fn ts_to_unix_nanos(ts: OffsetDateTime) -> i128 {
    ts.unix_timestamp_nanos()
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

/// Content hash used as the idempotency key of a stored reading.
pub(crate) fn event_id(r: &Reading) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&ts_to_unix_nanos(r.timestamp).to_le_bytes());
    hash_str(&mut h, &r.device_id);
    hash_str(&mut h, &r.location);
    hash_f64(&mut h, r.consumption);
    hash_f64(&mut h, r.voltage);
    hash_f64(&mut h, r.power_factor);
    h.finalize().to_hex().to_string()
}

const INSERT_READING: &str = r#"
    INSERT INTO energy_readings
        (event_id, ts, device_id, location, consumption_w, voltage_v, current_a, power_factor)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (event_id) DO NOTHING
"#;

// Single statement so the increment, max and running mean are applied
// atomically by the database.
const UPSERT_AGGREGATE: &str = r#"
    INSERT INTO daily_energy_usage AS d
        (device_id, day, total_consumption, peak_demand, average_power_factor, reading_count)
    VALUES ($1, $2, $3, $3, $4, 1)
    ON CONFLICT (device_id, day) DO UPDATE SET
        total_consumption    = d.total_consumption + EXCLUDED.total_consumption,
        peak_demand          = GREATEST(d.peak_demand, EXCLUDED.peak_demand),
        average_power_factor = d.average_power_factor
                               + (EXCLUDED.average_power_factor - d.average_power_factor)
                                 / (d.reading_count + 1),
        reading_count        = d.reading_count + 1
"#;

fn insert_reading(reading: &Reading) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(INSERT_READING)
        .bind(event_id(reading))
        .bind(reading.timestamp)
        .bind(&reading.device_id)
        .bind(&reading.location)
        .bind(reading.consumption)
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.power_factor)
}

fn upsert_aggregate<'q>(device_id: &'q str, date: Date, reading: &Reading) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(UPSERT_AGGREGATE)
        .bind(device_id)
        .bind(date)
        .bind(reading.consumption)
        .bind(reading.power_factor)
}

#[async_trait::async_trait]
impl ReadingStore for PgReadingStore {
    async fn append(&self, reading: &Reading) -> Result<(), PersistenceError> {
        insert_reading(reading)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_err)
    }

    async fn upsert_daily_aggregate(
        &self,
        device_id: &str,
        date: Date,
        reading: &Reading,
    ) -> Result<(), PersistenceError> {
        upsert_aggregate(device_id, date, reading)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_err)
    }

    /// Insert and aggregate in one transaction. The aggregate is only touched
    /// when the insert added a row, so replaying a reading whose commit was
    /// not acknowledged leaves both tables unchanged.
    async fn record_reading(&self, reading: &Reading, date: Date) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let inserted = insert_reading(reading)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected();
        if inserted == 1 {
            upsert_aggregate(&reading.device_id, date, reading)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        } else {
            tracing::debug!(device_id = %reading.device_id, "reading already stored, aggregate left unchanged");
        }

        tx.commit().await.map_err(store_err)
    }
}
