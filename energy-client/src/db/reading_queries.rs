use anyhow::Result;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};

use crate::domain::{DailyAggregate, Reading};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceStats {
    pub total_consumption: Option<f64>,
    pub avg_voltage: Option<f64>,
    pub avg_current: Option<f64>,
    pub avg_power_factor: Option<f64>,
    pub max_demand: Option<f64>,
    pub reading_count: i64,
}

/// Latest readings across the fleet, newest first.
pub async fn recent_readings(pool: &PgPool, limit: i64) -> Result<Vec<Reading>> {
    let rows = sqlx::query_as::<_, Reading>(
        r#"
        SELECT
            device_id,
            ts AS timestamp,
            consumption_w AS consumption,
            voltage_v AS voltage,
            current_a AS current,
            power_factor,
            location
        FROM energy_readings
        ORDER BY ts DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Time-ordered readings for one device in `[start, end)`.
pub async fn device_readings(
    pool: &PgPool,
    device_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<Reading>> {
    let rows = sqlx::query_as::<_, Reading>(
        r#"
        SELECT
            device_id,
            ts AS timestamp,
            consumption_w AS consumption,
            voltage_v AS voltage,
            current_a AS current,
            power_factor,
            location
        FROM energy_readings
        WHERE device_id = $1
          AND ts >= $2
          AND ts <  $3
        ORDER BY ts
        "#,
    )
    .bind(device_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Daily rollups for one device, inclusive of both bounds.
pub async fn daily_usage(pool: &PgPool, device_id: &str, from: Date, to: Date) -> Result<Vec<DailyAggregate>> {
    let rows = sqlx::query_as::<_, DailyAggregate>(
        r#"
        SELECT
            device_id,
            day AS date,
            total_consumption,
            peak_demand,
            average_power_factor,
            reading_count
        FROM daily_energy_usage
        WHERE device_id = $1
          AND day >= $2
          AND day <= $3
        ORDER BY day
        "#,
    )
    .bind(device_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Summary statistics for one device since `since`.
pub async fn device_stats(pool: &PgPool, device_id: &str, since: OffsetDateTime) -> Result<DeviceStats> {
    let stats = sqlx::query_as::<_, DeviceStats>(
        r#"
        SELECT
            SUM(consumption_w)  AS total_consumption,
            AVG(voltage_v)      AS avg_voltage,
            AVG(current_a)      AS avg_current,
            AVG(power_factor)   AS avg_power_factor,
            MAX(consumption_w)  AS max_demand,
            COUNT(*)            AS reading_count
        FROM energy_readings
        WHERE device_id = $1
          AND ts >= $2
        "#,
    )
    .bind(device_id)
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(stats)
}
