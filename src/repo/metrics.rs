use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::domain::IntegratedData;

/// Row label for integration-period aggregates.
const METRIC_NAME: &str = "pv_integration";

pub struct MetricsRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> MetricsRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert one integration-period row keyed by `(timestamp, device_id)`.
    /// Retrying the same period overwrites with identical values, keeping the
    /// integrator idempotent across failures.
    pub async fn insert(&self, data: &IntegratedData, device_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (
                timestamp, device_id, metric_name, pv_total_power,
                cloud_coverage, weather_symbol, grid_export_power,
                grid_import_power, battery_charge_power,
                battery_discharge_power, battery_soc, evdc_charge_power,
                load_power, grid_export_cost, grid_import_cost
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (timestamp, device_id) DO UPDATE SET
                metric_name = EXCLUDED.metric_name,
                pv_total_power = EXCLUDED.pv_total_power,
                cloud_coverage = EXCLUDED.cloud_coverage,
                weather_symbol = EXCLUDED.weather_symbol,
                grid_export_power = EXCLUDED.grid_export_power,
                grid_import_power = EXCLUDED.grid_import_power,
                battery_charge_power = EXCLUDED.battery_charge_power,
                battery_discharge_power = EXCLUDED.battery_discharge_power,
                battery_soc = EXCLUDED.battery_soc,
                evdc_charge_power = EXCLUDED.evdc_charge_power,
                load_power = EXCLUDED.load_power,
                grid_export_cost = EXCLUDED.grid_export_cost,
                grid_import_cost = EXCLUDED.grid_import_cost
            "#,
        )
        .bind(data.timestamp)
        .bind(device_id)
        .bind(METRIC_NAME)
        .bind(data.pv_kwh)
        .bind(data.cloud_coverage)
        .bind(data.weather_symbol.as_deref())
        .bind(data.grid_export_kwh)
        .bind(data.grid_import_kwh)
        .bind(data.battery_charge_kwh)
        .bind(data.battery_discharge_kwh)
        .bind(data.last_soc_percent)
        .bind(data.ev_charge_kwh)
        .bind(data.load_kwh)
        .bind(data.grid_export_revenue)
        .bind(data.grid_import_cost)
        .execute(self.pool)
        .await
        .context("inserting metrics row failed")?;
        Ok(())
    }
}
