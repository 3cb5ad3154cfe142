use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::ControlDecision;

#[derive(Debug, Clone, sqlx::FromRow)]
struct DecisionRow {
    timestamp: DateTime<Utc>,
    hour: i32,
    battery_charge: f64,
    battery_discharge: f64,
    grid_import: f64,
    grid_export: f64,
    battery_soc: f64,
    profit: f64,
    import_price: f64,
    export_price: f64,
    solar_forecast: f64,
    load_forecast: f64,
    cloud_coverage: f64,
    weather_symbol: String,
}

impl From<DecisionRow> for ControlDecision {
    fn from(row: DecisionRow) -> Self {
        ControlDecision {
            hour: row.hour.max(0) as u32,
            timestamp: row.timestamp,
            battery_charge: row.battery_charge,
            battery_discharge: row.battery_discharge,
            grid_import: row.grid_import,
            grid_export: row.grid_export,
            battery_soc: row.battery_soc,
            profit: row.profit,
            import_price: row.import_price,
            export_price: row.export_price,
            solar_forecast: row.solar_forecast,
            load_forecast: row.load_forecast,
            cloud_coverage: row.cloud_coverage,
            weather_symbol: row.weather_symbol,
        }
    }
}

pub struct DecisionRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> DecisionRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Persist a new trajectory in one transaction: delete every row at or
    /// after the trajectory's first timestamp, then upsert each decision
    /// keyed by timestamp. A failed transaction leaves the prior rows intact.
    pub async fn replace_from(&self, decisions: &[ControlDecision]) -> Result<()> {
        let Some(first) = decisions.first() else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await.context("begin failed")?;

        sqlx::query("DELETE FROM mpc_decisions WHERE timestamp >= $1")
            .bind(first.timestamp)
            .execute(&mut *tx)
            .await
            .context("deleting superseded decisions failed")?;

        for d in decisions {
            sqlx::query(
                r#"
                INSERT INTO mpc_decisions (
                    timestamp, hour, battery_charge, battery_discharge,
                    grid_import, grid_export, battery_soc, profit,
                    import_price, export_price, solar_forecast, load_forecast,
                    cloud_coverage, weather_symbol
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (timestamp) DO UPDATE SET
                    hour = EXCLUDED.hour,
                    battery_charge = EXCLUDED.battery_charge,
                    battery_discharge = EXCLUDED.battery_discharge,
                    grid_import = EXCLUDED.grid_import,
                    grid_export = EXCLUDED.grid_export,
                    battery_soc = EXCLUDED.battery_soc,
                    profit = EXCLUDED.profit,
                    import_price = EXCLUDED.import_price,
                    export_price = EXCLUDED.export_price,
                    solar_forecast = EXCLUDED.solar_forecast,
                    load_forecast = EXCLUDED.load_forecast,
                    cloud_coverage = EXCLUDED.cloud_coverage,
                    weather_symbol = EXCLUDED.weather_symbol
                "#,
            )
            .bind(d.timestamp)
            .bind(d.hour as i32)
            .bind(d.battery_charge)
            .bind(d.battery_discharge)
            .bind(d.grid_import)
            .bind(d.grid_export)
            .bind(d.battery_soc)
            .bind(d.profit)
            .bind(d.import_price)
            .bind(d.export_price)
            .bind(d.solar_forecast)
            .bind(d.load_forecast)
            .bind(d.cloud_coverage)
            .bind(&d.weather_symbol)
            .execute(&mut *tx)
            .await
            .context("upserting decision failed")?;
        }

        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    /// Decisions with `timestamp >= cutoff`, ordered by timestamp. Used at
    /// startup to resume the trajectory covering the current slot.
    pub async fn load_from(&self, cutoff: DateTime<Utc>) -> Result<Vec<ControlDecision>> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            r#"
            SELECT timestamp, hour, battery_charge, battery_discharge,
                   grid_import, grid_export, battery_soc, profit,
                   import_price, export_price, solar_forecast, load_forecast,
                   cloud_coverage, weather_symbol
            FROM mpc_decisions
            WHERE timestamp >= $1
            ORDER BY timestamp
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool)
        .await
        .context("loading persisted decisions failed")?;

        Ok(rows.into_iter().map(ControlDecision::from).collect())
    }
}
