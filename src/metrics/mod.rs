//! Plant telemetry sampling and period-aligned energy integration.
//!
//! The sampler appends one snapshot per poll; the integrator folds every
//! sample at or before the period cutoff into kWh aggregates, persists one
//! row, and only then drops the integrated samples. A failed insert keeps
//! the samples so the next tick retries the identical period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::domain::{IntegratedData, MetricSample};
use crate::forecast::weather::point_for;
use crate::forecast::WeatherClient;
use crate::hardware::InverterClient;
use crate::prices::PriceStore;
use crate::repo::pg::PgRepo;

/// Append-ordered sample buffer shared by the sampler and the integrator.
#[derive(Default)]
pub struct SampleBuffer {
    samples: Mutex<Vec<MetricSample>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, sample: MetricSample) {
        self.samples.lock().await.push(sample);
    }

    pub async fn snapshot(&self) -> Vec<MetricSample> {
        self.samples.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.samples.lock().await.len()
    }

    /// Remove exactly the samples with `timestamp <= cutoff`.
    pub async fn clear_before(&self, cutoff: DateTime<Utc>) {
        self.samples.lock().await.retain(|s| s.timestamp > cutoff);
    }
}

/// The most recent instant `k * period <= now`.
pub fn period_cutoff(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_s = period.as_secs().max(1) as i64;
    let secs = now.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(period_s), 0)
        .single()
        .unwrap_or(now)
}

/// Fold samples with `timestamp <= cutoff` into per-period kWh aggregates.
/// Grid and battery powers are sign-partitioned (grid positive = import,
/// battery positive = charge); the last sample's SOC becomes the period's
/// end-of-period SOC. Cost and weather enrichment stay zeroed here.
pub fn integrate_samples(
    samples: &[MetricSample],
    cutoff: DateTime<Utc>,
    poll_interval: Duration,
) -> IntegratedData {
    let dt_h = poll_interval.as_secs_f64() / 3600.0;

    let mut pv_kwh = 0.0;
    let mut grid_import_kwh = 0.0;
    let mut grid_export_kwh = 0.0;
    let mut battery_charge_kwh = 0.0;
    let mut battery_discharge_kwh = 0.0;
    let mut ev_charge_kwh = 0.0;
    let mut last_soc_percent = 0.0;
    let mut sample_count = 0usize;

    for sample in samples.iter().filter(|s| s.timestamp <= cutoff) {
        pv_kwh += sample.pv_power_kw * dt_h;
        if sample.grid_power_kw >= 0.0 {
            grid_import_kwh += sample.grid_power_kw * dt_h;
        } else {
            grid_export_kwh += -sample.grid_power_kw * dt_h;
        }
        if sample.ess_power_kw >= 0.0 {
            battery_charge_kwh += sample.ess_power_kw * dt_h;
        } else {
            battery_discharge_kwh += -sample.ess_power_kw * dt_h;
        }
        ev_charge_kwh += sample.evdc_power_kw * dt_h;
        last_soc_percent = sample.ess_soc_percent;
        sample_count += 1;
    }

    let load_kwh = pv_kwh + battery_discharge_kwh + grid_import_kwh
        - battery_charge_kwh
        - grid_export_kwh
        - ev_charge_kwh;

    IntegratedData {
        timestamp: cutoff,
        pv_kwh,
        grid_import_kwh,
        grid_export_kwh,
        battery_charge_kwh,
        battery_discharge_kwh,
        ev_charge_kwh,
        load_kwh,
        last_soc_percent,
        sample_count,
        grid_import_cost: 0.0,
        grid_export_revenue: 0.0,
        cloud_coverage: None,
        weather_symbol: None,
    }
}

pub struct MetricsIntegrator {
    buffer: SampleBuffer,
    inverter: Arc<dyn InverterClient>,
    prices: Arc<PriceStore>,
    weather: Arc<WeatherClient>,
    db: Option<Arc<PgRepo>>,
    device_id: String,
    poll_interval: Duration,
    period: Duration,
    import_operator_fee: f64,
    import_delivery_fee: f64,
    export_operator_fee: f64,
    dry_run: bool,
}

impl MetricsIntegrator {
    pub fn new(
        cfg: &Config,
        inverter: Arc<dyn InverterClient>,
        prices: Arc<PriceStore>,
        weather: Arc<WeatherClient>,
        db: Option<Arc<PgRepo>>,
    ) -> Self {
        Self {
            buffer: SampleBuffer::new(),
            inverter,
            prices,
            weather,
            db,
            device_id: cfg.device_id.clone(),
            poll_interval: cfg.pv_poll_interval,
            period: cfg.pv_integration_period,
            import_operator_fee: cfg.import_operator_fee,
            import_delivery_fee: cfg.import_delivery_fee,
            export_operator_fee: cfg.export_operator_fee,
            dry_run: cfg.dry_run,
        }
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Fast loop: read one plant snapshot and append it. A failed read
    /// appends nothing.
    pub async fn sample_tick(&self) -> Result<()> {
        let info = self
            .inverter
            .read_plant_running_info()
            .await
            .context("plant telemetry read failed")?;
        self.buffer
            .append(MetricSample::from_plant_info(&info, Utc::now()))
            .await;
        Ok(())
    }

    /// Period loop: integrate everything at or before the boundary that just
    /// ended, enrich, persist, then drop the integrated samples.
    pub async fn integrate_tick(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = period_cutoff(now, self.period);
        let samples = self.buffer.snapshot().await;
        let mut data = integrate_samples(&samples, cutoff, self.poll_interval);
        if data.sample_count == 0 {
            debug!(%cutoff, "no samples to integrate");
            return Ok(());
        }

        if let Some(spot) = self.prices.current_hour_avg(now).await {
            data.grid_import_cost = (spot + self.import_operator_fee + self.import_delivery_fee)
                * data.grid_import_kwh
                / 1000.0;
            data.grid_export_revenue =
                (spot - self.export_operator_fee) * data.grid_export_kwh / 1000.0;
        } else {
            debug!("no current hour price, costs stay zero");
        }

        match self.weather.forecast(now).await {
            Ok(points) => {
                if let Some(point) = point_for(&points, now) {
                    data.cloud_coverage = Some(point.cloud_fraction);
                    data.weather_symbol = Some(point.symbol.clone());
                }
            }
            Err(err) => debug!(error = %err, "weather enrichment unavailable"),
        }

        match (&self.db, self.dry_run) {
            (Some(db), false) => {
                db.metrics().insert(&data, &self.device_id).await?;
                info!(
                    %cutoff,
                    samples = data.sample_count,
                    pv_kwh = data.pv_kwh,
                    load_kwh = data.load_kwh,
                    "integrated metrics persisted"
                );
            }
            _ => {
                info!(
                    %cutoff,
                    samples = data.sample_count,
                    pv_kwh = data.pv_kwh,
                    load_kwh = data.load_kwh,
                    dry_run = self.dry_run,
                    "integrated metrics (not persisted)"
                );
            }
        }

        // Only reached after a successful insert (or the log-only path):
        // a failed insert above keeps every sample for the retry.
        self.buffer.clear_before(cutoff).await;
        Ok(())
    }

    /// Most recent sample, for the status surface.
    pub async fn last_sample(&self) -> Option<MetricSample> {
        self.buffer.samples.lock().await.last().copied()
    }
}
