//! End-to-end executor behaviour against a scripted inverter: a refused
//! write leaves the executed marker unset and the minute loop retries the
//! same decision until the device accepts it.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use minergy::controller::{DecisionStore, Executor};
use minergy::domain::{ControlDecision, PlantInfo, SystemConfig, TimeSlot};
use minergy::hardware::{InverterClient, RemoteEmsMode};
use minergy::optimizer::optimise;

#[derive(Debug, Clone, PartialEq)]
enum InverterWrite {
    Mode(u16),
    ChargeLimit(f64),
    DischargeLimit(f64),
}

/// Inverter double that refuses the first `fail_remaining` writes.
#[derive(Default)]
struct ScriptedInverter {
    fail_remaining: Mutex<usize>,
    writes: Mutex<Vec<InverterWrite>>,
}

impl ScriptedInverter {
    fn failing(count: usize) -> Arc<Self> {
        let inverter = Self::default();
        *inverter.fail_remaining.lock().unwrap() = count;
        Arc::new(inverter)
    }

    fn record(&self, write: InverterWrite) -> Result<()> {
        let mut remaining = self.fail_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            anyhow::bail!("setting refused");
        }
        self.writes.lock().unwrap().push(write);
        Ok(())
    }

    fn writes(&self) -> Vec<InverterWrite> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl InverterClient for ScriptedInverter {
    async fn read_plant_running_info(&self) -> Result<PlantInfo> {
        Ok(PlantInfo::default())
    }

    async fn enable_remote_ems(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    async fn set_remote_ems_mode(&self, mode: RemoteEmsMode) -> Result<()> {
        self.record(InverterWrite::Mode(mode.register_value()))
    }

    async fn set_ess_max_charging_limit(&self, kw: f64) -> Result<()> {
        self.record(InverterWrite::ChargeLimit(kw))
    }

    async fn set_ess_max_discharging_limit(&self, kw: f64) -> Result<()> {
        self.record(InverterWrite::DischargeLimit(kw))
    }
}

fn decision(timestamp: DateTime<Utc>, charge: f64, discharge: f64) -> ControlDecision {
    ControlDecision {
        hour: 0,
        timestamp,
        battery_charge: charge,
        battery_discharge: discharge,
        grid_import: 0.0,
        grid_export: 0.0,
        battery_soc: 0.5,
        profit: 0.0,
        import_price: 0.25,
        export_price: 0.08,
        solar_forecast: 0.0,
        load_forecast: 0.0,
        cloud_coverage: 0.0,
        weather_symbol: String::new(),
    }
}

#[tokio::test]
async fn a_failed_apply_is_retried_and_then_suppressed() {
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let t1 = t0 + Duration::hours(1);

    // The first write of the first apply attempt is refused.
    let inverter = ScriptedInverter::failing(1);
    let store = Arc::new(DecisionStore::new(None));
    let executor = Executor::new(inverter.clone(), store.clone(), false);

    store
        .save(vec![decision(t0, 3.0, 0.0), decision(t1, 0.0, 2.0)])
        .await
        .unwrap();

    // First minute tick: the apply fails, the marker stays cleared.
    let now = t0 + Duration::minutes(1);
    assert!(executor.tick(now).await.is_err());
    assert!(store.executed().await.is_none());
    assert!(inverter.writes().is_empty());

    // One minute later the same decision is retried, not skipped.
    executor.tick(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(
        store.executed().await.map(|d| d.timestamp),
        Some(t0),
        "executed marker should now cover the first slot"
    );
    assert_eq!(
        inverter.writes(),
        vec![
            InverterWrite::Mode(4),
            InverterWrite::ChargeLimit(3.0),
            InverterWrite::DischargeLimit(0.0),
        ]
    );

    // Further ticks inside the same window apply nothing new.
    executor.tick(now + Duration::minutes(3)).await.unwrap();
    assert_eq!(inverter.writes().len(), 3);

    // Crossing into the next slot applies the next decision.
    executor.tick(t1 + Duration::minutes(1)).await.unwrap();
    let writes = inverter.writes();
    assert_eq!(
        writes[3..].to_vec(),
        vec![
            InverterWrite::Mode(6),
            InverterWrite::ChargeLimit(0.0),
            InverterWrite::DischargeLimit(2.0),
        ]
    );
}

#[tokio::test]
async fn an_optimised_trajectory_drives_the_inverter() {
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let slot = |hour: u32, import: f64, export: f64| TimeSlot {
        hour,
        timestamp: t0 + Duration::hours(hour as i64),
        import_price: import,
        export_price: export,
        solar_forecast: 0.0,
        load_forecast: 0.5,
        cloud_coverage: 0.0,
        weather_symbol: String::new(),
    };
    let config = SystemConfig {
        battery_capacity_kwh: 10.0,
        max_charge_kw: 5.0,
        max_discharge_kw: 5.0,
        min_soc: 0.1,
        max_soc: 1.0,
        efficiency: 0.9,
        degradation_cost_per_kwh: 0.01,
        max_grid_import_kw: 11.0,
        max_grid_export_kw: 11.0,
    };

    // Cheap hour followed by an expensive one: charge then discharge.
    let decisions = optimise(&[slot(0, 0.05, 0.02), slot(1, 0.40, 0.25)], 0.2, &config);
    assert_eq!(decisions.len(), 2);
    assert!(decisions[0].battery_charge > 0.0);
    assert!(decisions[1].battery_discharge > 0.0);

    let inverter = Arc::new(ScriptedInverter::default());
    let store = Arc::new(DecisionStore::new(None));
    let executor = Executor::new(inverter.clone(), store.clone(), false);

    store.save(decisions.clone()).await.unwrap();
    executor.apply_first().await.unwrap();

    assert_eq!(
        inverter.writes(),
        vec![
            InverterWrite::Mode(4),
            InverterWrite::ChargeLimit(decisions[0].battery_charge),
            InverterWrite::DischargeLimit(0.0),
        ]
    );

    // The optimisation-time apply marks the slot; the minute loop does not
    // re-apply it.
    executor.tick(t0 + Duration::minutes(5)).await.unwrap();
    assert_eq!(inverter.writes().len(), 3);
}
