use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of the optimisation horizon.
///
/// Slots are hour-resolution, sorted and contiguous by `hour`; prices are
/// EUR/kWh after fee adjustment (export may be negative), forecasts are kW
/// averages over the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Index from 0 (now-aligned).
    pub hour: u32,
    /// Absolute instant at slot start.
    pub timestamp: DateTime<Utc>,
    pub import_price: f64,
    pub export_price: f64,
    pub solar_forecast: f64,
    pub load_forecast: f64,
    /// Cloud fraction in [0, 1], advisory.
    pub cloud_coverage: f64,
    /// Weather symbol code, advisory.
    pub weather_symbol: String,
}

/// Physical plant parameters, immutable during a single optimisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub battery_capacity_kwh: f64,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
    /// SOC window as fractions in [0, 1], `min <= max`.
    pub min_soc: f64,
    pub max_soc: f64,
    /// Round-trip efficiency in (0, 1].
    pub efficiency: f64,
    /// EUR per kWh of battery throughput.
    pub degradation_cost_per_kwh: f64,
    pub max_grid_import_kw: f64,
    pub max_grid_export_kw: f64,
}

/// One step of an optimal trajectory.
///
/// Charge/discharge and import/export are mutually exclusive pairs;
/// `battery_soc` is the state of charge at the *end* of the slot. The
/// forecast inputs the decision was computed against are echoed alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDecision {
    pub hour: u32,
    pub timestamp: DateTime<Utc>,
    pub battery_charge: f64,
    pub battery_discharge: f64,
    pub grid_import: f64,
    pub grid_export: f64,
    pub battery_soc: f64,
    /// EUR for this slot.
    pub profit: f64,
    pub import_price: f64,
    pub export_price: f64,
    pub solar_forecast: f64,
    pub load_forecast: f64,
    pub cloud_coverage: f64,
    pub weather_symbol: String,
}

impl ControlDecision {
    /// Window of wall-clock time this decision governs.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        now >= self.timestamp && now < self.timestamp + chrono::Duration::hours(1)
    }
}

/// Snapshot of plant telemetry read from the inverter.
///
/// Sign conventions: ESS power positive = charging, grid power positive =
/// import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantInfo {
    pub pv_power_kw: f64,
    pub ess_power_kw: f64,
    pub ess_soc_percent: f64,
    pub grid_power_kw: f64,
    pub plant_power_kw: f64,
    pub evdc_power_kw: f64,
    pub ev_soc_percent: f64,
}

/// Instantaneous plant reading with its wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub pv_power_kw: f64,
    pub grid_power_kw: f64,
    pub ess_power_kw: f64,
    pub evdc_power_kw: f64,
    pub ess_soc_percent: f64,
}

impl MetricSample {
    pub fn from_plant_info(info: &PlantInfo, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            pv_power_kw: info.pv_power_kw,
            grid_power_kw: info.grid_power_kw,
            ess_power_kw: info.ess_power_kw,
            evdc_power_kw: info.evdc_power_kw,
            ess_soc_percent: info.ess_soc_percent,
        }
    }
}

/// Per-period energy aggregates in kWh, derived from samples at or before
/// `timestamp` (the period cutoff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedData {
    pub timestamp: DateTime<Utc>,
    pub pv_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub battery_charge_kwh: f64,
    pub battery_discharge_kwh: f64,
    pub ev_charge_kwh: f64,
    /// PV + discharge + import - charge - export - EV.
    pub load_kwh: f64,
    pub last_soc_percent: f64,
    pub sample_count: usize,
    pub grid_import_cost: f64,
    pub grid_export_revenue: f64,
    pub cloud_coverage: Option<f64>,
    pub weather_symbol: Option<String>,
}
