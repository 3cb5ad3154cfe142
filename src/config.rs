use anyhow::{Context, Result};
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

use crate::domain::SystemConfig;

/// Log output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Operator configuration, loaded from a single JSON file with
/// `MINERGY__`-prefixed environment overrides. Durations are Go-style
/// strings ("10s", "15m", "1h").
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_config"))]
pub struct Config {
    /// Raw spot price above which miners are put to standby (EUR/MWh).
    pub price_limit: f64,

    /// CIDR the miner discovery scan covers, e.g. "192.168.1.0/24".
    #[validate(length(min = 1))]
    pub network: String,

    /// TCP port of the miner management API.
    #[serde(default = "default_miner_port")]
    pub miner_port: u16,

    #[serde(with = "humantime_serde", default = "default_check_price_interval")]
    pub check_price_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_state_check_interval")]
    pub miners_state_check_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_discovery_interval")]
    pub miner_discovery_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_pv_poll_interval")]
    pub pv_poll_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_pv_integration_period")]
    pub pv_integration_period: Duration,

    #[serde(with = "humantime_serde", default = "default_mpc_execution_interval")]
    pub mpc_execution_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_weather_update_interval")]
    pub weather_update_interval: Duration,

    /// Timeout applied to outbound HTTP calls.
    #[serde(with = "humantime_serde", default = "default_api_timeout")]
    pub api_timeout: Duration,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// 0 disables the HTTP health/status server.
    #[serde(default)]
    pub health_check_port: u16,

    /// Market-data API token.
    #[validate(length(min = 1))]
    pub security_token: String,

    /// Market-data URL template with `{token}`, `{start}` and `{end}`
    /// placeholders.
    #[validate(length(min = 1))]
    pub url_format: String,

    /// IANA timezone of the market area, e.g. "Europe/Prague".
    #[validate(length(min = 1))]
    pub location: String,

    /// host:port of the plant inverter's Modbus TCP endpoint.
    #[validate(length(min = 1))]
    pub plant_modbus_address: String,

    #[serde(default = "default_modbus_unit_id")]
    pub plant_modbus_unit_id: u8,

    /// Identifier written into every metrics row.
    #[validate(length(min = 1))]
    pub device_id: String,

    /// Empty string runs without a durable store.
    #[serde(default)]
    pub postgres_conn_string: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Battery parameters
    #[validate(range(min = 0.1, max = 1000.0))]
    pub battery_capacity: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub battery_max_charge: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub battery_max_discharge: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub battery_min_soc: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub battery_max_soc: f64,

    #[validate(range(min = 0.5, max = 1.0))]
    pub battery_efficiency: f64,

    /// EUR per kWh of battery throughput.
    #[validate(range(min = 0.0, max = 10.0))]
    pub battery_degradation_cost: f64,

    // Grid limits (kW)
    #[validate(range(min = 0.1, max = 1000.0))]
    pub max_grid_import: f64,

    #[validate(range(min = 0.0, max = 1000.0))]
    pub max_grid_export: f64,

    // Fee constants (EUR/MWh, applied on top of the raw spot price)
    #[serde(default)]
    pub import_operator_fee: f64,

    #[serde(default)]
    pub import_delivery_fee: f64,

    #[serde(default)]
    pub export_operator_fee: f64,

    // Miner draw per mode (W)
    #[validate(range(min = 0.0))]
    pub miner_eco_power: f64,

    #[validate(range(min = 0.0))]
    pub miner_standard_power: f64,

    #[validate(range(min = 0.0))]
    pub miner_super_power: f64,

    #[validate(range(min = 0.0))]
    pub miner_standby_power: f64,

    /// Aggregate miner draw ceiling (W).
    #[validate(range(min = 0.0))]
    pub miners_power_budget: f64,

    #[serde(default)]
    pub use_pv_power_control: bool,

    #[validate(range(min = 0.0, max = 100.0))]
    pub fanr_high_threshold: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub fanr_low_threshold: f64,

    /// Installed PV peak power (kW).
    #[validate(range(min = 0.0, max = 10000.0))]
    pub pv_peak_power: f64,

    /// Household base load added to the miner-derived load forecast (kW).
    #[serde(default = "default_base_load")]
    pub base_load: f64,

    #[serde(default = "default_mpc_horizon_hours")]
    #[validate(range(min = 1, max = 48))]
    pub mpc_horizon_hours: u32,
}

fn validate_config(config: &Config) -> Result<(), validator::ValidationError> {
    if config.battery_min_soc > config.battery_max_soc {
        return Err(validator::ValidationError::new(
            "battery_min_soc must not exceed battery_max_soc",
        ));
    }
    if config.fanr_low_threshold >= config.fanr_high_threshold {
        return Err(validator::ValidationError::new(
            "fanr_low_threshold must be below fanr_high_threshold",
        ));
    }
    if config.location.parse::<Tz>().is_err() {
        return Err(validator::ValidationError::new(
            "location is not a valid IANA timezone",
        ));
    }
    if !["debug", "info", "warn", "error"].contains(&config.log_level.as_str()) {
        return Err(validator::ValidationError::new(
            "log_level must be one of debug, info, warn, error",
        ));
    }
    Ok(())
}

fn default_miner_port() -> u16 { 4028 }
fn default_check_price_interval() -> Duration { Duration::from_secs(3600) }
fn default_state_check_interval() -> Duration { Duration::from_secs(60) }
fn default_discovery_interval() -> Duration { Duration::from_secs(600) }
fn default_pv_poll_interval() -> Duration { Duration::from_secs(10) }
fn default_pv_integration_period() -> Duration { Duration::from_secs(900) }
fn default_mpc_execution_interval() -> Duration { Duration::from_secs(60) }
fn default_weather_update_interval() -> Duration { Duration::from_secs(7200) }
fn default_api_timeout() -> Duration { Duration::from_secs(30) }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> LogFormat { LogFormat::Text }
fn default_modbus_unit_id() -> u8 { 1 }
fn default_user_agent() -> String { format!("minergy/{}", env!("CARGO_PKG_VERSION")) }
fn default_base_load() -> f64 { 0.3 }
fn default_mpc_horizon_hours() -> u32 { 36 }

impl Config {
    /// Load and validate the configuration from `path`, with
    /// `MINERGY__SECTION__KEY`-style environment overrides applied on top.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("MINERGY__").split("__"))
            .extract()
            .with_context(|| format!("failed to parse configuration {}", path.display()))?;

        config
            .validate()
            .context("configuration validation failed")?;

        Ok(config)
    }

    pub fn timezone(&self) -> Tz {
        // Checked during validation.
        self.location.parse().unwrap_or(chrono_tz::UTC)
    }

    /// Physical parameters handed to the optimiser, immutable per run.
    pub fn system_config(&self) -> SystemConfig {
        SystemConfig {
            battery_capacity_kwh: self.battery_capacity,
            max_charge_kw: self.battery_max_charge,
            max_discharge_kw: self.battery_max_discharge,
            min_soc: self.battery_min_soc,
            max_soc: self.battery_max_soc,
            efficiency: self.battery_efficiency,
            degradation_cost_per_kwh: self.battery_degradation_cost,
            max_grid_import_kw: self.max_grid_import,
            max_grid_export_kw: self.max_grid_export,
        }
    }

}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    serde_json::from_value(serde_json::json!({
        "price_limit": 60.0,
        "network": "192.168.1.0/28",
        "check_price_interval": "1h",
        "miners_state_check_interval": "1m",
        "miner_discovery_interval": "10m",
        "pv_poll_interval": "10s",
        "pv_integration_period": "15m",
        "mpc_execution_interval": "1m",
        "security_token": "test-token",
        "url_format": "https://market.invalid/api?securityToken={token}&periodStart={start}&periodEnd={end}",
        "location": "Europe/Prague",
        "plant_modbus_address": "127.0.0.1:502",
        "device_id": "plant-1",
        "latitude": 50.08,
        "longitude": 14.43,
        "battery_capacity": 10.0,
        "battery_max_charge": 5.0,
        "battery_max_discharge": 5.0,
        "battery_min_soc": 0.1,
        "battery_max_soc": 0.95,
        "battery_efficiency": 0.9,
        "battery_degradation_cost": 0.01,
        "max_grid_import": 11.0,
        "max_grid_export": 11.0,
        "import_operator_fee": 10.0,
        "import_delivery_fee": 15.0,
        "export_operator_fee": 5.0,
        "miner_eco_power": 1500.0,
        "miner_standard_power": 2500.0,
        "miner_super_power": 3400.0,
        "miner_standby_power": 40.0,
        "miners_power_budget": 7000.0,
        "use_pv_power_control": true,
        "fanr_high_threshold": 85.0,
        "fanr_low_threshold": 60.0,
        "pv_peak_power": 9.9
    }))
    .expect("test config is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_from_go_style_strings() {
        let cfg = test_config();
        assert_eq!(cfg.check_price_interval, Duration::from_secs(3600));
        assert_eq!(cfg.pv_poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.pv_integration_period, Duration::from_secs(900));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_fill_unset_options() {
        let cfg = test_config();
        assert_eq!(cfg.miner_port, 4028);
        assert_eq!(cfg.health_check_port, 0);
        assert_eq!(cfg.mpc_horizon_hours, 36);
        assert_eq!(cfg.api_timeout, Duration::from_secs(30));
        assert!(!cfg.dry_run);
    }

    #[test]
    fn soc_window_must_be_ordered() {
        let mut cfg = test_config();
        cfg.battery_min_soc = 0.9;
        cfg.battery_max_soc = 0.2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fan_thresholds_must_be_ordered() {
        let mut cfg = test_config();
        cfg.fanr_low_threshold = 90.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timezone_must_be_valid() {
        let mut cfg = test_config();
        cfg.location = "Mars/Olympus".to_string();
        assert!(cfg.validate().is_err());
        cfg.location = "Europe/Prague".to_string();
        assert_eq!(cfg.timezone(), chrono_tz::Europe::Prague);
    }

    #[test]
    fn log_level_is_restricted() {
        let mut cfg = test_config();
        cfg.log_level = "trace".to_string();
        assert!(cfg.validate().is_err());
    }
}
