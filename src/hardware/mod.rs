pub mod modbus;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::PlantInfo;

/// Remote-EMS operating mode written to the inverter. Idle is expressed as
/// charge mode with both rate limits at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEmsMode {
    Charge,
    Discharge,
}

impl RemoteEmsMode {
    pub fn register_value(self) -> u16 {
        match self {
            RemoteEmsMode::Charge => 4,
            RemoteEmsMode::Discharge => 6,
        }
    }
}

/// The four inverter operations the core uses. This is the seam tests mock.
#[async_trait]
pub trait InverterClient: Send + Sync {
    async fn read_plant_running_info(&self) -> Result<PlantInfo>;
    async fn enable_remote_ems(&self, enabled: bool) -> Result<()>;
    async fn set_remote_ems_mode(&self, mode: RemoteEmsMode) -> Result<()>;
    async fn set_ess_max_charging_limit(&self, kw: f64) -> Result<()>;
    async fn set_ess_max_discharging_limit(&self, kw: f64) -> Result<()>;
}
