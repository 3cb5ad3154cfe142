//! Modbus TCP implementation of the inverter seam.
//!
//! A single persistent connection is shared behind a mutex; create the client
//! once at startup and reuse it, reconnecting in place on failure.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use tokio::sync::Mutex;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;
use tracing::debug;

use super::{InverterClient, RemoteEmsMode};
use crate::domain::PlantInfo;

mod registers {
    /// i32, W
    pub const PV_POWER: u16 = 5016;
    /// i32, W, import positive
    pub const GRID_POWER: u16 = 13009;
    /// i32, W, charge positive
    pub const ESS_POWER: u16 = 13021;
    /// u16, 0.1 %
    pub const ESS_SOC: u16 = 13022;
    /// i32, W
    pub const PLANT_POWER: u16 = 13033;
    /// i32, W
    pub const EVDC_POWER: u16 = 13037;
    /// u16, 0.1 %
    pub const EV_SOC: u16 = 13039;
    /// u16, 0 = local, 1 = remote EMS
    pub const REMOTE_EMS_ENABLE: u16 = 13049;
    /// u16, mode selector
    pub const REMOTE_EMS_MODE: u16 = 13050;
    /// u16, 10 W units
    pub const ESS_MAX_CHARGE: u16 = 13051;
    /// u16, 10 W units
    pub const ESS_MAX_DISCHARGE: u16 = 13052;
}

pub struct ModbusClient {
    context: Arc<Mutex<tokio_modbus::client::Context>>,
    unit_id: u8,
}

impl ModbusClient {
    pub async fn connect(addr: &str, unit_id: u8) -> Result<Self> {
        let socket_addr = addr
            .parse()
            .with_context(|| format!("bad Modbus address {addr:?}"))?;
        let ctx = tcp::connect(socket_addr)
            .await
            .with_context(|| format!("Modbus connect to {addr} failed"))?;
        Ok(Self {
            context: Arc::new(Mutex::new(ctx)),
            unit_id,
        })
    }

    pub async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        Ok(ctx.read_holding_registers(start, count).await?)
    }

    pub async fn write_single_register(&self, register: u16, value: u16) -> Result<()> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        ctx.write_single_register(register, value).await?;
        Ok(())
    }
}

/// Decode two consecutive holding registers as a big-endian i32.
fn decode_i32(words: &[u16]) -> i32 {
    let mut bytes = [0u8; 4];
    BigEndian::write_u16(&mut bytes[0..2], words[0]);
    BigEndian::write_u16(&mut bytes[2..4], words[1]);
    BigEndian::read_i32(&bytes)
}

/// kW -> 10 W register units, clamped to the register range.
fn kw_to_register(kw: f64) -> u16 {
    let units = (kw.max(0.0) * 100.0).round();
    units.min(u16::MAX as f64) as u16
}

pub struct PlantModbusClient {
    client: ModbusClient,
}

impl PlantModbusClient {
    pub async fn connect(addr: &str, unit_id: u8) -> Result<Self> {
        Ok(Self {
            client: ModbusClient::connect(addr, unit_id).await?,
        })
    }

    async fn read_i32_watts(&self, register: u16) -> Result<f64> {
        let words = self.client.read_holding_registers(register, 2).await?;
        anyhow::ensure!(words.len() == 2, "short register read at {register}");
        Ok(decode_i32(&words) as f64 / 1000.0)
    }

    async fn read_soc_percent(&self, register: u16) -> Result<f64> {
        let words = self.client.read_holding_registers(register, 1).await?;
        anyhow::ensure!(!words.is_empty(), "short register read at {register}");
        Ok(words[0] as f64 / 10.0)
    }
}

#[async_trait]
impl InverterClient for PlantModbusClient {
    async fn read_plant_running_info(&self) -> Result<PlantInfo> {
        let pv_power_kw = self.read_i32_watts(registers::PV_POWER).await?;
        let grid_power_kw = self.read_i32_watts(registers::GRID_POWER).await?;
        let ess_power_kw = self.read_i32_watts(registers::ESS_POWER).await?;
        let plant_power_kw = self.read_i32_watts(registers::PLANT_POWER).await?;
        let evdc_power_kw = self.read_i32_watts(registers::EVDC_POWER).await?;
        let ess_soc_percent = self.read_soc_percent(registers::ESS_SOC).await?;
        let ev_soc_percent = self.read_soc_percent(registers::EV_SOC).await?;

        Ok(PlantInfo {
            pv_power_kw,
            ess_power_kw,
            ess_soc_percent,
            grid_power_kw,
            plant_power_kw,
            evdc_power_kw,
            ev_soc_percent,
        })
    }

    async fn enable_remote_ems(&self, enabled: bool) -> Result<()> {
        debug!(enabled, "writing remote EMS enable");
        self.client
            .write_single_register(registers::REMOTE_EMS_ENABLE, u16::from(enabled))
            .await
    }

    async fn set_remote_ems_mode(&self, mode: RemoteEmsMode) -> Result<()> {
        debug!(?mode, "writing remote EMS mode");
        self.client
            .write_single_register(registers::REMOTE_EMS_MODE, mode.register_value())
            .await
    }

    async fn set_ess_max_charging_limit(&self, kw: f64) -> Result<()> {
        debug!(kw, "writing max charging limit");
        self.client
            .write_single_register(registers::ESS_MAX_CHARGE, kw_to_register(kw))
            .await
    }

    async fn set_ess_max_discharging_limit(&self, kw: f64) -> Result<()> {
        debug!(kw, "writing max discharging limit");
        self.client
            .write_single_register(registers::ESS_MAX_DISCHARGE, kw_to_register(kw))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_decoding_handles_signed_values() {
        assert_eq!(decode_i32(&[0x0000, 0x1388]), 5000);
        // -5000 W as two big-endian words.
        assert_eq!(decode_i32(&[0xFFFF, 0xEC78]), -5000);
        assert_eq!(decode_i32(&[0x0000, 0x0000]), 0);
    }

    #[test]
    fn kw_conversion_rounds_and_clamps() {
        assert_eq!(kw_to_register(0.0), 0);
        assert_eq!(kw_to_register(5.0), 500);
        assert_eq!(kw_to_register(5.004), 500);
        assert_eq!(kw_to_register(-1.0), 0);
        assert_eq!(kw_to_register(10_000.0), u16::MAX);
    }

    #[test]
    fn ems_modes_map_to_their_register_values() {
        assert_eq!(RemoteEmsMode::Charge.register_value(), 4);
        assert_eq!(RemoteEmsMode::Discharge.register_value(), 6);
    }
}
