use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::store::DecisionStore;
use crate::domain::ControlDecision;
use crate::hardware::{InverterClient, RemoteEmsMode};

/// Below this the rail is treated as zero (idle).
const POWER_EPS: f64 = 1e-6;

/// Applies trajectory steps to the inverter.
///
/// Triggered twice: right after a successful optimisation for the first
/// decision, and every execution tick for whichever decision covers `now`.
/// A failed apply leaves the executed marker unset so the next tick retries.
pub struct Executor {
    inverter: Arc<dyn InverterClient>,
    store: Arc<DecisionStore>,
    dry_run: bool,
}

impl Executor {
    pub fn new(inverter: Arc<dyn InverterClient>, store: Arc<DecisionStore>, dry_run: bool) -> Self {
        Self {
            inverter,
            store,
            dry_run,
        }
    }

    /// Translate one decision into the three inverter writes: remote-EMS
    /// mode, max charge rate, max discharge rate. Idle means charge mode with
    /// both limits at zero.
    pub async fn apply(&self, decision: &ControlDecision) -> Result<()> {
        let (mode, charge_kw, discharge_kw) = if decision.battery_discharge > POWER_EPS {
            (RemoteEmsMode::Discharge, 0.0, decision.battery_discharge)
        } else if decision.battery_charge > POWER_EPS {
            (RemoteEmsMode::Charge, decision.battery_charge, 0.0)
        } else {
            (RemoteEmsMode::Charge, 0.0, 0.0)
        };

        if self.dry_run {
            info!(
                timestamp = %decision.timestamp,
                ?mode,
                charge_kw,
                discharge_kw,
                "dry run: would apply decision"
            );
            return Ok(());
        }

        self.inverter
            .set_remote_ems_mode(mode)
            .await
            .context("setting remote EMS mode failed")?;
        self.inverter
            .set_ess_max_charging_limit(charge_kw)
            .await
            .context("setting max charging limit failed")?;
        self.inverter
            .set_ess_max_discharging_limit(discharge_kw)
            .await
            .context("setting max discharging limit failed")?;

        info!(
            timestamp = %decision.timestamp,
            ?mode,
            charge_kw,
            discharge_kw,
            soc_target = decision.battery_soc,
            "decision applied"
        );
        Ok(())
    }

    /// Apply the first decision of a freshly saved trajectory.
    pub async fn apply_first(&self) -> Result<()> {
        let Some(first) = self.store.first().await else {
            return Ok(());
        };
        match self.apply(&first).await {
            Ok(()) => {
                self.store.mark_executed(first).await;
                Ok(())
            }
            Err(err) => {
                self.store.clear_executed().await;
                Err(err)
            }
        }
    }

    /// Execution tick: apply the decision covering `now` unless it is already
    /// the executed marker.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(current) = self.store.current_for(now).await else {
            return Ok(());
        };
        if self.store.is_executed(&current).await {
            return Ok(());
        }
        match self.apply(&current).await {
            Ok(()) => {
                self.store.mark_executed(current).await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, timestamp = %current.timestamp, "apply failed, will retry");
                self.store.clear_executed().await;
                Err(err)
            }
        }
    }
}
