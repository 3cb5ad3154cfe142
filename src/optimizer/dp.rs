//! Finite-horizon dynamic programming over a discretised state-of-charge
//! grid.
//!
//! State is `(slot, soc index)`; the action set per state is idle plus five
//! charge and five discharge levels. Grid flows follow from the power
//! balance; an action whose grid requirement exceeds a configured rail is
//! rejected rather than clamped, so every emitted decision balances.

use tracing::warn;

use crate::domain::{ControlDecision, SystemConfig, TimeSlot};

/// Number of equal SOC steps between `min_soc` and `max_soc`.
pub const SOC_STEPS: usize = 200;

/// Number of charge (and discharge) rate levels enumerated per state.
const RATE_LEVELS: usize = 5;

const FEASIBILITY_EPS: f64 = 1e-9;

/// Grid flows and slot profit implied by running `charge`/`discharge` kW
/// against one forecast slot, or `None` when a grid rail would be exceeded.
pub(crate) fn evaluate_action(
    slot: &TimeSlot,
    charge: f64,
    discharge: f64,
    config: &SystemConfig,
) -> Option<(f64, f64, f64)> {
    let net_supply = slot.solar_forecast + discharge * config.efficiency;
    let net_load = slot.load_forecast + charge / config.efficiency;

    let (grid_import, grid_export) = if net_supply >= net_load {
        let export = net_supply - net_load;
        if export > config.max_grid_export_kw + FEASIBILITY_EPS {
            return None;
        }
        (0.0, export.min(config.max_grid_export_kw))
    } else {
        let import = net_load - net_supply;
        if import > config.max_grid_import_kw + FEASIBILITY_EPS {
            return None;
        }
        (import.min(config.max_grid_import_kw), 0.0)
    };

    let profit = grid_export * slot.export_price - grid_import * slot.import_price
        - (charge + discharge) * config.degradation_cost_per_kwh;
    Some((grid_import, grid_export, profit))
}

struct SocGrid {
    min: f64,
    step: f64,
}

impl SocGrid {
    fn new(config: &SystemConfig) -> Self {
        Self {
            min: config.min_soc,
            step: (config.max_soc - config.min_soc) / SOC_STEPS as f64,
        }
    }

    fn index(&self, soc: f64) -> usize {
        if self.step <= 0.0 {
            return 0;
        }
        let i = ((soc - self.min) / self.step).round();
        (i.max(0.0) as usize).min(SOC_STEPS)
    }

    fn soc(&self, index: usize) -> f64 {
        self.min + index as f64 * self.step
    }
}

struct Step {
    prev_index: usize,
    decision: ControlDecision,
}

/// Optimise a control trajectory over `forecast`. Returns one decision per
/// slot; an empty forecast yields an empty trajectory. An initial SOC outside
/// the configured window is clamped and logged.
pub fn optimise(
    forecast: &[TimeSlot],
    initial_soc: f64,
    config: &SystemConfig,
) -> Vec<ControlDecision> {
    if forecast.is_empty() {
        return Vec::new();
    }

    let grid = SocGrid::new(config);
    let horizon = forecast.len();
    let states = SOC_STEPS + 1;

    let mut soc0 = initial_soc;
    if !(config.min_soc..=config.max_soc).contains(&soc0) {
        warn!(
            initial_soc,
            min_soc = config.min_soc,
            max_soc = config.max_soc,
            "initial SOC outside the configured window, clamping"
        );
        soc0 = soc0.clamp(config.min_soc, config.max_soc);
    }

    let mut value = vec![vec![f64::NEG_INFINITY; states]; horizon + 1];
    let mut prev: Vec<Vec<Option<Step>>> = (0..=horizon)
        .map(|_| (0..states).map(|_| None).collect())
        .collect();
    value[0][grid.index(soc0)] = 0.0;

    let mut actions = Vec::with_capacity(2 * RATE_LEVELS + 1);
    actions.push((0.0, 0.0));
    for k in 1..=RATE_LEVELS {
        actions.push((k as f64 * config.max_charge_kw / RATE_LEVELS as f64, 0.0));
    }
    for k in 1..=RATE_LEVELS {
        actions.push((0.0, k as f64 * config.max_discharge_kw / RATE_LEVELS as f64));
    }

    for (t, slot) in forecast.iter().enumerate() {
        for i in 0..states {
            let here = value[t][i];
            if !here.is_finite() {
                continue;
            }
            let soc = grid.soc(i);

            for &(charge, discharge) in &actions {
                let delta = (charge * config.efficiency - discharge) / config.battery_capacity_kwh;
                if charge > 0.0 && soc + delta > config.max_soc + FEASIBILITY_EPS {
                    continue;
                }
                if discharge > 0.0 && soc + delta < config.min_soc - FEASIBILITY_EPS {
                    continue;
                }
                let Some((grid_import, grid_export, profit)) =
                    evaluate_action(slot, charge, discharge, config)
                else {
                    continue;
                };

                let soc_after = (soc + delta).clamp(config.min_soc, config.max_soc);
                let j = grid.index(soc_after);
                let candidate = here + profit;
                if candidate > value[t + 1][j] {
                    value[t + 1][j] = candidate;
                    prev[t + 1][j] = Some(Step {
                        prev_index: i,
                        decision: ControlDecision {
                            hour: slot.hour,
                            timestamp: slot.timestamp,
                            battery_charge: charge,
                            battery_discharge: discharge,
                            grid_import,
                            grid_export,
                            battery_soc: soc_after,
                            profit,
                            import_price: slot.import_price,
                            export_price: slot.export_price,
                            solar_forecast: slot.solar_forecast,
                            load_forecast: slot.load_forecast,
                            cloud_coverage: slot.cloud_coverage,
                            weather_symbol: slot.weather_symbol.clone(),
                        },
                    });
                }
            }
        }
    }

    let Some((mut best, _)) = value[horizon]
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    else {
        warn!(horizon, "no feasible trajectory through the forecast");
        return Vec::new();
    };

    let mut decisions = Vec::with_capacity(horizon);
    for t in (1..=horizon).rev() {
        match prev[t][best].take() {
            Some(step) => {
                decisions.push(step.decision);
                best = step.prev_index;
            }
            None => {
                warn!(t, "trajectory backtrack failed");
                return Vec::new();
            }
        }
    }
    decisions.reverse();
    decisions
}
