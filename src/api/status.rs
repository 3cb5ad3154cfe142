use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::AppState;
use crate::domain::{ControlDecision, MetricSample};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    timestamp: DateTime<Utc>,
    dry_run: bool,
    trajectory_length: usize,
    current_decision: Option<ControlDecision>,
    executed_decision: Option<ControlDecision>,
    last_sample: Option<SampleSummary>,
    miners: Vec<MinerSummary>,
    running_miner_power_w: f64,
}

#[derive(Debug, Serialize)]
pub struct MinerSummary {
    address: String,
    state: String,
    work_mode: String,
    fan_r: f64,
    chip_temp_c: f64,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SampleSummary {
    timestamp: DateTime<Utc>,
    pv_power_kw: f64,
    grid_power_kw: f64,
    ess_power_kw: f64,
    ess_soc_percent: f64,
}

impl From<MetricSample> for SampleSummary {
    fn from(s: MetricSample) -> Self {
        Self {
            timestamp: s.timestamp,
            pv_power_kw: s.pv_power_kw,
            grid_power_kw: s.grid_power_kw,
            ess_power_kw: s.ess_power_kw,
            ess_soc_percent: s.ess_soc_percent,
        }
    }
}

/// GET /api/v1/status — read-only controller snapshot.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let now = Utc::now();
    let miners = state
        .fleet
        .snapshot()
        .await
        .into_iter()
        .map(|h| MinerSummary {
            address: h.addr.to_string(),
            state: h.state.to_string(),
            work_mode: h.work_mode.to_string(),
            fan_r: h.fan_r,
            chip_temp_c: h.chip_temp_c,
            last_seen: h.last_seen,
        })
        .collect();

    Json(StatusResponse {
        timestamp: now,
        dry_run: state.cfg.dry_run,
        trajectory_length: state.decisions.trajectory().await.len(),
        current_decision: state.decisions.current_for(now).await,
        executed_decision: state.decisions.executed().await,
        last_sample: state.integrator.last_sample().await.map(Into::into),
        miners,
        running_miner_power_w: state.fleet.running_power_w().await,
    })
}
