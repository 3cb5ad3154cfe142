use std::collections::VecDeque;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Number of fan-speed samples kept per miner for the step-up hysteresis.
pub const FAN_HISTORY_LEN: usize = 5;

/// Last-observed operating state of a miner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MinerState {
    Mining,
    #[strum(serialize = "standby")]
    #[serde(rename = "standby")]
    StandBy,
    Other,
}

/// Discrete miner power modes with increasing consumption.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    Eco,
    Standard,
    Super,
}

impl WorkMode {
    /// Next mode up, or `None` at Super.
    pub fn step_up(self) -> Option<WorkMode> {
        match self {
            WorkMode::Eco => Some(WorkMode::Standard),
            WorkMode::Standard => Some(WorkMode::Super),
            WorkMode::Super => None,
        }
    }

    /// Next mode down, or `None` at Eco.
    pub fn step_down(self) -> Option<WorkMode> {
        match self {
            WorkMode::Super => Some(WorkMode::Standard),
            WorkMode::Standard => Some(WorkMode::Eco),
            WorkMode::Eco => None,
        }
    }
}

/// Status answer from a miner's management API.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerStatus {
    pub state: MinerState,
    pub work_mode: WorkMode,
    pub fan_r: f64,
    pub board_temp_c: f64,
    pub chip_temp_c: f64,
}

/// A discovered miner and its last-observed state.
///
/// Created on discovery, updated in place under the fleet mutex, never
/// removed while the process runs.
#[derive(Debug, Clone)]
pub struct MinerHost {
    pub addr: SocketAddr,
    pub state: MinerState,
    pub work_mode: WorkMode,
    /// Fan speed percentage from the last status query.
    pub fan_r: f64,
    pub board_temp_c: f64,
    pub chip_temp_c: f64,
    pub last_seen: DateTime<Utc>,
    fan_history: VecDeque<f64>,
}

impl MinerHost {
    pub fn new(addr: SocketAddr, status: &MinerStatus, now: DateTime<Utc>) -> Self {
        let mut host = Self {
            addr,
            state: status.state,
            work_mode: status.work_mode,
            fan_r: status.fan_r,
            board_temp_c: status.board_temp_c,
            chip_temp_c: status.chip_temp_c,
            last_seen: now,
            fan_history: VecDeque::with_capacity(FAN_HISTORY_LEN),
        };
        host.fan_history.push_back(status.fan_r);
        host
    }

    /// Record a fresh status observation, keeping the bounded fan history.
    pub fn observe(&mut self, status: &MinerStatus, now: DateTime<Utc>) {
        self.state = status.state;
        self.work_mode = status.work_mode;
        self.fan_r = status.fan_r;
        self.board_temp_c = status.board_temp_c;
        self.chip_temp_c = status.chip_temp_c;
        self.last_seen = now;
        if self.fan_history.len() == FAN_HISTORY_LEN {
            self.fan_history.pop_front();
        }
        self.fan_history.push_back(status.fan_r);
    }

    /// True when the history is full and every sample is below `threshold`.
    pub fn fan_consistently_below(&self, threshold: f64) -> bool {
        self.fan_history.len() == FAN_HISTORY_LEN
            && self.fan_history.iter().all(|&r| r < threshold)
    }

    pub fn fan_history(&self) -> impl Iterator<Item = &f64> {
        self.fan_history.iter()
    }
}
