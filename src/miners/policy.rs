//! Miner control policy.
//!
//! Two loops share the fleet and the running-power total: the price-based
//! loop wakes or parks whole miners on the current hour price, and the
//! faster state-check loop walks work modes up and down on fan-speed
//! hysteresis and the aggregate power budget. All transitions reserve or
//! release draw in the shared total under its mutex; remote calls happen
//! outside any lock, and one unreachable miner never aborts the batch.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::client::{MinerClientError, MinerControl};
use super::MinerFleet;
use crate::config::Config;
use crate::domain::{MinerHost, MinerState, WorkMode};

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// EUR/MWh raw spot above which miners are parked.
    pub price_limit: f64,
    pub use_pv_power_control: bool,
    pub miners_power_budget_w: f64,
    pub eco_power_w: f64,
    pub standard_power_w: f64,
    pub super_power_w: f64,
    pub standby_power_w: f64,
    pub fanr_high: f64,
    pub fanr_low: f64,
    pub dry_run: bool,
}

impl PolicyConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            price_limit: cfg.price_limit,
            use_pv_power_control: cfg.use_pv_power_control,
            miners_power_budget_w: cfg.miners_power_budget,
            eco_power_w: cfg.miner_eco_power,
            standard_power_w: cfg.miner_standard_power,
            super_power_w: cfg.miner_super_power,
            standby_power_w: cfg.miner_standby_power,
            fanr_high: cfg.fanr_high_threshold,
            fanr_low: cfg.fanr_low_threshold,
            dry_run: cfg.dry_run,
        }
    }

    fn mode_power_w(&self, mode: WorkMode) -> f64 {
        match mode {
            WorkMode::Eco => self.eco_power_w,
            WorkMode::Standard => self.standard_power_w,
            WorkMode::Super => self.super_power_w,
        }
    }

    /// Draw attributed to a host in the running total.
    fn draw_w(&self, host: &MinerHost) -> f64 {
        match host.state {
            MinerState::Mining => self.mode_power_w(host.work_mode),
            MinerState::StandBy | MinerState::Other => self.standby_power_w,
        }
    }
}

pub struct MinerPolicy {
    fleet: Arc<MinerFleet>,
    control: Arc<dyn MinerControl>,
    cfg: PolicyConfig,
}

impl MinerPolicy {
    pub fn new(fleet: Arc<MinerFleet>, control: Arc<dyn MinerControl>, cfg: PolicyConfig) -> Self {
        Self {
            fleet,
            control,
            cfg,
        }
    }

    /// Price-based loop body. `price` is the current hour-average raw spot;
    /// without one the tick is a no-op. With PV control enabled the
    /// aggregate draw is bounded by `min(current PV, miners_power_budget)`.
    pub async fn run_price_check(&self, price: Option<f64>, current_pv_kw: f64) -> Result<()> {
        let Some(price) = price else {
            warn!("no current hour price, skipping miner price check");
            return Ok(());
        };
        let budget_w = if self.cfg.use_pv_power_control {
            Some((current_pv_kw * 1000.0).min(self.cfg.miners_power_budget_w))
        } else {
            None
        };

        let hosts = self.fleet.snapshot().await;
        let mut tasks = Vec::with_capacity(hosts.len());
        for host in hosts {
            let fleet = self.fleet.clone();
            let control = self.control.clone();
            let cfg = self.cfg.clone();
            tasks.push(tokio::spawn(async move {
                let addr = host.addr;
                (addr, price_check_miner(fleet, control, cfg, host, price, budget_w).await)
            }));
        }

        let mut failures = 0usize;
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((addr, Err(err))) => {
                    warn!(%addr, error = %err, "price transition failed");
                    failures += 1;
                }
                Ok((_, Ok(()))) => {}
                Err(err) => {
                    warn!(error = %err, "price transition task panicked");
                    failures += 1;
                }
            }
        }
        anyhow::ensure!(failures == 0, "{failures} miner price transitions failed");
        Ok(())
    }

    /// State-check loop body: refresh every miner's status, rebase the
    /// running total on the observations, then apply fan/budget hysteresis
    /// to each mining host.
    pub async fn run_state_check(&self) -> Result<()> {
        let hosts = self.fleet.snapshot().await;
        let mut tasks = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let control = self.control.clone();
            let addr = host.addr;
            tasks.push(tokio::spawn(async move {
                (addr, control.status(addr).await)
            }));
        }

        let now = chrono::Utc::now();
        let mut failures = 0usize;
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((addr, Ok(status))) => {
                    self.fleet.update(addr, |h| h.observe(&status, now)).await;
                }
                Ok((addr, Err(err))) => {
                    warn!(%addr, error = %err, "miner status refresh failed");
                    failures += 1;
                }
                Err(err) => {
                    warn!(error = %err, "status task panicked");
                    failures += 1;
                }
            }
        }

        let hosts = self.fleet.snapshot().await;
        let total: f64 = hosts.iter().map(|h| self.cfg.draw_w(h)).sum();
        self.fleet.set_running_power_w(total).await;

        for host in hosts.iter().filter(|h| h.state == MinerState::Mining) {
            if let Err(err) = self.state_check_miner(host).await {
                warn!(addr = %host.addr, error = %err, "state transition failed");
                failures += 1;
            }
        }
        anyhow::ensure!(failures == 0, "{failures} miner state checks failed");
        Ok(())
    }

    async fn state_check_miner(&self, host: &MinerHost) -> Result<(), MinerClientError> {
        let cfg = &self.cfg;
        let addr = host.addr;
        let total = self.fleet.running_power_w().await;
        let over_budget = total > cfg.miners_power_budget_w;

        if host.fan_r > cfg.fanr_high || over_budget {
            match host.work_mode.step_down() {
                Some(down) => {
                    if cfg.dry_run {
                        info!(%addr, from = %host.work_mode, to = %down, "dry run: would step miner down");
                        return Ok(());
                    }
                    self.control.set_work_mode(addr, down).await?;
                    let delta = cfg.mode_power_w(down) - cfg.mode_power_w(host.work_mode);
                    self.fleet.add_power_w(delta).await;
                    self.fleet.update(addr, |h| h.work_mode = down).await;
                    info!(
                        %addr,
                        fan_r = host.fan_r,
                        over_budget,
                        to = %down,
                        "stepped miner down"
                    );
                }
                None => {
                    if cfg.dry_run {
                        info!(%addr, "dry run: would send eco miner to standby");
                        return Ok(());
                    }
                    self.control.standby(addr).await?;
                    let delta = cfg.standby_power_w - cfg.mode_power_w(host.work_mode);
                    self.fleet.add_power_w(delta).await;
                    self.fleet.update(addr, |h| h.state = MinerState::StandBy).await;
                    info!(
                        %addr,
                        fan_r = host.fan_r,
                        over_budget,
                        "eco miner still over limits, sent to standby"
                    );
                }
            }
        } else if host.fan_r < cfg.fanr_low
            && host.fan_consistently_below(cfg.fanr_low)
            && host.work_mode != WorkMode::Super
        {
            let Some(up) = host.work_mode.step_up() else {
                return Ok(());
            };
            let delta = cfg.mode_power_w(up) - cfg.mode_power_w(host.work_mode);
            if !self
                .fleet
                .try_reserve_w(delta, Some(cfg.miners_power_budget_w))
                .await
            {
                debug!(%addr, to = %up, "no power headroom to step miner up");
                return Ok(());
            }
            if cfg.dry_run {
                info!(%addr, from = %host.work_mode, to = %up, "dry run: would step miner up");
                self.fleet.add_power_w(-delta).await;
                return Ok(());
            }
            match self.control.set_work_mode(addr, up).await {
                Ok(()) => {
                    self.fleet.update(addr, |h| h.work_mode = up).await;
                    info!(%addr, fan_r = host.fan_r, to = %up, "stepped miner up");
                }
                Err(err) => {
                    self.fleet.add_power_w(-delta).await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

async fn price_check_miner(
    fleet: Arc<MinerFleet>,
    control: Arc<dyn MinerControl>,
    cfg: PolicyConfig,
    host: MinerHost,
    price: f64,
    budget_w: Option<f64>,
) -> Result<(), MinerClientError> {
    let addr = host.addr;
    let below_limit = price <= cfg.price_limit;

    if below_limit && host.state == MinerState::StandBy {
        // Waking replaces the standby draw with eco draw in the total.
        let delta = cfg.eco_power_w - cfg.standby_power_w;
        if !fleet.try_reserve_w(delta, budget_w).await {
            debug!(%addr, price, "insufficient power budget, miner stays in standby");
            return Ok(());
        }
        if cfg.dry_run {
            info!(%addr, price, "dry run: would wake miner to eco");
            fleet.add_power_w(-delta).await;
            return Ok(());
        }
        let result = async {
            control.wake(addr).await?;
            control.set_work_mode(addr, WorkMode::Eco).await
        }
        .await;
        match result {
            Ok(()) => {
                fleet
                    .update(addr, |h| {
                        h.state = MinerState::Mining;
                        h.work_mode = WorkMode::Eco;
                    })
                    .await;
                info!(%addr, price, "price below limit, miner woken to eco");
                Ok(())
            }
            Err(err) => {
                fleet.add_power_w(-delta).await;
                Err(err)
            }
        }
    } else if !below_limit && host.state != MinerState::StandBy {
        if cfg.dry_run {
            info!(%addr, price, "dry run: would send miner to standby");
            return Ok(());
        }
        control.standby(addr).await?;
        let delta = cfg.standby_power_w - cfg.draw_w(&host);
        fleet.add_power_w(delta).await;
        fleet.update(addr, |h| h.state = MinerState::StandBy).await;
        info!(%addr, price, "price above limit, miner sent to standby");
        Ok(())
    } else {
        Ok(())
    }
}
