pub mod executor;
pub mod store;

pub use executor::Executor;
pub use store::DecisionStore;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::forecast::{ForecastBuilder, WeatherClient};
use crate::hardware::modbus::PlantModbusClient;
use crate::hardware::InverterClient;
use crate::metrics::MetricsIntegrator;
use crate::miners::policy::PolicyConfig;
use crate::miners::{MinerControl, MinerDiscovery, MinerFleet, MinerPolicy, TcpMinerClient};
use crate::optimizer::optimise;
use crate::prices::{MarketPriceClient, PriceStore};
use crate::repo::pg::PgRepo;
use crate::repo::Repositories;
use crate::scheduler::{align_to_hour, PeriodicScheduler, PeriodicTask};

/// Everything the control loops and the web surface share. The scheduler
/// owns the loops; components only see `Arc`s of the narrow pieces they
/// need.
pub struct AppState {
    pub cfg: Config,
    pub inverter: Arc<dyn InverterClient>,
    pub prices: Arc<PriceStore>,
    pub weather: Arc<WeatherClient>,
    pub forecast: Arc<ForecastBuilder>,
    pub decisions: Arc<DecisionStore>,
    pub executor: Arc<Executor>,
    pub fleet: Arc<MinerFleet>,
    pub policy: Arc<MinerPolicy>,
    pub discovery: Arc<MinerDiscovery>,
    pub integrator: Arc<MetricsIntegrator>,
    pub db: Option<Arc<PgRepo>>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let repos = Repositories::new(&cfg.postgres_conn_string)
            .await
            .context("durable store initialisation failed")?;
        let inverter: Arc<dyn InverterClient> = Arc::new(
            PlantModbusClient::connect(&cfg.plant_modbus_address, cfg.plant_modbus_unit_id)
                .await
                .context("inverter connection failed")?,
        );
        Self::with_inverter(cfg, inverter, repos.db)
    }

    /// Wiring without the Modbus connection; the seam integration tests use.
    pub fn with_inverter(
        cfg: Config,
        inverter: Arc<dyn InverterClient>,
        db: Option<Arc<PgRepo>>,
    ) -> Result<Self> {
        let tz = cfg.timezone();
        let market = MarketPriceClient::new(
            cfg.url_format.clone(),
            cfg.security_token.clone(),
            &cfg.user_agent,
            cfg.api_timeout,
            tz,
        )
        .context("market price client initialisation failed")?;
        let prices = Arc::new(PriceStore::new(market, tz));
        let weather = Arc::new(
            WeatherClient::new(
                cfg.latitude,
                cfg.longitude,
                &cfg.user_agent,
                cfg.api_timeout,
                cfg.weather_update_interval,
            )
            .context("weather client initialisation failed")?,
        );
        let forecast = Arc::new(ForecastBuilder::from_config(&cfg));
        let decisions = Arc::new(DecisionStore::new(db.clone()));
        let executor = Arc::new(Executor::new(
            inverter.clone(),
            decisions.clone(),
            cfg.dry_run,
        ));
        let fleet = Arc::new(MinerFleet::new());
        let control: Arc<dyn MinerControl> = Arc::new(TcpMinerClient::new(cfg.api_timeout));
        let policy = Arc::new(MinerPolicy::new(
            fleet.clone(),
            control.clone(),
            PolicyConfig::from_config(&cfg),
        ));
        let discovery = Arc::new(MinerDiscovery::new(
            fleet.clone(),
            control,
            cfg.network.clone(),
            cfg.miner_port,
        ));
        let integrator = Arc::new(MetricsIntegrator::new(
            &cfg,
            inverter.clone(),
            prices.clone(),
            weather.clone(),
            db.clone(),
        ));

        Ok(Self {
            cfg,
            inverter,
            prices,
            weather,
            forecast,
            decisions,
            executor,
            fleet,
            policy,
            discovery,
            integrator,
            db,
        })
    }
}

macro_rules! task_fn {
    ($state:ident, $body:expr) => {{
        let st = $state.clone();
        move || {
            let st = st.clone();
            Box::pin(async move { $body(&st).await }) as crate::scheduler::TaskFuture
        }
    }};
}

/// Enable remote control, resume the persisted trajectory and start the
/// seven control loops. The returned scheduler is cancelled and joined on
/// shutdown.
pub async fn start(state: Arc<AppState>) -> Result<PeriodicScheduler> {
    if state.cfg.dry_run {
        info!("dry run: would enable remote EMS control");
    } else {
        state
            .inverter
            .enable_remote_ems(true)
            .await
            .context("enabling remote EMS failed")?;
    }
    state
        .decisions
        .load_latest(Utc::now())
        .await
        .context("resuming the persisted trajectory failed")?;

    let cfg = &state.cfg;
    let now = Utc::now();
    let mut scheduler = PeriodicScheduler::new();

    scheduler.spawn(
        PeriodicTask::new(
            "price-check",
            align_to_hour(now, cfg.check_price_interval, Duration::from_secs(2)),
            cfg.check_price_interval,
            task_fn!(state, price_check_tick),
        )
        .with_retry(Duration::from_secs(60)),
    );

    scheduler.spawn(PeriodicTask::new(
        "miners-state-check",
        align_to_hour(now, cfg.miners_state_check_interval, Duration::ZERO),
        cfg.miners_state_check_interval,
        task_fn!(state, state_check_tick),
    ));

    scheduler.spawn(PeriodicTask::new(
        "miner-discovery",
        Duration::from_secs(5),
        cfg.miner_discovery_interval,
        task_fn!(state, discovery_tick),
    ));

    scheduler.spawn(PeriodicTask::new(
        "pv-sample",
        align_to_hour(now, cfg.pv_poll_interval, Duration::ZERO),
        cfg.pv_poll_interval,
        task_fn!(state, sample_tick),
    ));

    scheduler.spawn(
        PeriodicTask::new(
            "pv-integrate",
            align_to_hour(now, cfg.pv_integration_period, Duration::from_secs(2)),
            cfg.pv_integration_period,
            task_fn!(state, integrate_tick),
        )
        .with_retry(Duration::from_secs(60)),
    );

    scheduler.spawn(
        PeriodicTask::new(
            "mpc-optimize",
            align_to_hour(now, Duration::from_secs(3600), Duration::from_secs(1)),
            Duration::from_secs(3600),
            task_fn!(state, optimize_tick),
        )
        .with_retry(Duration::from_secs(120)),
    );

    scheduler.spawn(PeriodicTask::new(
        "mpc-execute",
        align_to_hour(now, cfg.mpc_execution_interval, Duration::ZERO),
        cfg.mpc_execution_interval,
        task_fn!(state, execute_tick),
    ));

    info!("control loops started");
    Ok(scheduler)
}

/// Refresh the price document and steer miners on the current hour price.
async fn price_check_tick(state: &Arc<AppState>) -> Result<()> {
    let now = Utc::now();
    state
        .prices
        .refresh_if_stale(now)
        .await
        .context("price refresh failed")?;
    let price = state.prices.current_hour_avg(now).await;
    let current_pv_kw = match state.inverter.read_plant_running_info().await {
        Ok(info) => info.pv_power_kw,
        Err(err) => {
            warn!(error = %err, "plant read failed, assuming zero PV for the miner budget");
            0.0
        }
    };
    state.policy.run_price_check(price, current_pv_kw).await
}

async fn state_check_tick(state: &Arc<AppState>) -> Result<()> {
    state.policy.run_state_check().await
}

async fn discovery_tick(state: &Arc<AppState>) -> Result<()> {
    state.discovery.scan().await.map(|_| ())
}

async fn sample_tick(state: &Arc<AppState>) -> Result<()> {
    state.integrator.sample_tick().await
}

async fn integrate_tick(state: &Arc<AppState>) -> Result<()> {
    state.integrator.integrate_tick(Utc::now()).await
}

/// Build the forecast, optimise, persist the trajectory and apply its first
/// step.
async fn optimize_tick(state: &Arc<AppState>) -> Result<()> {
    let now = Utc::now();
    state
        .prices
        .refresh_if_stale(now)
        .await
        .context("price refresh failed")?;

    let document = state.prices.document().await;
    let weather = match state.weather.forecast(now).await {
        Ok(points) => Some(points),
        Err(err) => {
            warn!(error = %err, "weather forecast unavailable");
            None
        }
    };
    let info = state
        .inverter
        .read_plant_running_info()
        .await
        .context("plant read failed")?;
    let fleet_size = state.fleet.len().await;

    let slots = state.forecast.build(
        now,
        document.as_deref(),
        weather.as_deref().map(|points| points.as_slice()),
        info.pv_power_kw,
        fleet_size,
    );
    anyhow::ensure!(!slots.is_empty(), "no forecast slots, skipping optimisation");

    let initial_soc = info.ess_soc_percent / 100.0;
    let decisions = optimise(&slots, initial_soc, &state.cfg.system_config());
    anyhow::ensure!(!decisions.is_empty(), "optimiser produced no trajectory");

    let horizon = decisions.len();
    let expected_profit: f64 = decisions.iter().map(|d| d.profit).sum();
    info!(
        horizon,
        initial_soc,
        expected_profit,
        "optimisation complete"
    );

    state.decisions.save(decisions).await?;
    if let Err(err) = state.executor.apply_first().await {
        warn!(error = %err, "applying the first decision failed, executor will retry");
    }
    Ok(())
}

async fn execute_tick(state: &Arc<AppState>) -> Result<()> {
    state.executor.tick(Utc::now()).await
}
