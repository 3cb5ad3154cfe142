use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

use super::decisions::DecisionRepository;
use super::metrics::MetricsRepository;

pub struct PgRepo {
    pub pool: PgPool,
}

impl PgRepo {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("failed to open the Postgres pool")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("database migration failed")?;
        Ok(Self { pool })
    }

    pub fn decisions(&self) -> DecisionRepository<'_> {
        DecisionRepository::new(&self.pool)
    }

    pub fn metrics(&self) -> MetricsRepository<'_> {
        MetricsRepository::new(&self.pool)
    }
}
