pub mod decisions;
pub mod metrics;
pub mod pg;

use std::sync::Arc;

use anyhow::Result;

/// The durable store is runtime-optional: an empty connection string runs the
/// controller memory-only.
pub struct Repositories {
    pub db: Option<Arc<pg::PgRepo>>,
}

impl Repositories {
    pub async fn new(postgres_conn_string: &str) -> Result<Self> {
        if postgres_conn_string.is_empty() {
            return Ok(Self { db: None });
        }
        Ok(Self {
            db: Some(Arc::new(pg::PgRepo::connect(postgres_conn_string).await?)),
        })
    }
}
