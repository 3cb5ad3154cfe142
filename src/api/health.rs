use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::controller::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<ComponentHealth>,
    controller: ComponentHealth,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            error: Some(error),
        }
    }
}

/// GET /health — overall health including database connectivity when a
/// durable store is wired.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => Some(match check_database(db).await {
            Ok(()) => ComponentHealth::healthy(),
            Err(err) => ComponentHealth::unhealthy(err.to_string()),
        }),
        None => None,
    };
    let controller = ComponentHealth::healthy();

    let all_healthy = database
        .as_ref()
        .map_or(true, |d| d.status == "healthy");
    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        checks: HealthChecks {
            database,
            controller,
        },
    };
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}

/// GET /health/ready — readiness probe.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.db {
        Some(db) => match check_database(db).await {
            Ok(()) => StatusCode::OK,
            Err(_) => StatusCode::SERVICE_UNAVAILABLE,
        },
        None => StatusCode::OK,
    }
}

/// GET /health/live — liveness probe.
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn check_database(db: &crate::repo::pg::PgRepo) -> anyhow::Result<()> {
    sqlx::query("SELECT 1").execute(&db.pool).await?;
    Ok(())
}
