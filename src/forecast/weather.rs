use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

/// One forecast instant: cloud fraction in [0, 1] and a categorical symbol
/// code such as "partlycloudy_day" or "heavysnow".
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherPoint {
    pub time: DateTime<Utc>,
    pub cloud_fraction: f64,
    pub symbol: String,
}

/// True when the symbol code names any snow category.
pub fn symbol_has_snow(symbol: &str) -> bool {
    symbol.contains("snow") || symbol.contains("sleet")
}

/// Latest forecast point at or before `t`; falls back to the first point when
/// `t` precedes the series.
pub fn point_for(points: &[WeatherPoint], t: DateTime<Utc>) -> Option<&WeatherPoint> {
    points
        .iter()
        .take_while(|p| p.time <= t)
        .last()
        .or_else(|| points.first())
}

/// Location-forecast HTTP client with a TTL cache in front; the upstream asks
/// for a descriptive User-Agent and coarse polling, so forecasts are reused
/// for the configured interval (2 h by default).
pub struct WeatherClient {
    client: reqwest::Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
    ttl: Duration,
    cache: RwLock<Option<(DateTime<Utc>, Arc<Vec<WeatherPoint>>)>>,
}

impl WeatherClient {
    pub fn new(
        latitude: f64,
        longitude: f64,
        user_agent: &str,
        timeout: Duration,
        ttl: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("minergy")),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build weather HTTP client")?;
        Ok(Self {
            client,
            base_url: "https://api.met.no".to_string(),
            latitude,
            longitude,
            ttl,
            cache: RwLock::new(None),
        })
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Cached forecast series, refetched when older than the TTL.
    pub async fn forecast(&self, now: DateTime<Utc>) -> Result<Arc<Vec<WeatherPoint>>> {
        {
            let guard = self.cache.read().await;
            if let Some((fetched, points)) = guard.as_ref() {
                if (now - *fetched).to_std().unwrap_or_default() < self.ttl {
                    return Ok(points.clone());
                }
            }
        }

        let url = format!(
            "{}/weatherapi/locationforecast/2.0/compact?lat={:.4}&lon={:.4}",
            self.base_url, self.latitude, self.longitude
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("weather GET failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("weather API error: HTTP {status}");
        }
        let raw: LocationForecast = resp.json().await.context("weather JSON parse failed")?;

        let points: Vec<WeatherPoint> = raw
            .properties
            .timeseries
            .into_iter()
            .map(|step| {
                let symbol = step
                    .data
                    .next_1_hours
                    .or(step.data.next_6_hours)
                    .map(|n| n.summary.symbol_code)
                    .unwrap_or_default();
                WeatherPoint {
                    time: step.time,
                    cloud_fraction: (step.data.instant.details.cloud_area_fraction / 100.0)
                        .clamp(0.0, 1.0),
                    symbol,
                }
            })
            .collect();

        debug!(points = points.len(), "weather forecast refreshed");
        let points = Arc::new(points);
        *self.cache.write().await = Some((now, points.clone()));
        Ok(points)
    }
}

#[derive(Debug, Deserialize)]
struct LocationForecast {
    properties: ForecastProperties,
}

#[derive(Debug, Deserialize)]
struct ForecastProperties {
    timeseries: Vec<ForecastStep>,
}

#[derive(Debug, Deserialize)]
struct ForecastStep {
    time: DateTime<Utc>,
    data: ForecastData,
}

#[derive(Debug, Deserialize)]
struct ForecastData {
    instant: InstantBlock,
    #[serde(default)]
    next_1_hours: Option<NextHours>,
    #[serde(default)]
    next_6_hours: Option<NextHours>,
}

#[derive(Debug, Deserialize)]
struct InstantBlock {
    details: InstantDetails,
}

#[derive(Debug, Deserialize)]
struct InstantDetails {
    #[serde(default)]
    cloud_area_fraction: f64,
}

#[derive(Debug, Deserialize)]
struct NextHours {
    summary: NextSummary,
}

#[derive(Debug, Deserialize)]
struct NextSummary {
    symbol_code: String,
}
