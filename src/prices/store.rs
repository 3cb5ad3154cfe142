use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::document::{cache_expiry_after, PriceDocument};
use super::entsoe::{MarketPriceClient, PriceError};

/// Cached day-ahead prices behind an `RwLock`: readers take a shared lock on
/// the current document, the refresher swaps the pointer atomically.
pub struct PriceStore {
    client: MarketPriceClient,
    tz: Tz,
    document: RwLock<Option<Arc<PriceDocument>>>,
}

impl PriceStore {
    pub fn new(client: MarketPriceClient, tz: Tz) -> Self {
        Self {
            client,
            tz,
            document: RwLock::new(None),
        }
    }

    pub async fn document(&self) -> Option<Arc<PriceDocument>> {
        self.document.read().await.clone()
    }

    /// Re-fetch when the cached document is absent or past its 13:00-local
    /// expiry. After 13:00 local the next day is fetched too and merged; a
    /// failed next-day fetch fails the whole refresh so the prior snapshot
    /// stays in place for the retry.
    pub async fn refresh_if_stale(&self, now: DateTime<Utc>) -> Result<bool, PriceError> {
        {
            let guard = self.document.read().await;
            if let Some(doc) = guard.as_ref() {
                if !doc.is_expired(now) {
                    return Ok(false);
                }
            }
        }

        let local_now = now.with_timezone(&self.tz);
        let today = local_now.date_naive();
        let (start, end, series) = self.client.fetch_day(today).await?;
        let mut doc = PriceDocument {
            interval_start: start,
            interval_end: end,
            series,
            cache_expiry: cache_expiry_after(now, self.tz),
        };

        if local_now.hour() >= 13 {
            if let Some(tomorrow) = today.succ_opt() {
                let (start2, end2, series2) = self.client.fetch_day(tomorrow).await?;
                let cache_expiry = doc.cache_expiry;
                doc = doc.merged(PriceDocument {
                    interval_start: start2,
                    interval_end: end2,
                    series: series2,
                    cache_expiry,
                });
                debug!(%tomorrow, "merged next-day prices");
            }
        }

        info!(
            interval_start = %doc.interval_start,
            interval_end = %doc.interval_end,
            series = doc.series.len(),
            expires = %doc.cache_expiry,
            "day-ahead prices refreshed"
        );
        *self.document.write().await = Some(Arc::new(doc));
        Ok(true)
    }

    /// Hour-average raw spot price (EUR/MWh) for the hour starting at
    /// `hour_start`.
    pub async fn hour_avg(&self, hour_start: DateTime<Utc>) -> Option<f64> {
        let doc = self.document().await?;
        doc.hour_avg(hour_start)
    }

    /// Hour-average for the wall-clock hour containing `now`.
    pub async fn current_hour_avg(&self, now: DateTime<Utc>) -> Option<f64> {
        self.hour_avg(truncate_to_hour(now)).await
    }
}

/// Top of the wall-clock hour containing `t`.
pub fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}
