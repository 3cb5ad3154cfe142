use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// One explicit point of a market time-series. Positions are 1-based;
/// a point at position k covers `[start + (k-1)*resolution, start + k*resolution)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub position: u32,
    /// Raw market price, EUR/MWh.
    pub amount: f64,
}

/// A single market time-series with fixed resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution: Duration,
    /// Sorted ascending by position. Gaps repeat the preceding point's price.
    pub points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Held price at instant `t`, or `None` outside `[start, end)` or before
    /// the first explicit point.
    pub fn price_at(&self, t: DateTime<Utc>) -> Option<f64> {
        if t < self.start || t >= self.end {
            return None;
        }
        let res = self.resolution.num_seconds();
        if res <= 0 {
            return None;
        }
        let k = ((t - self.start).num_seconds() / res) as u32 + 1;
        match self.points.binary_search_by_key(&k, |p| p.position) {
            Ok(i) => Some(self.points[i].amount),
            Err(0) => None,
            Err(i) => Some(self.points[i - 1].amount),
        }
    }

    /// Held prices of every sub-slot of this series overlapping
    /// `[hour_start, hour_start + 1h)`.
    fn held_values_in_hour(&self, hour_start: DateTime<Utc>) -> Vec<f64> {
        let hour_end = hour_start + Duration::hours(1);
        if self.end <= hour_start || self.start >= hour_end {
            return Vec::new();
        }
        let res = self.resolution.num_seconds();
        if res <= 0 {
            return Vec::new();
        }
        let first_slot = if hour_start > self.start {
            (hour_start - self.start).num_seconds() / res
        } else {
            0
        };
        let mut values = Vec::new();
        let mut slot_start = self.start + Duration::seconds(first_slot * res);
        while slot_start < hour_end && slot_start < self.end {
            if slot_start >= hour_start {
                if let Some(price) = self.price_at(slot_start) {
                    values.push(price);
                }
            }
            slot_start += self.resolution;
        }
        values
    }
}

/// Immutable, hour-indexed day-ahead price map. Replaced atomically by the
/// [`store::PriceStore`](crate::prices::store::PriceStore) on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceDocument {
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub series: Vec<PriceSeries>,
    /// 13:00 local in the configured timezone, rolled to the next day once
    /// passed.
    pub cache_expiry: DateTime<Utc>,
}

impl PriceDocument {
    /// Point lookup; the latest series covering `t` wins in merged documents.
    pub fn price_at(&self, t: DateTime<Utc>) -> Option<f64> {
        if t < self.interval_start || t >= self.interval_end {
            return None;
        }
        self.series.iter().rev().find_map(|s| s.price_at(t))
    }

    /// Arithmetic mean of all sub-hour held values within
    /// `[hour_start, hour_start + 1h)`, or `None` when no values are held.
    pub fn hour_avg(&self, hour_start: DateTime<Utc>) -> Option<f64> {
        let mut values = Vec::new();
        for series in &self.series {
            values.extend(series.held_values_in_hour(hour_start));
        }
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.cache_expiry
    }

    /// Merge a next-day document into this one: series are concatenated and
    /// the interval end extended to the later end.
    pub fn merged(mut self, next: PriceDocument) -> PriceDocument {
        self.series.extend(next.series);
        self.interval_start = self.interval_start.min(next.interval_start);
        self.interval_end = self.interval_end.max(next.interval_end);
        self
    }
}

/// Wall-clock 13:00 local on the current day, rolled to the next day when
/// `now` is already at or past 13:00.
pub fn cache_expiry_after(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let mut date = local.date_naive();
    if local.time().hour() >= 13 {
        date = date.succ_opt().unwrap_or(date);
    }
    local_at_one_pm(date, tz)
}

fn local_at_one_pm(date: chrono::NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_hms_opt(13, 0, 0).expect("13:00 is a valid time");
    // earliest() resolves DST gaps and folds deterministically.
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn instant(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    fn hourly_series(start: DateTime<Utc>, prices: &[f64]) -> PriceSeries {
        PriceSeries {
            start,
            end: start + Duration::hours(prices.len() as i64),
            resolution: Duration::minutes(60),
            points: prices
                .iter()
                .enumerate()
                .map(|(i, &p)| PricePoint {
                    position: i as u32 + 1,
                    amount: p,
                })
                .collect(),
        }
    }

    fn document(series: Vec<PriceSeries>) -> PriceDocument {
        let interval_start = series.iter().map(|s| s.start).min().unwrap();
        let interval_end = series.iter().map(|s| s.end).max().unwrap();
        PriceDocument {
            interval_start,
            interval_end,
            series,
            cache_expiry: interval_end,
        }
    }

    #[test]
    fn point_lookup_round_trips_within_each_slot() {
        let start = instant(0, 0);
        let doc = document(vec![hourly_series(start, &[10.0, 20.0, 30.0])]);
        for (k, expected) in [(0, 10.0), (1, 20.0), (2, 30.0)] {
            let slot_start = start + Duration::hours(k);
            assert_eq!(doc.price_at(slot_start), Some(expected));
            assert_eq!(
                doc.price_at(slot_start + Duration::minutes(59)),
                Some(expected)
            );
        }
    }

    #[test]
    fn lookups_outside_the_interval_are_not_found() {
        let start = instant(0, 0);
        let doc = document(vec![hourly_series(start, &[10.0, 20.0])]);
        assert_eq!(doc.price_at(start - Duration::seconds(1)), None);
        assert_eq!(doc.price_at(start + Duration::hours(2)), None);
    }

    #[test]
    fn missing_positions_repeat_the_preceding_price() {
        let start = instant(0, 0);
        let series = PriceSeries {
            start,
            end: start + Duration::hours(4),
            resolution: Duration::minutes(60),
            // positions 2 and 3 absent: price held at 15.0 until position 4
            points: vec![
                PricePoint { position: 1, amount: 15.0 },
                PricePoint { position: 4, amount: 40.0 },
            ],
        };
        assert_eq!(series.price_at(start + Duration::hours(1)), Some(15.0));
        assert_eq!(series.price_at(start + Duration::hours(2)), Some(15.0));
        assert_eq!(series.price_at(start + Duration::hours(3)), Some(40.0));
    }

    #[test]
    fn hour_avg_is_mean_of_held_sub_hour_values() {
        let start = instant(0, 0);
        let series = PriceSeries {
            start,
            end: start + Duration::hours(1),
            resolution: Duration::minutes(15),
            // position 3 absent: held values are 10, 20, 20, 40
            points: vec![
                PricePoint { position: 1, amount: 10.0 },
                PricePoint { position: 2, amount: 20.0 },
                PricePoint { position: 4, amount: 40.0 },
            ],
        };
        let doc = document(vec![series]);
        let avg = doc.hour_avg(start).unwrap();
        assert!((avg - 22.5).abs() < 1e-9);
    }

    #[test]
    fn hour_avg_of_hourly_series_is_the_point_price() {
        let start = instant(0, 0);
        let doc = document(vec![hourly_series(start, &[10.0, 20.0])]);
        assert_eq!(doc.hour_avg(start + Duration::hours(1)), Some(20.0));
        assert_eq!(doc.hour_avg(start + Duration::hours(5)), None);
    }

    #[test]
    fn merged_document_spans_both_days_and_prefers_later_series() {
        let d1 = document(vec![hourly_series(instant(0, 0), &[10.0; 24])]);
        let start2 = instant(0, 0) + Duration::hours(24);
        let d2 = document(vec![hourly_series(start2, &[30.0; 24])]);
        let merged = d1.merged(d2);
        assert_eq!(merged.interval_end, start2 + Duration::hours(24));
        assert_eq!(merged.price_at(instant(5, 0)), Some(10.0));
        assert_eq!(merged.price_at(start2 + Duration::hours(5)), Some(30.0));
    }

    #[test]
    fn cache_expiry_rolls_to_next_day_at_one_pm_local() {
        let tz: Tz = "Europe/Prague".parse().unwrap();
        // 09:00 UTC = 10:00 CET (winter): expires today 13:00 local.
        let morning = Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap();
        let expiry = cache_expiry_after(morning, tz);
        assert_eq!(expiry, Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        // 13:30 local: rolls to tomorrow.
        let afternoon = Utc.with_ymd_and_hms(2025, 1, 15, 12, 30, 0).unwrap();
        let expiry = cache_expiry_after(afternoon, tz);
        assert_eq!(expiry, Utc.with_ymd_and_hms(2025, 1, 16, 12, 0, 0).unwrap());
    }

    proptest! {
        /// Every explicit point is returned verbatim anywhere inside its slot.
        #[test]
        fn explicit_points_round_trip(
            prices in proptest::collection::vec(0.0f64..500.0, 1..48),
            offset_min in 0i64..59,
        ) {
            let start = instant(0, 0);
            let series = hourly_series(start, &prices);
            for (i, &p) in prices.iter().enumerate() {
                let t = start + Duration::hours(i as i64) + Duration::minutes(offset_min);
                prop_assert_eq!(series.price_at(t), Some(p));
            }
        }
    }
}
